//! Console-based frame reporter.

use std::io::{self, Write};

use macaddr::MacAddr6;

use crate::port::Stats;
use crate::reporter::FrameReporter;

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

/// Prints one line per frame to stdout.
pub struct ConsoleReporter {
    /// Number of payload bytes shown as hex
    preview: usize,
    /// Also show VLAN priorities and the payload length
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            preview: 16,
            verbose: false,
        }
    }

    /// Show a longer hex preview plus VLAN priorities and payload length.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self.preview = if verbose { 64 } else { 16 };
        self
    }

    pub fn format_frame(&self, interface: &str, frame: &[u8]) -> String {
        let mut output = format!("[{}] {} bytes", interface, frame.len());

        if frame.len() < 14 {
            output.push_str(" (runt)");
        } else {
            let dst = mac_at(frame, 0);
            let src = mac_at(frame, 6);
            output.push_str(&format!(" {} > {}", src, dst));

            let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
            let mut offset = 14;
            while (ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ)
                && frame.len() >= offset + 4
            {
                let tci = u16::from_be_bytes([frame[offset], frame[offset + 1]]);
                output.push_str(&format!(" vlan {}", tci & 0x0fff));
                if self.verbose {
                    output.push_str(&format!(" pri {}", tci >> 13));
                }
                ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
                offset += 4;
            }
            output.push_str(&format!(" type {:#06x}", ethertype));
            if let Some(name) = ethertype_name(ethertype) {
                output.push_str(&format!(" ({})", name));
            }
            if self.verbose {
                output.push_str(&format!(" payload {}", frame.len().saturating_sub(offset)));
            }
        }

        let shown = &frame[..frame.len().min(self.preview)];
        if !shown.is_empty() {
            output.push_str(" | ");
            output.push_str(&hex(shown));
            if frame.len() > shown.len() {
                output.push_str(" ...");
            }
        }
        output
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReporter for ConsoleReporter {
    fn report(&self, interface: &str, frame: &[u8]) {
        let output = self.format_frame(interface, frame);
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", output);
    }

    fn on_start(&self, interfaces: &[String]) {
        println!("Capturing on: {}", interfaces.join(", "));
        println!("Press Ctrl+C to stop.\n");
    }

    fn on_stop(&self, stats: &[(String, Stats)]) {
        println!("\nCapture stopped.");
        for (name, stats) in stats {
            println!("{}: {}", name, stats);
        }
    }
}

fn mac_at(frame: &[u8], offset: usize) -> MacAddr6 {
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&frame[offset..offset + 6]);
    MacAddr6::from(octets)
}

fn ethertype_name(ethertype: u16) -> Option<&'static str> {
    match ethertype {
        0x0800 => Some("IPv4"),
        0x0806 => Some("ARP"),
        0x8035 => Some("RARP"),
        0x86dd => Some("IPv6"),
        0x88cc => Some("LLDP"),
        _ => None,
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
