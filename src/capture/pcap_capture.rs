//! libpcap backend for unix targets without `AF_PACKET`.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use macaddr::MacAddr6;
use pcap::{Active, Capture};
use tracing::debug;

use super::{
    check_interface_name, find_interface, io_error_from_message, CaptureConfig, PacketCapture,
};
use crate::error::CaptureError;

/// A promiscuous, non-blocking libpcap handle.
///
/// The handle is not safe for concurrent use, so it sits behind a mutex
/// shared by receive and send.
pub struct PcapCapture {
    name: String,
    fd: RawFd,
    handle: Mutex<Option<Capture<Active>>>,
}

impl PcapCapture {
    pub fn open(name: &str, config: &CaptureConfig) -> Result<Self, CaptureError> {
        check_interface_name(name)?;

        let timeout_ms = i32::try_from(config.read_timeout.as_millis()).unwrap_or(i32::MAX);
        let snaplen = i32::try_from(config.buffer_size).unwrap_or(i32::MAX);

        let capture = Capture::from_device(name)
            .and_then(|c| {
                c.promisc(true)
                    .immediate_mode(true)
                    .snaplen(snaplen)
                    .timeout(timeout_ms)
                    .open()
            })
            .and_then(|c| c.setnonblock())
            .map_err(|e| classify(name, e))?;

        let fd = capture.as_raw_fd();
        debug!("Opened pcap handle on {} (fd {})", name, fd);

        Ok(Self {
            name: name.to_string(),
            fd,
            handle: Mutex::new(Some(capture)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Capture<Active>>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn classify(name: &str, err: pcap::Error) -> CaptureError {
    let message = err.to_string();
    if message.contains("ermission") || message.contains("denied") {
        CaptureError::InsufficientPermissions(name.to_string())
    } else if message.contains("No such device") || message.contains("doesn't exist") {
        CaptureError::InterfaceNotFound(name.to_string())
    } else {
        CaptureError::ChannelCreation(message)
    }
}

impl PacketCapture for PcapCapture {
    fn interface_name(&self) -> &str {
        &self.name
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut guard = self.lock();
        let capture = guard
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match capture.next_packet() {
            Ok(packet) => {
                let len = packet.data.len().min(buf.len());
                buf[..len].copy_from_slice(&packet.data[..len]);
                Ok(Some(len))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(io::Error::other(e)),
        }
    }

    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        let mut guard = self.lock();
        let capture = guard
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        capture
            .sendpacket(frame)
            .map(|()| frame.len())
            // Lets the caller pad and retry a frame the driver refused
            .map_err(|e| io_error_from_message(e.to_string()))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        self.lock().as_ref().map(|_| self.fd)
    }

    fn mac_address(&self) -> io::Result<MacAddr6> {
        find_interface(&self.name)
            .and_then(|iface| iface.mac)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no hardware address for {}", self.name),
                )
            })
    }

    fn set_link_up(&self, up: bool) -> io::Result<()> {
        let state = if up { "up" } else { "down" };
        let status = Command::new("ifconfig").arg(&self.name).arg(state).status()?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "ifconfig {} {} exited with {}",
                self.name, state, status
            )));
        }
        Ok(())
    }

    fn close(&self) {
        self.lock().take();
    }
}
