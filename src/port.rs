//! A port: one network interface opened for raw frame I/O.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use macaddr::MacAddr6;
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureConfig, CaptureFactory, PacketCapture};
use crate::error::{CaptureError, PortError};
use crate::filter::FrameFilter;

/// Minimum Ethernet frame length, without the frame check sequence.
pub const MIN_FRAME_LEN: usize = 60;

/// Invoked on the dispatcher thread for every frame that passes the filter.
pub type FrameCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Snapshot of a port's counters.
///
/// `rx_frames` counts every frame read from the interface, including those
/// the filter discards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub rx_frames: u64,
    pub rx_octets: u64,
    pub rx_discards: u64,
    pub tx_frames: u64,
    pub tx_octets: u64,
    pub tx_errors: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx {} frames / {} bytes ({} discarded), tx {} frames / {} bytes ({} errors)",
            self.rx_frames,
            self.rx_octets,
            self.rx_discards,
            self.tx_frames,
            self.tx_octets,
            self.tx_errors
        )
    }
}

#[derive(Default)]
struct Counters {
    rx_frames: AtomicU64,
    rx_octets: AtomicU64,
    rx_discards: AtomicU64,
    tx_frames: AtomicU64,
    tx_octets: AtomicU64,
    tx_errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_octets: self.rx_octets.load(Ordering::Relaxed),
            rx_discards: self.rx_discards.load(Ordering::Relaxed),
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_octets: self.tx_octets.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(by as u64, Ordering::Relaxed);
}

/// Owns the capture handle of one interface.
///
/// Only the dispatcher loop receives on a port; `send` may be called from
/// any thread at the same time.
pub struct Port {
    name: String,
    capture: Box<dyn PacketCapture>,
    on_frame: FrameCallback,
    filter: Option<FrameFilter>,
    verbose: bool,
    buffer: Mutex<Vec<u8>>,
    mac: OnceLock<MacAddr6>,
    counters: Counters,
    closed: AtomicBool,
}

impl Port {
    /// Open `name` with default capture settings.
    pub fn open(
        factory: &dyn CaptureFactory,
        name: &str,
        on_frame: FrameCallback,
        filter: Option<FrameFilter>,
        verbose: bool,
    ) -> Result<Self, CaptureError> {
        Self::open_with_config(
            factory,
            name,
            on_frame,
            filter,
            verbose,
            &CaptureConfig::default(),
        )
    }

    pub fn open_with_config(
        factory: &dyn CaptureFactory,
        name: &str,
        on_frame: FrameCallback,
        filter: Option<FrameFilter>,
        verbose: bool,
        config: &CaptureConfig,
    ) -> Result<Self, CaptureError> {
        let capture = factory.open(name, config)?;
        info!(
            "Opened port {}{}",
            name,
            filter
                .as_ref()
                .map(|f| format!(" with filter \"{}\"", f))
                .unwrap_or_default()
        );

        Ok(Self {
            name: name.to_string(),
            capture,
            on_frame,
            filter,
            verbose,
            buffer: Mutex::new(vec![0u8; config.buffer_size.max(MIN_FRAME_LEN)]),
            mac: OnceLock::new(),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> Option<&FrameFilter> {
        self.filter.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Hardware address of the interface, read from the OS once and cached.
    pub fn mac_address(&self) -> Result<MacAddr6, PortError> {
        if let Some(mac) = self.mac.get() {
            return Ok(*mac);
        }
        let mac = self.capture.mac_address().map_err(|e| self.io_error(e))?;
        Ok(*self.mac.get_or_init(|| mac))
    }

    /// Receive one frame without blocking. `Ok(None)` if nothing was queued.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, PortError> {
        if self.is_closed() {
            return Err(PortError::Closed(self.name.clone()));
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        match self.capture.recv(&mut buffer) {
            Ok(Some(len)) => {
                bump(&self.counters.rx_frames, 1);
                bump(&self.counters.rx_octets, len);
                Ok(Some(buffer[..len].to_vec()))
            }
            Ok(None) => Ok(None),
            Err(e) if is_transient(&e) => Err(PortError::Transient {
                interface: self.name.clone(),
                source: e,
            }),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Transmit a frame. A frame shorter than 60 bytes that the OS refuses
    /// as invalid is zero-padded to 60 bytes and sent once more.
    pub fn send(&self, frame: &[u8]) -> Result<usize, PortError> {
        if self.is_closed() {
            return Err(PortError::Closed(self.name.clone()));
        }

        let result = match self.capture.send(frame) {
            Err(e) if e.kind() == io::ErrorKind::InvalidInput && frame.len() < MIN_FRAME_LEN => {
                let mut padded = frame.to_vec();
                padded.resize(MIN_FRAME_LEN, 0);
                if self.verbose {
                    debug!(
                        "{}: padding {}-byte frame to {} bytes",
                        self.name,
                        frame.len(),
                        MIN_FRAME_LEN
                    );
                }
                self.capture.send(&padded)
            }
            other => other,
        };

        match result {
            Ok(written) => {
                bump(&self.counters.tx_frames, 1);
                bump(&self.counters.tx_octets, written);
                if self.verbose {
                    debug!("{}: sent {} bytes", self.name, written);
                }
                Ok(written)
            }
            Err(e) => {
                bump(&self.counters.tx_errors, 1);
                Err(self.io_error(e))
            }
        }
    }

    /// Bring the interface up. Failures are logged, not returned.
    pub fn up(&self) -> bool {
        self.set_link(true)
    }

    /// Bring the interface down. Failures are logged, not returned.
    pub fn down(&self) -> bool {
        self.set_link(false)
    }

    fn set_link(&self, up: bool) -> bool {
        match self.capture.set_link_up(up) {
            Ok(()) => {
                info!("{} is now {}", self.name, if up { "up" } else { "down" });
                true
            }
            Err(e) => {
                warn!(
                    "Could not bring {} {}: {}",
                    self.name,
                    if up { "up" } else { "down" },
                    e
                );
                false
            }
        }
    }

    /// Release the capture handle. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.capture.close();
        info!("Closed port {}", self.name);
    }

    pub fn statistics(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Descriptor polled by the dispatcher. `None` once closed.
    pub fn raw_fd(&self) -> Option<RawFd> {
        if self.is_closed() {
            return None;
        }
        self.capture.raw_fd()
    }

    /// Receive one frame and hand it to the callback if it passes the filter.
    ///
    /// Receive errors never escape: transient ones are retried on the next
    /// readiness, anything else is logged and counted as a discard.
    pub fn dispatch(&self) {
        let frame = match self.recv() {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(PortError::Closed(_)) => return,
            Err(e @ PortError::Transient { .. }) => {
                debug!("{}", e);
                return;
            }
            Err(e) => {
                // Raced with close
                if self.is_closed() {
                    return;
                }
                bump(&self.counters.rx_discards, 1);
                warn!("Receive failed: {}", e);
                return;
            }
        };

        if let Some(filter) = &self.filter {
            if !filter.matches(&frame) {
                bump(&self.counters.rx_discards, 1);
                if self.verbose {
                    debug!("{}: filtered {}-byte frame", self.name, frame.len());
                }
                return;
            }
        }

        if self.verbose {
            debug!("{}: received {} bytes", self.name, frame.len());
        }

        let on_frame = &self.on_frame;
        if panic::catch_unwind(AssertUnwindSafe(|| on_frame(&frame))).is_err() {
            error!("Frame callback for {} panicked", self.name);
        }
    }

    fn io_error(&self, source: io::Error) -> PortError {
        PortError::Io {
            interface: self.name.clone(),
            source,
        }
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .field("closed", &self.is_closed())
            .field("stats", &self.statistics())
            .finish()
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.close();
    }
}

/// Errors seen right after an interface appears, or on a spurious wakeup.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENETDOWN) | Some(libc::ENXIO) | Some(libc::EINTR) | Some(libc::EAGAIN)
    ) || matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::LoopbackFactory;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback() -> (FrameCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let callback: FrameCallback = Arc::new(move |_frame: &[u8]| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    fn factory() -> LoopbackFactory {
        LoopbackFactory::new().with_interface("veth0", MacAddr6::new(2, 0, 0, 0, 0, 1))
    }

    #[test]
    fn test_open_unknown_interface() {
        let (callback, _) = counting_callback();
        let err = Port::open(&factory(), "eth7", callback, None, false).unwrap_err();
        assert!(matches!(err, CaptureError::InterfaceNotFound(_)));
    }

    #[test]
    fn test_dispatch_applies_filter() {
        let factory = factory();
        let handle = factory.handle("veth0").unwrap();
        let (callback, count) = counting_callback();
        let filter = FrameFilter::compile("ether[0:2] == 0xaaaa").unwrap();
        let port = Port::open(&factory, "veth0", callback, Some(filter), false).unwrap();

        let mut matching = vec![0u8; 60];
        matching[..2].copy_from_slice(&[0xaa, 0xaa]);
        handle.inject(&matching).unwrap();
        handle.inject(&[0xbb; 60]).unwrap();

        port.dispatch();
        port.dispatch();
        // Nothing queued
        port.dispatch();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let stats = port.statistics();
        assert_eq!(stats.rx_frames, 2);
        assert_eq!(stats.rx_octets, 120);
        assert_eq!(stats.rx_discards, 1);
    }

    #[test]
    fn test_receive_errors() {
        let factory = factory();
        let handle = factory.handle("veth0").unwrap();
        let (callback, count) = counting_callback();
        let port = Port::open(&factory, "veth0", callback, None, false).unwrap();

        handle.fail_recv(libc::ENETDOWN);
        handle.fail_recv(libc::EIO);
        handle.inject(&[0; 60]).unwrap();

        // Transient: swallowed, not counted
        port.dispatch();
        assert_eq!(port.statistics(), Stats::default());

        port.dispatch();
        assert_eq!(port.statistics().rx_discards, 1);

        port.dispatch();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let stats = port.statistics();
        assert_eq!(stats.rx_frames, 1);
        assert_eq!(stats.rx_discards, 1);
        assert!(!port.is_closed());
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let factory = factory();
        let handle = factory.handle("veth0").unwrap();
        let callback: FrameCallback = Arc::new(|_frame: &[u8]| panic!("bad callback"));
        let port = Port::open(&factory, "veth0", callback, None, false).unwrap();

        handle.inject(&[0; 60]).unwrap();
        handle.inject(&[0; 60]).unwrap();
        port.dispatch();
        port.dispatch();

        assert_eq!(port.statistics().rx_frames, 2);
    }

    #[test]
    fn test_send_pads_runt_frames() {
        let factory = LoopbackFactory::new()
            .reject_runts(true)
            .with_interface("veth0", MacAddr6::nil());
        let handle = factory.handle("veth0").unwrap();
        let (callback, _) = counting_callback();
        let port = Port::open(&factory, "veth0", callback, None, false).unwrap();

        assert_eq!(port.send(&[0xff; 14]).unwrap(), MIN_FRAME_LEN);

        let sent = handle.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), MIN_FRAME_LEN);
        assert_eq!(&sent[0][..14], &[0xff; 14]);
        assert!(sent[0][14..].iter().all(|&b| b == 0));

        let stats = port.statistics();
        assert_eq!(stats.tx_frames, 1);
        assert_eq!(stats.tx_octets, 60);
        assert_eq!(stats.tx_errors, 0);
    }

    #[test]
    fn test_send_failure_counts_error() {
        let factory = factory();
        let (callback, _) = counting_callback();
        let port = Port::open(&factory, "veth0", callback, None, false).unwrap();

        assert!(port.down());
        assert!(matches!(port.send(&[0; 60]), Err(PortError::Io { .. })));
        let stats = port.statistics();
        assert_eq!(stats.tx_frames, 0);
        assert_eq!(stats.tx_errors, 1);

        assert!(port.up());
        assert_eq!(port.send(&[0; 60]).unwrap(), 60);
        assert_eq!(port.statistics().tx_frames, 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let factory = factory();
        let handle = factory.handle("veth0").unwrap();
        let (callback, _) = counting_callback();
        let port = Port::open(&factory, "veth0", callback, None, false).unwrap();
        assert!(port.raw_fd().is_some());

        port.close();
        port.close();
        assert!(port.is_closed());
        assert!(port.raw_fd().is_none());
        assert!(!handle.is_open());
        assert!(matches!(port.send(&[0; 60]), Err(PortError::Closed(_))));
        assert!(matches!(port.recv(), Err(PortError::Closed(_))));
        // Receive path stays quiet after close
        port.dispatch();
        assert_eq!(port.statistics().rx_discards, 0);
    }

    #[test]
    fn test_mac_address_is_cached() {
        let factory = factory();
        let (callback, _) = counting_callback();
        let port = Port::open(&factory, "veth0", callback, None, false).unwrap();
        assert_eq!(port.mac_address().unwrap(), MacAddr6::new(2, 0, 0, 0, 0, 1));
        assert_eq!(port.mac_address().unwrap(), MacAddr6::new(2, 0, 0, 0, 0, 1));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENETDOWN)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENXIO)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EINTR)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EINVAL)));
    }
}
