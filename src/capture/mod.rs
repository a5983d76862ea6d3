//! Packet capture abstraction.
//!
//! This module defines the `PacketCapture` trait, the OS-facing half of a
//! port, and the `CaptureFactory` that opens one per interface. The factory is
//! handed to the dispatcher so the backend can be swapped out in tests.
//!
//! Backends:
//! - `AfPacketCapture`: Linux `AF_PACKET` raw socket
//! - `PcapCapture`: libpcap handle, for the BSDs and macOS
//! - `LoopbackCapture`: in-process socket pair for tests and simulations

#[cfg(target_os = "linux")]
mod af_packet;
mod interfaces;
pub mod loopback;
#[cfg(all(unix, not(target_os = "linux")))]
mod pcap_capture;

#[cfg(target_os = "linux")]
pub use af_packet::AfPacketCapture;
pub use interfaces::{find_interface, list_interfaces, InterfaceInfo};
pub use loopback::{LoopbackFactory, LoopbackHandle};
#[cfg(all(unix, not(target_os = "linux")))]
pub use pcap_capture::PcapCapture;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use macaddr::MacAddr6;

use crate::config::Config;
use crate::error::CaptureError;

/// Largest frame we expect to read: 64 KiB plus room for a re-inserted VLAN tag.
pub const DEFAULT_BUFFER_SIZE: usize = 65536 + 4;

/// Settings applied when a capture handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Receive timeout on the handle; receives are non-blocking, this only
    /// bounds a receive that was started on a stale readiness notification.
    pub read_timeout: Duration,
    /// Receive buffer size in bytes.
    pub buffer_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl From<&Config> for CaptureConfig {
    fn from(config: &Config) -> Self {
        Self {
            read_timeout: config.read_timeout,
            buffer_size: config.buffer_size,
        }
    }
}

/// Raw frame I/O on one interface.
///
/// Implementations must allow `send` to run concurrently with `recv`;
/// handles that are not safe for that serialize internally.
pub trait PacketCapture: Send + Sync {
    /// Get the name of the interface being captured.
    fn interface_name(&self) -> &str;

    /// Receive one frame into `buf` without blocking.
    ///
    /// Returns `Ok(None)` when there is nothing to deliver: no frame was
    /// queued, or the frame was one the backend skips (our own transmissions).
    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Transmit one frame, returning the number of bytes written.
    fn send(&self, frame: &[u8]) -> io::Result<usize>;

    /// Descriptor that becomes readable when a frame is queued. `None` once closed.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Query the interface hardware address from the OS.
    fn mac_address(&self) -> io::Result<MacAddr6>;

    /// Administratively bring the interface up or down.
    fn set_link_up(&self, up: bool) -> io::Result<()>;

    /// Release the OS handle. Calling it again is a no-op.
    fn close(&self);
}

/// Opens capture handles. Injected into the dispatcher.
pub trait CaptureFactory: Send + Sync {
    fn open(
        &self,
        interface: &str,
        config: &CaptureConfig,
    ) -> Result<Box<dyn PacketCapture>, CaptureError>;
}

/// Opens the native backend for the platform this crate was built for.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCaptureFactory;

impl CaptureFactory for SystemCaptureFactory {
    #[cfg(target_os = "linux")]
    fn open(
        &self,
        interface: &str,
        config: &CaptureConfig,
    ) -> Result<Box<dyn PacketCapture>, CaptureError> {
        Ok(Box::new(AfPacketCapture::open(interface, config)?))
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn open(
        &self,
        interface: &str,
        config: &CaptureConfig,
    ) -> Result<Box<dyn PacketCapture>, CaptureError> {
        Ok(Box::new(PcapCapture::open(interface, config)?))
    }
}

/// Validate an interface name before it is handed to the OS.
pub(crate) fn check_interface_name(name: &str) -> Result<(), CaptureError> {
    // IFNAMSIZ includes the trailing NUL
    if name.is_empty() || name.len() >= 16 || name.bytes().any(|b| b == 0 || b == b'/') {
        return Err(CaptureError::InvalidInterfaceName(name.to_string()));
    }
    Ok(())
}

/// Convert a libpcap error message into an `io::Error`. libpcap reports a
/// failed write only as text, so EINVAL is recognised by its strerror.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub(crate) fn io_error_from_message(message: String) -> io::Error {
    let kind = if message.contains("Invalid argument") {
        io::ErrorKind::InvalidInput
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_name_validation() {
        assert!(check_interface_name("eth0").is_ok());
        assert!(check_interface_name("veth-long-name1").is_ok());
        assert!(check_interface_name("").is_err());
        assert!(check_interface_name("a-name-that-is-too-long").is_err());
        assert!(check_interface_name("eth\0").is_err());
    }

    #[test]
    fn test_io_error_from_message() {
        let err = io_error_from_message("send: Invalid argument".to_string());
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(err.to_string(), "send: Invalid argument");

        let err = io_error_from_message("send: Network is down".to_string());
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_capture_config_from_config() {
        let config = Config {
            read_timeout: Duration::from_millis(250),
            buffer_size: 9000,
            ..Config::default()
        };
        let capture = CaptureConfig::from(&config);
        assert_eq!(capture.read_timeout, Duration::from_millis(250));
        assert_eq!(capture.buffer_size, 9000);
    }
}
