//! Error types for rawlink.

use std::io;

use thiserror::Error;

/// Errors raised while compiling or validating a frame filter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,

    #[error("unexpected '{token}' at position {position}")]
    UnexpectedToken { token: String, position: usize },

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid field size {0}: must be 1, 2 or 4")]
    InvalidSize(u32),

    #[error("filter too complex: jump offset exceeds 255 instructions")]
    TooComplex,

    #[error("invalid BPF program: {0}")]
    InvalidProgram(String),
}

/// Errors raised while opening a capture handle on an interface.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Invalid interface name: {0:?}")]
    InvalidInterfaceName(String),

    #[error("Insufficient permissions to open {0} (need root or CAP_NET_RAW)")]
    InsufficientPermissions(String),

    #[error("Address family not supported by this system")]
    UnsupportedAddressFamily,

    #[error("Failed to create capture channel: {0}")]
    ChannelCreation(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CaptureError {
    /// Classify an OS error raised while opening `interface`.
    pub fn from_os(interface: &str, err: io::Error) -> Self {
        #[cfg(unix)]
        match err.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => {
                return CaptureError::InsufficientPermissions(interface.to_string())
            }
            Some(libc::ENODEV) | Some(libc::ENXIO) => {
                return CaptureError::InterfaceNotFound(interface.to_string())
            }
            Some(libc::EAFNOSUPPORT) => return CaptureError::UnsupportedAddressFamily,
            _ => {}
        }
        CaptureError::Io(err)
    }
}

/// Errors raised by an open port.
#[derive(Error, Debug)]
pub enum PortError {
    #[error("port {0} is closed")]
    Closed(String),

    /// A receive hiccup that goes away on its own; the caller retries later.
    #[error("transient error on {interface}: {source}")]
    Transient {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error on {interface}: {source}")]
    Io {
        interface: String,
        #[source]
        source: io::Error,
    },
}

/// Errors returned by [`Dispatcher`](crate::Dispatcher) operations.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("interface {0} is already open")]
    AlreadyOpen(String),

    #[error("interface {0} is not open")]
    NotOpen(String),

    #[error("failed to create waker: {0}")]
    Waker(#[source] io::Error),

    #[error("failed to start dispatcher thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Port(#[from] PortError),
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
