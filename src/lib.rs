//! rawlink - raw link-layer frame I/O
//!
//! Opens network interfaces in promiscuous mode and multiplexes them through a
//! single background poll loop. Received frames are optionally matched against
//! a BPF filter compiled from a pcap-style expression and handed to a
//! per-interface callback; frames can be sent on any open interface from any
//! thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rawlink::{compile_filter, Dispatcher};
//!
//! let dispatcher = Dispatcher::new(false)?;
//! let filter = compile_filter("arp or udp port 67")?;
//! dispatcher.open(
//!     "eth0",
//!     Arc::new(|frame: &[u8]| println!("{} bytes", frame.len())),
//!     Some(filter),
//!     false,
//!     false,
//! )?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[cfg(not(unix))]
compile_error!("rawlink supports unix targets only");

pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod port;
pub mod reporter;
pub mod waker;

pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{CaptureError, ConfigError, DispatchError, FilterError, PortError};
pub use filter::{compile_filter, FrameFilter};
pub use port::{FrameCallback, Port, Stats};
