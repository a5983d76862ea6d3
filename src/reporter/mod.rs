//! Reporting of received frames.
//!
//! The CLI hands every delivered frame to a `FrameReporter`; the console
//! implementation prints a one-line summary per frame.

mod console_reporter;

pub use console_reporter::ConsoleReporter;

use crate::port::Stats;

/// Receives frames from the dispatcher thread.
pub trait FrameReporter: Send + Sync {
    /// Report one frame received on `interface`.
    fn report(&self, interface: &str, frame: &[u8]);

    /// Called once the interfaces are open.
    fn on_start(&self, interfaces: &[String]);

    /// Called after capture stops, with the final counters per interface.
    fn on_stop(&self, stats: &[(String, Stats)]);
}
