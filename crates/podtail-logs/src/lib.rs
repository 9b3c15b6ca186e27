//! Log following for podtail
//!
//! Turns the datastore's pod events into one log monitor per started
//! container and funnels every monitor's lines into a single bounded queue.

mod backoff;
mod buffer;
mod controller;
mod filter;
mod monitor;
mod source;

pub use backoff::Backoff;
pub use buffer::LineBuffer;
pub use controller::{Controller, ControllerConfig, DEFAULT_BUFFER};
pub use filter::ContainerFilter;
pub use monitor::{MonitorConfig, MonitorError};
pub use source::{LogOptions, LogReader, LogSource};
