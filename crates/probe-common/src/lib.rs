//! Shared plumbing for the probe side of kwatch.
//!
//! The in-kernel probes are not part of this crate: they are loaded by an
//! external loader which hands us an already opened event source. This crate
//! models that boundary:
//!
//! - [`record`]: the fixed-layout raw record written by the probes
//! - [`channel`]: the [`EventChannel`] abstraction and its implementations
//! - [`time`]: monotonic timestamps as produced by `bpf_ktime_get_ns`
//! - [`procfs`]: helpers to read process information from `/proc`

pub mod channel;
pub mod procfs;
pub mod record;
pub mod time;

pub use channel::{ChannelError, ChannelStats, EventChannel};
pub use record::RawRecord;

/// Utility function to pretty print an error with its sources.
///
/// We use this because by default Rust won't print the source of an error message,
/// making it much less useful. Instead of re-implementing that, we'll just use
/// anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}
