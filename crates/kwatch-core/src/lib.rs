//! Core of the kwatch event pipeline.
//!
//! Each stage is a separate, independently testable piece:
//!
//! - [`decoder`] turns raw probe records into [`event::SyscallEvent`]s
//! - [`process_cache`] enriches events with the identity of the process
//! - [`dedup`] merges repeated matches into a single [`event::Alert`]
//! - [`sink`] delivers finished alerts outside of the pipeline task
//!
//! Rule evaluation lives in the `rules-engine` crate, the orchestration in the
//! `kwatch` daemon.

pub mod config;
pub mod decoder;
pub mod dedup;
pub mod event;
pub mod process_cache;
pub mod sink;

pub use probe_common::time::Timestamp;
