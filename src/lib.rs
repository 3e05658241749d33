//! kwatch watches process executions and file opens reported by kernel
//! probes, and raises alerts when they match user defined rules.
//!
//! Events flow through a single pipeline:
//!
//! ```text
//! EventChannel -> decoder -> process cache -> rule engine -> deduplicator -> sinks
//! ```
//!
//! - the [event channel](probe_common::EventChannel) reads raw records from
//!   a FIFO, a recorded file or the tracefs `trace_pipe`
//! - the [decoder](kwatch_core::decoder) validates them
//! - the [process cache](kwatch_core::process_cache) adds the identity of the
//!   process which made the syscall
//! - the [rule engine](rules_engine::RuleEngine) matches events against the
//!   YAML rules
//! - the [deduplicator](kwatch_core::dedup) merges bursts of identical matches
//! - [sinks](kwatch_core::sink::AlertSink) print the alerts on the console
//!   and send them to syslog
//!
//! The [`Dispatcher`](kwatchd::Dispatcher) drives the stages in a single task.

pub mod cli;
pub mod kwatchd;

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder()
            .filter_level(level_filter)
            .format_timestamp(None)
            .format_module_path(false)
            .init();
    }
}
