//! Rule matching for kwatch.
//!
//! Rules are loaded from YAML files and select events by syscall kind, path
//! glob and optionally command name glob. See [`UserRule`] for the format.

mod engine;
mod ruleset;

pub use engine::{RuleEngine, RuleLoadError, UserRule};
pub use ruleset::Rule;

pub const DEFAULT_RULES_PATH: &str = "/etc/kwatch/rules";
