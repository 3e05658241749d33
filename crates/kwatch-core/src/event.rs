use std::fmt;

use probe_common::{
    record::{COMM_LEN, KIND_EXEC, KIND_OPENAT, KIND_OPENAT2, PATH_LEN},
    time::Timestamp,
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Syscalls observed by the probes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SyscallKind {
    Exec,
    OpenAt,
    OpenAt2,
}

impl SyscallKind {
    pub const ALL: [SyscallKind; 3] = [SyscallKind::Exec, SyscallKind::OpenAt, SyscallKind::OpenAt2];

    /// Map the probe `kind_tag` to a kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            KIND_EXEC => Some(SyscallKind::Exec),
            KIND_OPENAT => Some(SyscallKind::OpenAt),
            KIND_OPENAT2 => Some(SyscallKind::OpenAt2),
            _ => None,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            SyscallKind::Exec => KIND_EXEC,
            SyscallKind::OpenAt => KIND_OPENAT,
            SyscallKind::OpenAt2 => KIND_OPENAT2,
        }
    }
}

/// A decoded syscall. `comm` and `path` never exceed [`COMM_LEN`] and
/// [`PATH_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallEvent {
    /// sequence number stamped by the probe
    pub sequence: u64,
    pub kind: SyscallKind,
    pub pid: u32,
    pub comm: String,
    pub path: String,
    pub timestamp: Timestamp,
}

impl SyscallEvent {
    /// Build an event, truncating `comm` and `path` to their bound.
    pub fn new(
        sequence: u64,
        kind: SyscallKind,
        pid: u32,
        comm: &str,
        path: &str,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            sequence,
            kind,
            pid,
            comm: truncate_str(comm, COMM_LEN).to_string(),
            path: truncate_str(path, PATH_LEN).to_string(),
            timestamp,
        }
    }
}

impl fmt::Display for SyscallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} #{}] {} ({}) {} {}",
            self.timestamp, self.sequence, self.comm, self.pid, self.kind, self.path
        )
    }
}

/// Longest prefix of `s` which fits in `max` bytes without splitting a char.
pub fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `comm` of a process which couldn't be looked up.
pub const UNKNOWN_COMM: &str = "unknown";

/// Identity of a process as known by the
/// [`ProcessIdentityCache`](crate::process_cache::ProcessIdentityCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub comm: String,
    pub parent_pid: Option<u32>,
    pub first_seen: Timestamp,
}

impl ProcessIdentity {
    /// Sentinel identity used when the process lookup failed.
    pub fn unknown(pid: u32, now: Timestamp) -> Self {
        Self {
            pid,
            comm: UNKNOWN_COMM.to_string(),
            parent_pid: None,
            first_seen: now,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.comm == UNKNOWN_COMM && self.parent_pid.is_none()
    }
}

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A rule matching an event. Borrowed from the rule engine and the pipeline
/// stage, it lives until the deduplicator consumed it.
#[derive(Debug, Clone, Copy)]
pub struct Match<'a> {
    pub rule_id: &'a str,
    pub severity: Severity,
    pub event: &'a SyscallEvent,
    pub identity: &'a ProcessIdentity,
}

/// Repeated matches of a rule for the same process and path, merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub rule_id: String,
    pub severity: Severity,
    pub kind: SyscallKind,
    pub comm: String,
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub path: String,
    pub first_occurrence: Timestamp,
    pub last_occurrence: Timestamp,
    /// always >= 1
    pub occurrence_count: u64,
}

impl Alert {
    pub fn from_match(m: &Match) -> Self {
        Self {
            rule_id: m.rule_id.to_string(),
            severity: m.severity,
            kind: m.event.kind,
            comm: m.event.comm.clone(),
            pid: m.event.pid,
            parent_pid: m.identity.parent_pid,
            path: m.event.path.clone(),
            first_occurrence: m.event.timestamp,
            last_occurrence: m.event.timestamp,
            occurrence_count: 1,
        }
    }

    /// Account for one more occurrence.
    pub fn record(&mut self, timestamp: Timestamp) {
        self.occurrence_count += 1;
        self.last_occurrence = self.last_occurrence.max(timestamp);
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let process_info = match self.parent_pid {
            Some(ppid) => format!("{} ({}, parent {})", self.comm, self.pid, ppid),
            None => format!("{} ({})", self.comm, self.pid),
        };
        let occurrences = if self.occurrence_count > 1 {
            format!(
                " x{} [{} .. {}]",
                self.occurrence_count, self.first_occurrence, self.last_occurrence
            )
        } else {
            format!(" [{}]", self.first_occurrence)
        };
        let Alert {
            rule_id,
            severity,
            kind,
            path,
            ..
        } = self;
        if f.alternate() {
            let color = match severity {
                Severity::Low => "1;30;46",
                Severity::Medium => "1;30;43",
                Severity::High | Severity::Critical => "1;37;41",
            };
            write!(
                f,
                "[\x1b[{color}m{severity} ALERT\x1b[0m {process_info}] [{rule_id}] {kind} {path}{occurrences}"
            )
        } else {
            write!(
                f,
                "[{severity} ALERT {process_info}] [{rule_id}] {kind} {path}{occurrences}"
            )
        }
    }
}
