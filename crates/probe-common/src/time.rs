use std::{
    fmt,
    ops::{Add, Sub},
    time::Duration,
};

use nix::time::{ClockId, clock_gettime};
use serde::{Deserialize, Serialize};

/// Nanoseconds since boot, on the same clock used by `bpf_ktime_get_ns`
/// (CLOCK_MONOTONIC). Timestamps coming from the probes and the ones taken
/// in user-space with [`Timestamp::now`] can be compared directly.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn now() -> Self {
        clock_gettime(ClockId::CLOCK_MONOTONIC)
            .map(|ts| Self(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64))
            .unwrap_or_default()
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is in the future.
    pub fn since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl From<u64> for Timestamp {
    fn from(ns: u64) -> Self {
        Self(ns)
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, ns: u64) -> Self::Output {
        Self(self.0.saturating_add(ns))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, duration: Duration) -> Self::Output {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self + ns
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, other: Timestamp) -> Self::Output {
        Self(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / 1_000_000_000, self.0 % 1_000_000_000)
    }
}
