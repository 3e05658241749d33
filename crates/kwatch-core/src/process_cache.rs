//! Bounded cache of process identities.
//!
//! Looking up `/proc` for every event would be too expensive, so identities
//! are cached by pid. Entries expire after a TTL: pids get reused, and a stale
//! entry would attribute events to the wrong process. When the cache is full
//! the least recently used entry is evicted.

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use probe_common::{
    procfs::{self, ProcfsError},
    time::Timestamp,
};
use thiserror::Error;

use crate::event::ProcessIdentity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub comm: String,
    pub parent_pid: Option<u32>,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error(transparent)]
    Procfs(#[from] ProcfsError),
}

/// Where process information comes from.
pub trait ProcessInfoSource {
    fn lookup(&self, pid: u32) -> Result<ProcessInfo, LookupError>;
}

/// Reads `/proc/<pid>/comm` and `/proc/<pid>/status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsSource;

impl ProcessInfoSource for ProcfsSource {
    fn lookup(&self, pid: u32) -> Result<ProcessInfo, LookupError> {
        let not_found = |err: ProcfsError| {
            if err.is_not_found() {
                LookupError::NotFound(pid)
            } else {
                LookupError::Procfs(err)
            }
        };
        let comm = procfs::get_process_comm(pid).map_err(not_found)?;
        let parent_pid = match procfs::get_process_parent_pid(pid) {
            Ok(0) => None,
            Ok(ppid) => Some(ppid),
            Err(ProcfsError::ParentNotFound(_)) => None,
            Err(err) => return Err(not_found(err)),
        };
        Ok(ProcessInfo { comm, parent_pid })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct Entry {
    identity: ProcessIdentity,
    inserted_at: Timestamp,
    /// position in the recency index
    tick: u64,
}

pub struct ProcessIdentityCache<S = ProcfsSource> {
    source: S,
    capacity: usize,
    ttl: Duration,
    entries: HashMap<u32, Entry>,
    /// recency index: lowest tick is the least recently used pid
    recency: BTreeMap<u64, u32>,
    next_tick: u64,
    stats: CacheStats,
}

impl<S: ProcessInfoSource> ProcessIdentityCache<S> {
    pub fn new(source: S, capacity: usize, ttl: Duration) -> Self {
        let capacity = if capacity == 0 {
            log::warn!("process cache capacity must be at least 1, using 1");
            1
        } else {
            capacity
        };
        Self {
            source,
            capacity,
            ttl,
            entries: HashMap::with_capacity(capacity.min(4096)),
            recency: BTreeMap::new(),
            next_tick: 0,
            stats: CacheStats::default(),
        }
    }

    /// Identity of `pid` at time `now`. Never fails: processes which can't
    /// be looked up get the [`ProcessIdentity::unknown`] identity.
    pub fn resolve(&mut self, pid: u32, now: Timestamp) -> ProcessIdentity {
        if let Some(entry) = self.entries.get(&pid) {
            if now.since(entry.inserted_at) < self.ttl {
                self.stats.hits += 1;
                let identity = entry.identity.clone();
                self.touch(pid);
                return identity;
            }
            log::trace!("process cache entry for {pid} expired");
            self.stats.expirations += 1;
            self.remove(pid);
        }

        self.stats.misses += 1;
        let identity = match self.source.lookup(pid) {
            Ok(info) => ProcessIdentity {
                pid,
                comm: info.comm,
                parent_pid: info.parent_pid,
                first_seen: now,
            },
            Err(err) => {
                log::debug!("process {pid} lookup failed: {err}");
                ProcessIdentity::unknown(pid, now)
            }
        };
        self.insert(pid, identity.clone(), now);
        identity
    }

    /// Chain of ancestors of `pid`, nearest first. Stops at init, at a loop,
    /// at an unknown process or after `max_depth` parents.
    pub fn ancestry(&mut self, pid: u32, now: Timestamp, max_depth: usize) -> Vec<ProcessIdentity> {
        let mut chain: Vec<ProcessIdentity> = Vec::new();
        let mut current = self.resolve(pid, now).parent_pid;
        while let Some(ppid) = current {
            if chain.len() >= max_depth || ppid == pid || chain.iter().any(|p| p.pid == ppid) {
                break;
            }
            let parent = self.resolve(ppid, now);
            if parent.is_unknown() {
                break;
            }
            current = if ppid <= 1 { None } else { parent.parent_pid };
            chain.push(parent);
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn insert(&mut self, pid: u32, identity: ProcessIdentity, now: Timestamp) {
        while self.entries.len() >= self.capacity {
            let Some((_, lru_pid)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&lru_pid);
            self.stats.evictions += 1;
            log::trace!("evicted process {lru_pid} from cache");
        }
        let tick = self.bump_tick();
        self.recency.insert(tick, pid);
        self.entries.insert(
            pid,
            Entry {
                identity,
                inserted_at: now,
                tick,
            },
        );
    }

    fn touch(&mut self, pid: u32) {
        let tick = self.bump_tick();
        if let Some(entry) = self.entries.get_mut(&pid) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, pid);
        }
    }

    fn remove(&mut self, pid: u32) {
        if let Some(entry) = self.entries.remove(&pid) {
            self.recency.remove(&entry.tick);
        }
    }

    fn bump_tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}
