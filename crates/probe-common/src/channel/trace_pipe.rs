//! Legacy probes report events with `bpf_trace_printk`, which ends up as text
//! lines in the tracefs `trace_pipe`. This module turns those lines back into
//! [`RawRecord`]s so they can flow through the same pipeline as the binary
//! records.
//!
//! Supported messages:
//!
//! ```text
//! [ALERT] Exec: <filename> (PID <pid>)
//! [.env READ] Process: <comm>
//!              File: <filename>
//! ```
//!
//! The two `openat` lines are paired using the pid in the ftrace prefix.
//! `trace_pipe` doesn't tell `openat` from `openat2`, both are reported as
//! `openat`.

use std::{collections::HashMap, io, path::Path, time::Duration};

use bytes::BytesMut;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time,
};

use super::{ChannelError, ChannelStats, EventChannel, PipeReader, SequenceTracker};
use crate::{
    RawRecord,
    record::{KIND_EXEC, KIND_OPENAT, RecordFields},
};

pub const TRACE_PIPE_PATH: &str = "/sys/kernel/debug/tracing/trace_pipe";

/// Upper bound of `openat` headers waiting for their `File:` line.
const MAX_PENDING_OPENS: usize = 1024;

lazy_static! {
    /// ftrace line: `<comm>-<pid> [cpu] <flags> <secs>.<frac>: bpf_trace_printk: <msg>`
    static ref RE_TRACE_LINE: Regex = Regex::new(
        r"^\s*(?P<comm>.+?)-(?P<pid>\d+)\s+(?:\(\s*\S+\s*\)\s+)?\[\d+\]\s+(?:\S+\s+)?(?P<secs>\d+)\.(?P<frac>\d+):\s+(?:bpf_trace_printk|\d+):\s?(?P<msg>.*)$"
    ).unwrap();
    /// Marker written by ftrace when its per-cpu buffer overflowed.
    static ref RE_LOST_EVENTS: Regex = Regex::new(r"^CPU:\d+ \[LOST (?P<count>\d+) EVENTS\]").unwrap();
    static ref RE_EXEC: Regex = Regex::new(r"^\[ALERT\] Exec: (?P<path>.*) \(PID (?P<pid>\d+)\)\s*$").unwrap();
    static ref RE_OPEN_PROCESS: Regex = Regex::new(r"^\[\.env READ\] Process: (?P<comm>.*?)\s*$").unwrap();
    static ref RE_OPEN_FILE: Regex = Regex::new(r"^\s*File: (?P<path>.*?)\s*$").unwrap();
}

pub struct TracePipeChannel<R = PipeReader> {
    reader: R,
    buffer: BytesMut,
    /// comm reported by an `openat` header line, by pid
    pending_opens: HashMap<u32, String>,
    next_sequence: u64,
    tracker: SequenceTracker,
    eof: bool,
}

impl TracePipeChannel<PipeReader> {
    /// Open the tracefs pipe. Only one reader at a time gets the lines.
    pub fn open() -> io::Result<Self> {
        Self::open_path(Path::new(TRACE_PIPE_PATH))
    }

    pub fn open_path(path: &Path) -> io::Result<Self> {
        let reader = PipeReader::open(path)?;
        log::info!("Reading events from {}", path.display());
        Ok(Self::new(reader))
    }
}

impl<R> TracePipeChannel<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4096),
            pending_opens: HashMap::new(),
            next_sequence: 0,
            tracker: SequenceTracker::default(),
            eof: false,
        }
    }

    fn handle_line(&mut self, line: &[u8]) -> Option<RawRecord> {
        let line = String::from_utf8_lossy(line);
        if let Some(caps) = RE_LOST_EVENTS.captures(&line) {
            let count = caps["count"].parse().unwrap_or(0);
            self.tracker.add_dropped(count);
            return None;
        }
        let Some(trace) = parse_trace_line(&line) else {
            log::trace!(target: "trace_pipe", "ignoring {line}");
            return None;
        };

        if let Some(caps) = RE_EXEC.captures(trace.msg) {
            let pid = caps["pid"].parse().unwrap_or(trace.pid);
            return Some(self.record(KIND_EXEC, pid, trace.comm, &caps["path"], trace.timestamp));
        }
        if let Some(caps) = RE_OPEN_PROCESS.captures(trace.msg) {
            if self.pending_opens.len() >= MAX_PENDING_OPENS {
                log::warn!("Too many unpaired openat lines, discarding them");
                self.pending_opens.clear();
            }
            self.pending_opens
                .insert(trace.pid, caps["comm"].to_string());
            return None;
        }
        if let Some(caps) = RE_OPEN_FILE.captures(trace.msg) {
            let comm = self
                .pending_opens
                .remove(&trace.pid)
                .unwrap_or_else(|| trace.comm.to_string());
            return Some(self.record(KIND_OPENAT, trace.pid, &comm, &caps["path"], trace.timestamp));
        }
        log::trace!(target: "trace_pipe", "unknown message {}", trace.msg);
        None
    }

    fn record(&mut self, kind_tag: u8, pid: u32, comm: &str, path: &str, timestamp: u64) -> RawRecord {
        self.next_sequence += 1;
        RawRecord::encode(&RecordFields {
            sequence: self.next_sequence,
            kind_tag,
            pid,
            comm: comm.as_bytes(),
            path: path.as_bytes(),
            timestamp,
        })
    }
}

impl<R> EventChannel for TracePipeChannel<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next(&mut self, timeout: Duration) -> Result<RawRecord, ChannelError> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(newline) = self.buffer.iter().position(|&c| c == b'\n') {
                let line = self.buffer.split_to(newline + 1);
                if let Some(record) = self.handle_line(&line[..newline]) {
                    self.tracker.observe_record(&record);
                    return Ok(record);
                }
                continue;
            }
            if self.eof {
                return Err(ChannelError::Closed);
            }
            match time::timeout_at(deadline, self.reader.read_buf(&mut self.buffer)).await {
                Err(_) => return Err(ChannelError::Timeout),
                Ok(Ok(0)) => {
                    self.eof = true;
                    // a last line without terminator is still a line
                    if !self.buffer.is_empty() {
                        self.buffer.extend_from_slice(b"\n");
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(ChannelError::Io(err)),
            }
        }
    }

    fn stats(&self) -> ChannelStats {
        self.tracker.stats()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct TraceLine<'a> {
    comm: &'a str,
    /// thread id of the task which printed the line
    pid: u32,
    timestamp: u64,
    msg: &'a str,
}

fn parse_trace_line(line: &str) -> Option<TraceLine<'_>> {
    let caps = RE_TRACE_LINE.captures(line)?;
    let secs: u64 = caps.name("secs")?.as_str().parse().ok()?;
    let frac = caps.name("frac")?.as_str();
    // fraction is usually in microseconds, normalize to nanoseconds
    let frac = &frac[..frac.len().min(9)];
    let nanos: u64 = frac.parse::<u64>().ok()? * 10u64.pow(9 - frac.len() as u32);
    let timestamp = secs.checked_mul(1_000_000_000)?.checked_add(nanos)?;
    Some(TraceLine {
        comm: caps.name("comm")?.as_str(),
        pid: caps.name("pid")?.as_str().parse().ok()?,
        timestamp,
        msg: caps.name("msg")?.as_str(),
    })
}
