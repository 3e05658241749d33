//! [`EventChannel`] abstracts the source of raw records produced by the probes.
//!
//! Every implementation delivers records in arrival order and accounts for
//! lost records through a [`SequenceTracker`]: the probes stamp each record
//! with a monotonically increasing sequence number, so a jump in the sequence
//! means records were lost (overwritten in the ring, or dropped kernel side).

use std::{future::Future, io, time::Duration};

use thiserror::Error;

use crate::RawRecord;

mod pipe;
mod ring;
mod stream;
mod trace_pipe;

pub use pipe::PipeReader;
pub use ring::{Forwarded, RingChannel, RingProducer, ring_channel};
pub use stream::StreamChannel;
pub use trace_pipe::{TRACE_PIPE_PATH, TracePipeChannel};

pub trait EventChannel: Send {
    /// Wait at most `timeout` for the next record.
    fn next(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<RawRecord, ChannelError>> + Send;

    fn stats(&self) -> ChannelStats;
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no event received before timeout")]
    Timeout,
    #[error("event channel closed")]
    Closed,
    #[error("reading event channel")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// A fatal error means the channel will never deliver again.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::Timeout)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    /// Records handed to the consumer.
    pub delivered: u64,
    /// Records known to be lost before reaching the consumer.
    pub dropped: u64,
}

/// Detects lost records from gaps in the probe sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: Option<u64>,
    stats: ChannelStats,
}

impl SequenceTracker {
    /// Account for a delivered record. Returns the number of records lost
    /// right before this one.
    pub fn observe(&mut self, sequence: u64) -> u64 {
        self.stats.delivered += 1;
        let gap = match self.last {
            Some(last) if sequence > last => sequence - last - 1,
            Some(last) => {
                log::warn!("sequence number went from {last} to {sequence}, probe restarted?");
                0
            }
            None => 0,
        };
        if gap > 0 {
            log::warn!("Lost {gap} events before sequence {sequence}");
            self.stats.dropped += gap;
        }
        self.last = Some(sequence);
        gap
    }

    /// Account for a delivered record which carries no sequence number.
    pub fn observe_unsequenced(&mut self) {
        self.stats.delivered += 1;
    }

    /// Account for records lost in a way the sequence can't reveal.
    pub fn add_dropped(&mut self, count: u64) {
        if count > 0 {
            log::warn!("Lost {count} events");
            self.stats.dropped += count;
        }
    }

    /// True until the first record has been observed.
    pub fn is_fresh(&self) -> bool {
        self.last.is_none() && self.stats.delivered == 0
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    fn observe_record(&mut self, record: &RawRecord) {
        match record.sequence() {
            Some(sequence) => {
                self.observe(sequence);
            }
            None => self.observe_unsequenced(),
        }
    }
}
