//! In-memory ring buffer with overwrite-oldest semantics.
//!
//! This is how a perf/ring buffer behaves from the consumer point of view when
//! the producer favors recency: the producer never blocks, and when the
//! consumer lags behind the oldest unread records are overwritten.
//!
//! [`RingProducer::forward`] puts a ring in front of any other channel: a
//! task drains the source as fast as it delivers while the consumer reads the
//! ring at its own pace.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{Notify, watch},
    time,
};

use super::{ChannelError, ChannelStats, EventChannel, SequenceTracker};
use crate::RawRecord;

/// Create a ring of `capacity` records. The channel is closed once every
/// [`RingProducer`] has been dropped and the ring has been drained.
pub fn ring_channel(capacity: usize) -> (RingProducer, RingChannel) {
    let capacity = if capacity == 0 {
        log::warn!("Invalid ring capacity 0, using 1");
        1
    } else {
        capacity
    };
    let shared = Arc::new(Shared {
        state: Mutex::new(RingState {
            records: VecDeque::with_capacity(capacity),
            capacity,
            overwritten: 0,
            producers: 1,
        }),
        notify: Notify::new(),
    });
    (
        RingProducer {
            shared: shared.clone(),
        },
        RingChannel {
            shared,
            tracker: SequenceTracker::default(),
        },
    )
}

struct Shared {
    state: Mutex<RingState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct RingState {
    records: VecDeque<RawRecord>,
    capacity: usize,
    /// records overwritten before being read
    overwritten: u64,
    /// number of live producers
    producers: usize,
}

pub struct RingProducer {
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Push a record, overwriting the oldest unread one when the ring is full.
    pub fn push(&self, record: RawRecord) {
        {
            let mut state = self.shared.lock();
            if state.records.len() == state.capacity {
                state.records.pop_front();
                state.overwritten += 1;
            }
            state.records.push_back(record);
        }
        self.shared.notify.notify_one();
    }
}

/// Outcome of [`RingProducer::forward`].
#[derive(Debug)]
pub struct Forwarded {
    /// counters of the source channel
    pub input: ChannelStats,
    /// records overwritten in the ring before being read
    pub overwritten: u64,
    /// `None` when the source was closed or shutdown was requested
    pub error: Option<ChannelError>,
}

impl RingProducer {
    /// Move records from `source` into the ring until the source ends or
    /// `shutdown` is set. Waits on the source last at most `poll_timeout`.
    ///
    /// The producer is dropped on return, so the ring closes once drained.
    pub async fn forward<C: EventChannel>(
        self,
        mut source: C,
        poll_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Forwarded {
        let error = loop {
            if *shutdown.borrow() {
                break None;
            }
            match source.next(poll_timeout).await {
                Ok(record) => self.push(record),
                Err(ChannelError::Timeout) => {}
                Err(ChannelError::Closed) => {
                    log::debug!("Input channel closed");
                    break None;
                }
                Err(err) => {
                    log::error!("Input channel failed: {err}");
                    break Some(err);
                }
            }
        };
        Forwarded {
            input: source.stats(),
            overwritten: self.shared.lock().overwritten,
            error,
        }
    }
}

impl Clone for RingProducer {
    fn clone(&self) -> Self {
        self.shared.lock().producers += 1;
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.lock();
            state.producers -= 1;
            state.producers == 0
        };
        if last {
            // wake up a consumer waiting on an empty ring
            self.shared.notify.notify_one();
        }
    }
}

pub struct RingChannel {
    shared: Arc<Shared>,
    tracker: SequenceTracker,
}

impl RingChannel {
    /// Total number of records overwritten by the producers so far.
    pub fn overwritten(&self) -> u64 {
        self.shared.lock().overwritten
    }

    fn try_pop(&mut self) -> Result<Option<RawRecord>, ChannelError> {
        let (record, overwritten) = {
            let mut state = self.shared.lock();
            match state.records.pop_front() {
                Some(record) => (record, state.overwritten),
                None if state.producers == 0 => return Err(ChannelError::Closed),
                None => return Ok(None),
            }
        };
        // Overwrites after the first read show up as sequence gaps. The ones
        // happening before it are invisible to the tracker.
        if self.tracker.is_fresh() {
            self.tracker.add_dropped(overwritten);
        }
        self.tracker.observe_record(&record);
        Ok(Some(record))
    }
}

impl EventChannel for RingChannel {
    async fn next(&mut self, timeout: Duration) -> Result<RawRecord, ChannelError> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_pop()? {
                return Ok(record);
            }
            let shared = self.shared.clone();
            if time::timeout_at(deadline, shared.notify.notified())
                .await
                .is_err()
            {
                return Err(ChannelError::Timeout);
            }
        }
    }

    fn stats(&self) -> ChannelStats {
        self.tracker.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::StreamChannel, record::RecordFields};

    const TIMEOUT: Duration = Duration::from_millis(20);

    fn record(sequence: u64) -> RawRecord {
        RawRecord::encode(&RecordFields {
            sequence,
            kind_tag: 1,
            pid: 1,
            comm: b"init",
            path: b"/sbin/init",
            timestamp: sequence,
        })
    }

    #[tokio::test]
    async fn delivers_in_arrival_order() {
        let (producer, mut channel) = ring_channel(8);
        for seq in 1..=3 {
            producer.push(record(seq));
        }
        for seq in 1..=3 {
            assert_eq!(channel.next(TIMEOUT).await.unwrap().sequence(), Some(seq));
        }
        assert!(matches!(
            channel.next(TIMEOUT).await,
            Err(ChannelError::Timeout)
        ));
        assert_eq!(
            channel.stats(),
            ChannelStats {
                delivered: 3,
                dropped: 0
            }
        );
    }

    #[tokio::test]
    async fn full_ring_overwrites_oldest() {
        let (producer, mut channel) = ring_channel(3);
        for seq in 1..=5 {
            producer.push(record(seq));
        }
        assert_eq!(channel.overwritten(), 2);
        assert_eq!(channel.next(TIMEOUT).await.unwrap().sequence(), Some(3));
        assert_eq!(channel.stats().dropped, 2);

        // overwrites after the first read are counted through the sequence gap
        for seq in 6..=10 {
            producer.push(record(seq));
        }
        assert_eq!(channel.next(TIMEOUT).await.unwrap().sequence(), Some(8));
        assert_eq!(channel.stats().dropped, 6);
    }

    #[tokio::test]
    async fn sequence_gap_is_counted_and_decoding_continues() {
        let (producer, mut channel) = ring_channel(8);
        for seq in [1, 2, 6, 7] {
            producer.push(record(seq));
        }
        for _ in 0..4 {
            channel.next(TIMEOUT).await.unwrap();
        }
        assert_eq!(
            channel.stats(),
            ChannelStats {
                delivered: 4,
                dropped: 3
            }
        );
    }

    #[tokio::test]
    async fn closes_when_producers_are_gone_and_drained() {
        let (producer, mut channel) = ring_channel(4);
        let second = producer.clone();
        producer.push(record(1));
        drop(producer);
        second.push(record(2));
        drop(second);
        assert!(channel.next(TIMEOUT).await.is_ok());
        assert!(channel.next(TIMEOUT).await.is_ok());
        assert!(matches!(
            channel.next(TIMEOUT).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn forwarding_never_waits_for_the_consumer() {
        let mut input = Vec::new();
        for seq in 1..=10 {
            input.extend_from_slice(record(seq).as_bytes());
        }
        let (producer, mut channel) = ring_channel(4);
        let (_shutdown_tx, shutdown) = watch::channel(false);

        let forwarded = producer
            .forward(StreamChannel::new(&input[..]), TIMEOUT, shutdown)
            .await;
        assert!(forwarded.error.is_none());
        assert_eq!(
            forwarded.input,
            ChannelStats {
                delivered: 10,
                dropped: 0
            }
        );
        assert_eq!(forwarded.overwritten, 6);

        for seq in 7..=10 {
            assert_eq!(channel.next(TIMEOUT).await.unwrap().sequence(), Some(seq));
        }
        assert!(matches!(
            channel.next(TIMEOUT).await,
            Err(ChannelError::Closed)
        ));
        assert_eq!(
            channel.stats(),
            ChannelStats {
                delivered: 4,
                dropped: 6
            }
        );
    }

    #[tokio::test]
    async fn forwarding_stops_on_shutdown() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (producer, mut channel) = ring_channel(4);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let handle = tokio::spawn(producer.forward(StreamChannel::new(reader), TIMEOUT, shutdown));
        shutdown_tx.send(true).unwrap();
        let forwarded = handle.await.unwrap();
        assert!(forwarded.error.is_none());
        assert_eq!(forwarded.input.delivered, 0);
        assert!(matches!(
            channel.next(TIMEOUT).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn wakes_up_on_push() {
        let (producer, mut channel) = ring_channel(4);
        let handle = tokio::spawn(async move {
            time::sleep(Duration::from_millis(10)).await;
            producer.push(record(1));
            producer
        });
        let received = channel.next(Duration::from_secs(5)).await.unwrap();
        assert_eq!(received.sequence(), Some(1));
        drop(handle.await.unwrap());
    }
}
