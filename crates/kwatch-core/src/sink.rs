//! Alert delivery.
//!
//! The pipeline hands finished alerts to a bounded queue and never waits on
//! output. A separate task drains the queue and emits every alert on each
//! [`AlertSink`], retrying failed emits with exponential backoff.

use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{
    config::{ConfigError, SectionConfig},
    event::Alert,
};

/// Destination of alerts.
pub trait AlertSink: Send {
    fn name(&self) -> &str;

    fn emit(&mut self, alert: &Alert) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error")]
    Io(#[from] io::Error),
    #[error("error serializing alert: {0}")]
    Serialize(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// emits tried for each alert and sink, at least 1
    pub max_attempts: u32,
    /// wait before the first retry, doubled at each attempt
    pub backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl TryFrom<&SectionConfig> for DeliveryConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        let default = Self::default();
        Ok(Self {
            max_attempts: config
                .with_default("max_attempts", default.max_attempts)?
                .max(1),
            backoff: config.millis_with_default("backoff_ms", 50)?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    /// successful emits, counted once per sink
    pub delivered: u64,
    pub retries: u64,
    /// alerts given up on a sink after `max_attempts`
    pub dropped: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("alert queue is full")]
    Full,
    #[error("alert queue is closed")]
    Closed,
}

/// Producer side of the alert queue.
#[derive(Debug, Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<Alert>,
}

impl AlertSender {
    /// Enqueue without waiting. The alert is lost on error.
    pub fn try_send(&self, alert: Alert) -> Result<(), QueueError> {
        self.tx.try_send(alert).map_err(|err| match err {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Enqueue, waiting for free space.
    pub async fn send(&self, alert: Alert) -> Result<(), QueueError> {
        self.tx.send(alert).await.map_err(|_| QueueError::Closed)
    }
}

/// Bounded alert queue. [`spawn_delivery`] consumes the receiving side.
pub fn alert_queue(queue_size: usize) -> (AlertSender, mpsc::Receiver<Alert>) {
    let queue_size = if queue_size == 0 {
        log::warn!("alert queue size must be at least 1, using 1");
        1
    } else {
        queue_size
    };
    let (tx, rx) = mpsc::channel(queue_size);
    (AlertSender { tx }, rx)
}

/// Start the delivery task. It exits once every [`AlertSender`] is dropped
/// and the queue is drained, returning its counters.
pub fn spawn_delivery(
    sinks: Vec<Box<dyn AlertSink>>,
    config: DeliveryConfig,
    queue_size: usize,
) -> (AlertSender, JoinHandle<DeliveryStats>) {
    let (sender, mut rx) = alert_queue(queue_size);
    let handle = tokio::spawn(async move {
        let mut sinks = sinks;
        let mut stats = DeliveryStats::default();
        while let Some(alert) = rx.recv().await {
            for sink in sinks.iter_mut() {
                deliver(sink.as_mut(), &alert, &config, &mut stats).await;
            }
        }
        log::debug!("alert delivery stopped: {stats:?}");
        stats
    });
    (sender, handle)
}

async fn deliver(
    sink: &mut dyn AlertSink,
    alert: &Alert,
    config: &DeliveryConfig,
    stats: &mut DeliveryStats,
) {
    let max_attempts = config.max_attempts.max(1);
    for attempt in 0..max_attempts {
        match sink.emit(alert) {
            Ok(()) => {
                stats.delivered += 1;
                return;
            }
            Err(err) if attempt + 1 < max_attempts => {
                let wait = config.backoff.saturating_mul(1 << attempt.min(16));
                log::debug!(
                    "{} failed to emit alert ({err}), retrying in {wait:?}",
                    sink.name()
                );
                stats.retries += 1;
                tokio::time::sleep(wait).await;
            }
            Err(err) => {
                log::warn!(
                    "{} dropped alert {} after {max_attempts} attempts: {err}",
                    sink.name(),
                    alert.rule_id
                );
                stats.dropped += 1;
            }
        }
    }
}

/// Keeps alerts in memory. Clones share the same storage, so a clone can be
/// kept to inspect what a sink given to [`spawn_delivery`] received.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    alerts: Arc<Mutex<Vec<Alert>>>,
    /// emits left to fail before succeeding
    failures: Arc<Mutex<u32>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink failing its first `count` emits.
    pub fn failing(count: u32) -> Self {
        Self {
            alerts: Arc::default(),
            failures: Arc::new(Mutex::new(count)),
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn emit(&mut self, alert: &Alert) -> Result<(), SinkError> {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if *failures > 0 {
            *failures -= 1;
            return Err(SinkError::Unavailable("injected failure".to_string()));
        }
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}
