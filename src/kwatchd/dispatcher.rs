use std::{fmt, time::Duration};

use kwatch_core::{
    Timestamp,
    decoder,
    dedup::AlertDeduplicator,
    event::{Alert, SyscallKind},
    process_cache::{CacheStats, ProcessIdentityCache, ProcessInfoSource, ProcfsSource},
    sink::{AlertSender, DeliveryStats, QueueError},
};
use probe_common::{ChannelError, ChannelStats, EventChannel, RawRecord, channel::Forwarded};
use rules_engine::RuleEngine;
use tokio::sync::{mpsc, watch};

/// Parents printed in debug logs for each match.
const ANCESTRY_DEPTH: usize = 8;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound of a single wait on the channel. Shutdown requests are
    /// noticed within this time.
    pub poll_timeout: Duration,
    /// Events of other kinds are skipped before enrichment.
    pub watched_kinds: Vec<SyscallKind>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            watched_kinds: SyscallKind::ALL.to_vec(),
        }
    }
}

/// Why the pipeline stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Stop requested by a signal or by the run duration.
    Shutdown,
    /// The channel will never deliver again.
    ChannelClosed,
    ChannelFailed(String),
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Shutdown => write!(f, "shutdown requested"),
            Termination::ChannelClosed => write!(f, "event channel closed"),
            Termination::ChannelFailed(err) => write!(f, "event channel failed: {err}"),
        }
    }
}

/// Counters accumulated by a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub termination: Termination,
    /// what the dispatcher read
    pub channel: ChannelStats,
    /// what was read from the input, when a reader task feeds the channel
    pub input: Option<ChannelStats>,
    /// records overwritten before the dispatcher could read them
    pub overwritten: u64,
    pub decoded: u64,
    pub decode_errors: u64,
    /// events skipped by the kind filter
    pub filtered: u64,
    pub matches: u64,
    /// alerts closed by the deduplicator
    pub alerts: u64,
    pub alerts_queue_dropped: u64,
    pub rules: usize,
    pub rule_reloads: u64,
    pub cache: CacheStats,
    /// filled once the delivery task is done
    pub delivery: Option<DeliveryStats>,
}

impl PipelineReport {
    /// Account for the reader task. An input failure is the reason the
    /// pipeline stopped, even if the dispatcher only saw the ring close.
    pub fn record_input(&mut self, forwarded: Forwarded) {
        self.input = Some(forwarded.input);
        self.overwritten = forwarded.overwritten;
        if let Some(err) = forwarded.error {
            self.termination = Termination::ChannelFailed(err.to_string());
        }
    }

    pub(crate) fn new(rules: usize) -> Self {
        Self {
            termination: Termination::Shutdown,
            channel: ChannelStats::default(),
            input: None,
            overwritten: 0,
            decoded: 0,
            decode_errors: 0,
            filtered: 0,
            matches: 0,
            alerts: 0,
            alerts_queue_dropped: 0,
            rules,
            rule_reloads: 0,
            cache: CacheStats::default(),
            delivery: None,
        }
    }
}

/// Single task driving the pipeline: channel, decoder, process cache, rule
/// engine and deduplicator are owned here and never shared.
pub struct Dispatcher<C, S = ProcfsSource> {
    channel: C,
    cache: ProcessIdentityCache<S>,
    engine: RuleEngine,
    dedup: AlertDeduplicator,
    alerts: AlertSender,
    config: DispatcherConfig,
    report: PipelineReport,
    /// dropped count last reported by the channel
    last_dropped: u64,
}

impl<C, S> Dispatcher<C, S>
where
    C: EventChannel,
    S: ProcessInfoSource,
{
    pub fn new(
        channel: C,
        cache: ProcessIdentityCache<S>,
        engine: RuleEngine,
        dedup: AlertDeduplicator,
        alerts: AlertSender,
        config: DispatcherConfig,
    ) -> Self {
        let report = PipelineReport::new(engine.len());
        Self {
            channel,
            cache,
            engine,
            dedup,
            alerts,
            config,
            report,
            last_dropped: 0,
        }
    }

    /// Run until shutdown is requested or the channel fails.
    ///
    /// New rule engines received on `reload` replace the current one between
    /// two records. On exit every open alert window is flushed and delivered,
    /// and the alert queue is closed.
    pub async fn run(
        mut self,
        shutdown: watch::Receiver<bool>,
        mut reload: mpsc::Receiver<RuleEngine>,
    ) -> PipelineReport {
        let termination = loop {
            if *shutdown.borrow() {
                break Termination::Shutdown;
            }
            while let Ok(engine) = reload.try_recv() {
                log::info!("Rules reloaded: {} rules", engine.len());
                self.report.rules = engine.len();
                self.report.rule_reloads += 1;
                self.engine = engine;
            }

            match self.channel.next(self.config.poll_timeout).await {
                Ok(record) => self.process(record),
                Err(ChannelError::Timeout) => {}
                Err(ChannelError::Closed) => {
                    log::info!("Event channel closed");
                    break Termination::ChannelClosed;
                }
                Err(err) => {
                    let message = err.to_string();
                    probe_common::log_error("Event channel failed", err);
                    break Termination::ChannelFailed(message);
                }
            }

            let expired = self.dedup.expire(Timestamp::now());
            self.enqueue(expired);
            self.check_dropped();
        };

        self.check_dropped();
        let remaining = self.dedup.flush();
        log::debug!("Flushing {} open alerts", remaining.len());
        for alert in remaining {
            self.report.alerts += 1;
            if self.alerts.send(alert).await.is_err() {
                self.report.alerts_queue_dropped += 1;
            }
        }

        self.report.termination = termination;
        self.report.channel = self.channel.stats();
        self.report.cache = self.cache.stats();
        self.report
    }

    fn process(&mut self, record: RawRecord) {
        let event = match decoder::decode(&record) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("Skipping record: {err}");
                self.report.decode_errors += 1;
                return;
            }
        };
        self.report.decoded += 1;
        log::trace!("{event}");

        if !self.config.watched_kinds.contains(&event.kind) {
            self.report.filtered += 1;
            return;
        }

        let now = Timestamp::now();
        let identity = self.cache.resolve(event.pid, now);
        let matches = self.engine.evaluate(&event, &identity);
        if matches.is_empty() {
            return;
        }

        if log::log_enabled!(log::Level::Debug) {
            let ancestry = self
                .cache
                .ancestry(event.pid, now, ANCESTRY_DEPTH)
                .iter()
                .map(|parent| format!("{}({})", parent.comm, parent.pid))
                .collect::<Vec<_>>()
                .join(" <- ");
            for m in &matches {
                log::debug!("{} matched {event} [parents: {ancestry}]", m.rule_id);
            }
        }

        let mut closed = Vec::new();
        for m in &matches {
            self.report.matches += 1;
            closed.extend(self.dedup.on_match(m, now));
        }
        self.enqueue(closed);
    }

    /// Hand alerts to the delivery task without waiting.
    fn enqueue(&mut self, alerts: Vec<Alert>) {
        for alert in alerts {
            self.report.alerts += 1;
            match self.alerts.try_send(alert) {
                Ok(()) => {}
                Err(QueueError::Full) => {
                    log::warn!("Alert queue full, dropping alert");
                    self.report.alerts_queue_dropped += 1;
                }
                Err(QueueError::Closed) => {
                    log::warn!("Alert queue closed, dropping alert");
                    self.report.alerts_queue_dropped += 1;
                }
            }
        }
    }

    fn check_dropped(&mut self) {
        let dropped = self.channel.stats().dropped;
        if dropped > self.last_dropped {
            log::warn!(
                "{} events lost by the probes ({dropped} in total)",
                dropped - self.last_dropped
            );
            self.last_dropped = dropped;
        }
    }
}
