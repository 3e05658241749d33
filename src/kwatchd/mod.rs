use std::{os::unix::fs::FileTypeExt, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use kwatch_core::{
    dedup::AlertDeduplicator,
    process_cache::{ProcessIdentityCache, ProcfsSource},
    sink::spawn_delivery,
};
use probe_common::channel::{PipeReader, StreamChannel, TracePipeChannel, ring_channel};
use rules_engine::RuleEngine;
use tokio::{
    signal::unix::{Signal, SignalKind, signal},
    sync::{mpsc, watch},
};

use crate::cli::KwatchOpts;

mod config;
mod dispatcher;
mod report;

pub use config::{Input, KwatchConfig, Settings};
pub use dispatcher::{Dispatcher, DispatcherConfig, PipelineReport, Termination};

/// Run the pipeline until a signal, the end of the run duration or a channel
/// failure. Returns an error when the pipeline didn't stop cleanly.
pub async fn kwatch_run(options: &KwatchOpts) -> Result<()> {
    log::trace!("kwatch options: {:?}", options);

    let config = match &options.config_file {
        Some(custom_file) => KwatchConfig::with_custom_file(custom_file)?,
        None => KwatchConfig::new()?,
    };
    let settings = Settings::resolve(&config, options)?;

    let engine = RuleEngine::from_dir(&settings.rules_dir)
        .with_context(|| format!("Error loading rules from {}", settings.rules_dir.display()))?;
    log::info!(
        "Loaded {} rules from {}",
        engine.len(),
        settings.rules_dir.display()
    );

    let source = Source::open(&settings.input)?;
    let replay = source.is_replay();

    let sinks = alert_logger::sinks_from_config(&settings.logger);
    let (alerts, delivery) = spawn_delivery(sinks, settings.delivery, settings.alert_queue_size);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let signals = Signals::install()?;
    let signal_task = tokio::spawn(signals.watch(
        shutdown_tx,
        reload_tx,
        settings.rules_dir.clone(),
        settings.duration,
    ));

    // The writer of the input never waits on the pipeline: when the ring is
    // full its oldest unread records are overwritten.
    let (producer, ring) = ring_channel(settings.ring_capacity);
    let poll_timeout = settings.dispatcher.poll_timeout;
    let reader = match source {
        Source::Fifo(reader) => tokio::spawn(producer.forward(
            StreamChannel::new(reader),
            poll_timeout,
            shutdown_rx.clone(),
        )),
        Source::File(file) => tokio::spawn(producer.forward(
            StreamChannel::new(file),
            poll_timeout,
            shutdown_rx.clone(),
        )),
        Source::TracePipe(channel) => {
            tokio::spawn(producer.forward(channel, poll_timeout, shutdown_rx.clone()))
        }
    };

    let dispatcher = Dispatcher::new(
        ring,
        ProcessIdentityCache::new(ProcfsSource, settings.cache_capacity, settings.cache_ttl),
        engine,
        AlertDeduplicator::new(settings.dedup_window, settings.dedup_max_open),
        alerts,
        settings.dispatcher.clone(),
    );
    log::info!("Watching {:?}", settings.dispatcher.watched_kinds);
    let mut report = dispatcher.run(shutdown_rx, reload_rx).await;
    signal_task.abort();

    match reader.await {
        Ok(forwarded) => report.record_input(forwarded),
        Err(err) => log::error!("Event reader task failed: {err}"),
    }
    match delivery.await {
        Ok(stats) => report.delivery = Some(stats),
        Err(err) => log::error!("Alert delivery task failed: {err}"),
    }

    report.log();
    eprintln!("{}", report.table());

    match &report.termination {
        Termination::Shutdown => Ok(()),
        Termination::ChannelClosed if replay => Ok(()),
        termination => bail!("Pipeline stopped: {termination}"),
    }
}

enum Source {
    Fifo(PipeReader),
    File(tokio::fs::File),
    TracePipe(TracePipeChannel),
}

impl Source {
    fn open(input: &Input) -> Result<Self> {
        match input {
            Input::TracePipe => {
                let channel = TracePipeChannel::open().context("Error opening trace_pipe")?;
                Ok(Source::TracePipe(channel))
            }
            Input::Records(path) => {
                let metadata = std::fs::metadata(path)
                    .with_context(|| format!("Error opening input {}", path.display()))?;
                if metadata.file_type().is_fifo() {
                    let reader = PipeReader::open(path)
                        .with_context(|| format!("Error opening FIFO {}", path.display()))?;
                    log::info!("Reading events from FIFO {}", path.display());
                    Ok(Source::Fifo(reader))
                } else {
                    let file = std::fs::File::open(path)
                        .with_context(|| format!("Error opening input {}", path.display()))?;
                    log::info!("Replaying events from {}", path.display());
                    Ok(Source::File(tokio::fs::File::from_std(file)))
                }
            }
        }
    }

    /// A recorded file ends, the other sources are expected to live forever.
    fn is_replay(&self) -> bool {
        matches!(self, Source::File(_))
    }
}

struct Signals {
    sig_int: Signal,
    sig_term: Signal,
    sig_hup: Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            sig_int: signal(SignalKind::interrupt())?,
            sig_term: signal(SignalKind::terminate())?,
            sig_hup: signal(SignalKind::hangup())?,
        })
    }

    /// Request shutdown on SIGINT, SIGTERM or once `duration` elapsed, reload
    /// the rules on SIGHUP.
    async fn watch(
        mut self,
        shutdown: watch::Sender<bool>,
        reload: mpsc::Sender<RuleEngine>,
        rules_dir: PathBuf,
        duration: Option<Duration>,
    ) {
        let deadline = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.sig_int.recv() => {
                    log::trace!("SIGINT received");
                    break;
                }
                _ = self.sig_term.recv() => {
                    log::trace!("SIGTERM received");
                    break;
                }
                _ = &mut deadline => {
                    log::info!("Run duration elapsed");
                    break;
                }
                _ = self.sig_hup.recv() => {
                    log::info!("SIGHUP received, reloading rules from {}", rules_dir.display());
                    match RuleEngine::from_dir(&rules_dir) {
                        Ok(engine) => {
                            if reload.send(engine).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            probe_common::log_error("Reloading rules failed, keeping the current ones", err);
                        }
                    }
                }
            }
        }

        log::info!("Terminating kwatch...");
        let _ = shutdown.send(true);
    }
}
