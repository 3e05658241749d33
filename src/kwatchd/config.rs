use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use kwatch_core::{config::SectionConfig, event::SyscallKind, sink::DeliveryConfig};
use rules_engine::DEFAULT_RULES_PATH;

use super::dispatcher::DispatcherConfig;
use crate::cli::KwatchOpts;

const DEFAULT_CONFIG_FILE: &str = "/etc/kwatch/kwatch.ini";

const PIPELINE: &str = "pipeline";
const PROCESS_CACHE: &str = "process-cache";
const DEDUP: &str = "dedup";
const DELIVERY: &str = "delivery";

/// Content of the `INI` configuration file, by section.
#[derive(Debug, Clone, Default)]
pub struct KwatchConfig {
    sections: HashMap<String, SectionConfig>,
}

impl KwatchConfig {
    /// Load the default file. A missing default file means default values.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::debug!("{} not found, using defaults", config_file.display());
            return Ok(Self::default());
        }
        Self::from_config_file(config_file)
    }

    pub fn with_custom_file(config_file: impl Into<PathBuf>) -> Result<Self> {
        let config_file = config_file.into();
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    fn from_ini(conf: &ini::Ini) -> Self {
        let mut sections: HashMap<String, SectionConfig> = HashMap::new();
        for (section, prop) in conf {
            if let Some(section) = section {
                let section_config = sections
                    .entry(section.to_string())
                    .or_insert_with(|| SectionConfig::new(section));
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    section_config.insert(key, value);
                }
            }
        }
        Self { sections }
    }

    /// Configuration of a section, empty if the file doesn't have it.
    pub fn section(&self, name: &str) -> SectionConfig {
        self.sections
            .get(name)
            .cloned()
            .unwrap_or_else(|| SectionConfig::new(name))
    }
}

/// Where events come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Binary records from a FIFO or a file.
    Records(PathBuf),
    TracePipe,
}

/// Runtime settings: configuration file values overridden by command line
/// options.
#[derive(Debug, Clone)]
pub struct Settings {
    pub dispatcher: DispatcherConfig,
    pub alert_queue_size: usize,
    /// records buffered between the input reader and the dispatcher
    pub ring_capacity: usize,
    pub rules_dir: PathBuf,
    pub input: Input,
    pub duration: Option<Duration>,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub dedup_window: Duration,
    pub dedup_max_open: usize,
    pub logger: alert_logger::Config,
    pub delivery: DeliveryConfig,
}

impl Settings {
    pub fn resolve(config: &KwatchConfig, options: &KwatchOpts) -> Result<Self> {
        let pipeline = config.section(PIPELINE);
        let process_cache = config.section(PROCESS_CACHE);
        let dedup = config.section(DEDUP);

        let watched_kinds = match &options.kinds {
            Some(kinds) => kinds.clone(),
            None => pipeline.get_list_with_default("watched_kinds", SyscallKind::ALL.to_vec())?,
        };
        if watched_kinds.is_empty() {
            bail!("No syscall kind to watch");
        }

        let input = if options.trace_pipe {
            Input::TracePipe
        } else {
            match options.input.clone() {
                Some(path) => Input::Records(path),
                None => match pipeline.optional::<PathBuf>("input")? {
                    Some(path) => Input::Records(path),
                    None => Input::TracePipe,
                },
            }
        };

        let mut logger = alert_logger::Config::try_from(&config.section(alert_logger::SECTION))?;
        if let Some(output_format) = options.output_format {
            logger.output_format = output_format;
        }
        if options.no_syslog {
            logger.syslog = false;
        }

        Ok(Self {
            dispatcher: DispatcherConfig {
                poll_timeout: pipeline.millis_with_default("poll_timeout_ms", 100)?,
                watched_kinds,
            },
            alert_queue_size: pipeline.with_default("alert_queue_size", 1024)?,
            ring_capacity: pipeline.with_default("ring_capacity", 4096)?,
            rules_dir: match &options.rules {
                Some(rules) => rules.clone(),
                None => pipeline.with_default("rules_dir", PathBuf::from(DEFAULT_RULES_PATH))?,
            },
            input,
            duration: options.duration.map(Duration::from_secs),
            cache_capacity: process_cache.with_default("capacity", 4096)?,
            cache_ttl: process_cache.secs_with_default("ttl_secs", 30)?,
            dedup_window: dedup.secs_with_default("window_secs", 10)?,
            dedup_max_open: dedup.with_default("max_open", 65536)?,
            logger,
            delivery: DeliveryConfig::try_from(&config.section(DELIVERY))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use alert_logger::OutputFormat;

    use super::*;
    use crate::cli::try_parse_from;

    fn config(ini: &str) -> KwatchConfig {
        KwatchConfig::from_ini(&ini::Ini::load_from_str(ini).unwrap())
    }

    fn options(args: &[&str]) -> KwatchOpts {
        try_parse_from(std::iter::once("kwatch").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_without_file() {
        let settings = Settings::resolve(&KwatchConfig::default(), &options(&[])).unwrap();
        assert_eq!(settings.dispatcher.poll_timeout, Duration::from_millis(100));
        assert_eq!(settings.dispatcher.watched_kinds, SyscallKind::ALL.to_vec());
        assert_eq!(settings.alert_queue_size, 1024);
        assert_eq!(settings.ring_capacity, 4096);
        assert_eq!(settings.rules_dir, PathBuf::from("/etc/kwatch/rules"));
        assert_eq!(settings.input, Input::TracePipe);
        assert_eq!(settings.duration, None);
        assert_eq!(settings.cache_capacity, 4096);
        assert_eq!(settings.cache_ttl, Duration::from_secs(30));
        assert_eq!(settings.dedup_window, Duration::from_secs(10));
        assert_eq!(settings.dedup_max_open, 65536);
        assert_eq!(settings.logger, alert_logger::Config::default());
        assert_eq!(settings.delivery, DeliveryConfig::default());
    }

    #[test]
    fn file_values() {
        let config = config(
            "[pipeline]\n\
             poll_timeout_ms = 20\n\
             ring_capacity = 64\n\
             watched_kinds = openat,openat2\n\
             rules_dir = /opt/rules\n\
             input = /run/kwatch/events\n\
             [process-cache]\n\
             capacity = 10\n\
             ttl_secs = 2\n\
             [dedup]\n\
             window_secs = 60\n\
             [alert-logger]\n\
             output_format = json\n\
             [delivery]\n\
             max_attempts = 5\n",
        );
        let settings = Settings::resolve(&config, &options(&[])).unwrap();
        assert_eq!(settings.dispatcher.poll_timeout, Duration::from_millis(20));
        assert_eq!(settings.ring_capacity, 64);
        assert_eq!(
            settings.dispatcher.watched_kinds,
            [SyscallKind::OpenAt, SyscallKind::OpenAt2]
        );
        assert_eq!(settings.rules_dir, PathBuf::from("/opt/rules"));
        assert_eq!(settings.input, Input::Records("/run/kwatch/events".into()));
        assert_eq!(settings.cache_capacity, 10);
        assert_eq!(settings.cache_ttl, Duration::from_secs(2));
        assert_eq!(settings.dedup_window, Duration::from_secs(60));
        assert_eq!(settings.logger.output_format, OutputFormat::Json);
        assert_eq!(settings.delivery.max_attempts, 5);
    }

    #[test]
    fn command_line_wins() {
        let config = config("[pipeline]\nwatched_kinds = openat\ninput = /a\nrules_dir = /b\n");
        let settings = Settings::resolve(
            &config,
            &options(&[
                "--kinds",
                "exec",
                "--trace-pipe",
                "--rules",
                "/c",
                "--duration",
                "3",
                "--output-format",
                "json",
                "--no-syslog",
            ]),
        )
        .unwrap();
        assert_eq!(settings.dispatcher.watched_kinds, [SyscallKind::Exec]);
        assert_eq!(settings.input, Input::TracePipe);
        assert_eq!(settings.rules_dir, PathBuf::from("/c"));
        assert_eq!(settings.duration, Some(Duration::from_secs(3)));
        assert_eq!(settings.logger.output_format, OutputFormat::Json);
        assert!(!settings.logger.syslog);
    }

    #[test]
    fn invalid_values_are_errors() {
        let bad_window = config("[dedup]\nwindow_secs = soon\n");
        let err = Settings::resolve(&bad_window, &options(&[])).unwrap_err();
        assert!(format!("{err:#}").contains("window_secs"));

        let bad_kind = config("[pipeline]\nwatched_kinds = read\n");
        assert!(Settings::resolve(&bad_kind, &options(&[])).is_err());

        let bad_ring = config("[pipeline]\nring_capacity = -1\n");
        let err = Settings::resolve(&bad_ring, &options(&[])).unwrap_err();
        assert!(format!("{err:#}").contains("ring_capacity"));
    }

    #[test]
    fn sample_file_holds_defaults() {
        let sample = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("kwatch.ini");
        let config = KwatchConfig::with_custom_file(sample).unwrap();
        let settings = Settings::resolve(&config, &options(&[])).unwrap();
        let defaults = Settings::resolve(&KwatchConfig::default(), &options(&[])).unwrap();
        assert_eq!(settings.dispatcher.poll_timeout, defaults.dispatcher.poll_timeout);
        assert_eq!(settings.dispatcher.watched_kinds, defaults.dispatcher.watched_kinds);
        assert_eq!(settings.rules_dir, defaults.rules_dir);
        assert_eq!(settings.ring_capacity, defaults.ring_capacity);
        assert_eq!(settings.input, Input::TracePipe);
        assert_eq!(settings.cache_capacity, defaults.cache_capacity);
        assert_eq!(settings.dedup_max_open, defaults.dedup_max_open);
        assert_eq!(settings.logger, defaults.logger);
        assert_eq!(settings.delivery, defaults.delivery);
    }

    #[test]
    fn missing_custom_file_is_an_error() {
        assert!(KwatchConfig::with_custom_file("/nonexistent/kwatch.ini").is_err());
    }
}
