//! Alert sinks writing to the console and to syslog.

use std::{
    env,
    fs::File,
    io::{self, IsTerminal, Write},
    os::{
        fd::AsFd,
        unix::{fs::MetadataExt, net::UnixDatagram},
    },
    str::FromStr,
};

use chrono::{DateTime, SecondsFormat, Utc};
use kwatch_core::{
    config::{ConfigError, SectionConfig},
    event::Alert,
    sink::{AlertSink, SinkError},
};
use serde::Serialize;

const UNIX_SOCK_PATHS: [&str; 3] = ["/dev/log", "/var/run/syslog", "/var/run/log"];
const PRIORITY: u8 = 25; // facility * 8 + severity. facility: daemon (3); severity: alert (1)

pub const SECTION: &str = "alert-logger";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Plaintext,
    Json,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;
    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_lowercase().as_str() {
            "plaintext" => Ok(OutputFormat::Plaintext),
            "json" => Ok(OutputFormat::Json),
            _ => Err(ConfigError::InvalidValue {
                section: SECTION.to_string(),
                field: String::from("output_format"),
                value: format.to_string(),
                err: String::from("Output format must be one of [plaintext, json]"),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub console: bool,
    pub syslog: bool,
    pub output_format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            console: true,
            syslog: true,
            output_format: OutputFormat::Plaintext,
        }
    }
}

impl TryFrom<&SectionConfig> for Config {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            console: config.with_default("console", true)?,
            syslog: config.with_default("syslog", true)?,
            output_format: config.with_default("output_format", OutputFormat::Plaintext)?,
        })
    }
}

/// Build the sinks enabled by the configuration.
///
/// Syslog is skipped when stderr is already connected to the journal, and
/// when no syslog socket is reachable (a warning is logged).
pub fn sinks_from_config(config: &Config) -> Vec<Box<dyn AlertSink>> {
    let mut sinks: Vec<Box<dyn AlertSink>> = Vec::new();
    if config.console {
        sinks.push(Box::new(ConsoleSink::stdout(config.output_format)));
    }
    if config.syslog {
        if connected_to_journal() {
            log::debug!("stderr is connected to the journal, syslog output disabled");
        } else {
            match SyslogSink::connect(config.output_format) {
                Ok(sink) => sinks.push(Box::new(sink)),
                Err(err) => log::warn!("Failed to connect to syslog: {err}"),
            }
        }
    }
    if sinks.is_empty() {
        log::warn!("No alert output enabled, alerts will only be counted");
    }
    sinks
}

fn connected_to_journal() -> bool {
    io::stderr()
        .as_fd()
        .try_clone_to_owned()
        .and_then(|fd| File::from(fd).metadata())
        .map(|meta| format!("{}:{}", meta.dev(), meta.ino()))
        .ok()
        .and_then(|stderr| {
            env::var_os("JOURNAL_STREAM").map(|s| s.to_string_lossy() == stderr.as_str())
        })
        .unwrap_or(false)
}

/// JSON document of an alert, stamped with the wall-clock emission time.
#[derive(Serialize)]
struct JsonAlert<'a> {
    emitted_at: String,
    #[serde(flatten)]
    alert: &'a Alert,
}

fn to_json(alert: &Alert, now: DateTime<Utc>) -> Result<String, SinkError> {
    serde_json::to_string(&JsonAlert {
        emitted_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        alert,
    })
    .map_err(|err| SinkError::Serialize(err.to_string()))
}

/// Prints one alert per line.
pub struct ConsoleSink<W = io::Stdout> {
    writer: W,
    output_format: OutputFormat,
    color: bool,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout(output_format: OutputFormat) -> Self {
        let writer = io::stdout();
        let color = writer.is_terminal();
        Self {
            writer,
            output_format,
            color,
        }
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(writer: W, output_format: OutputFormat) -> Self {
        Self {
            writer,
            output_format,
            color: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn format(&self, alert: &Alert, now: DateTime<Utc>) -> Result<String, SinkError> {
        Ok(match self.output_format {
            OutputFormat::Json => to_json(alert, now)?,
            OutputFormat::Plaintext => {
                let time = now.to_rfc3339_opts(SecondsFormat::Secs, true);
                if self.color {
                    format!("{time} {alert:#}")
                } else {
                    format!("{time} {alert}")
                }
            }
        })
    }
}

impl<W: Write + Send> AlertSink for ConsoleSink<W> {
    fn name(&self) -> &str {
        "console"
    }

    fn emit(&mut self, alert: &Alert) -> Result<(), SinkError> {
        let out = self.format(alert, Utc::now())?;
        writeln!(self.writer, "{out}")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Sends alerts to the local syslog daemon over its unix datagram socket.
#[derive(Debug)]
pub struct SyslogSink {
    socket: Option<UnixDatagram>,
    output_format: OutputFormat,
}

impl SyslogSink {
    pub fn connect(output_format: OutputFormat) -> Result<Self, SinkError> {
        let socket = open_syslog_socket()?;
        Ok(Self {
            socket: Some(socket),
            output_format,
        })
    }

    fn format(&self, alert: &Alert) -> Result<String, SinkError> {
        Ok(match self.output_format {
            OutputFormat::Plaintext => format!("<{PRIORITY}>kwatch: {alert}"),
            OutputFormat::Json => format!("<{PRIORITY}>kwatch: {}", to_json(alert, Utc::now())?),
        })
    }
}

fn open_syslog_socket() -> Result<UnixDatagram, SinkError> {
    let socket = UnixDatagram::unbound()?;
    UNIX_SOCK_PATHS
        .iter()
        .find_map(|path| socket.connect(path).ok())
        .ok_or_else(|| {
            SinkError::Unavailable(format!("no syslog socket in {}", UNIX_SOCK_PATHS.join(", ")))
        })?;
    Ok(socket)
}

impl AlertSink for SyslogSink {
    fn name(&self) -> &str {
        "syslog"
    }

    fn emit(&mut self, alert: &Alert) -> Result<(), SinkError> {
        let out = self.format(alert)?;
        // the syslog daemon may have been restarted: reconnect on next emit
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => open_syslog_socket()?,
        };
        socket.send(out.as_bytes())?;
        self.socket = Some(socket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use kwatch_core::event::{Severity, SyscallKind};

    use super::*;

    fn alert() -> Alert {
        Alert {
            rule_id: "env-file-read".to_string(),
            severity: Severity::High,
            kind: SyscallKind::OpenAt,
            comm: "cat".to_string(),
            pid: 1234,
            parent_pid: Some(1),
            path: "/srv/.env".to_string(),
            first_occurrence: 1_000_000_000.into(),
            last_occurrence: 3_000_000_000.into(),
            occurrence_count: 3,
        }
    }

    #[test]
    fn output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("plaintext".parse::<OutputFormat>(), Ok(OutputFormat::Plaintext));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn config_defaults_and_overrides() {
        let mut section = SectionConfig::new(SECTION);
        assert_eq!(Config::try_from(&section), Ok(Config::default()));
        section.insert("syslog", "false");
        section.insert("output_format", "json");
        let config = Config::try_from(&section).unwrap();
        assert!(config.console);
        assert!(!config.syslog);
        assert_eq!(config.output_format, OutputFormat::Json);
    }

    #[test]
    fn plaintext_line() {
        let mut sink = ConsoleSink::new(Vec::new(), OutputFormat::Plaintext);
        sink.emit(&alert()).unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert!(out.ends_with(
            " [high ALERT cat (1234, parent 1)] [env-file-read] openat /srv/.env x3 [1.000000000 .. 3.000000000]\n"
        ));
        assert_eq!(out.lines().count(), 1);
    }

    #[test]
    fn json_document() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let json: serde_json::Value = serde_json::from_str(&to_json(&alert(), now).unwrap()).unwrap();
        assert_eq!(json["emitted_at"], "2024-05-01T12:00:00.000Z");
        assert_eq!(json["rule_id"], "env-file-read");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["kind"], "openat");
        assert_eq!(json["occurrence_count"], 3);
        assert_eq!(json["first_occurrence"], 1_000_000_000u64);
    }

    #[test]
    fn json_console_output() {
        let mut sink = ConsoleSink::new(Vec::new(), OutputFormat::Json);
        sink.emit(&alert()).unwrap();
        sink.emit(&alert()).unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        for line in out.lines() {
            let json: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(json["pid"], 1234);
        }
        assert_eq!(out.lines().count(), 2);
    }
}
