use std::{env, ffi::OsString, path::PathBuf};

use alert_logger::OutputFormat;
use clap::{ArgAction, Parser};
use kwatch_core::event::SyscallKind;

pub const NAME: &str = "kwatch";

#[derive(Parser, Debug, Clone)]
#[command(name = NAME, version)]
#[command(about = "Watch exec and open syscalls and raise alerts on matching rules")]
pub struct KwatchOpts {
    /// Pass many times for a more verbose output. Passing `-v` adds debug logs, `-vv` enables trace logging
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// INI configuration file [default: /etc/kwatch/kwatch.ini]
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Directory containing the YAML rules
    #[arg(long, value_name = "DIR")]
    pub rules: Option<PathBuf>,

    /// Stop after the given number of seconds
    #[arg(long, value_name = "SECS")]
    pub duration: Option<u64>,

    /// Comma separated syscall kinds to watch: exec, openat, openat2
    #[arg(long, value_delimiter = ',')]
    pub kinds: Option<Vec<SyscallKind>>,

    /// Read binary event records from a FIFO or a file
    #[arg(long, value_name = "PATH", conflicts_with = "trace_pipe")]
    pub input: Option<PathBuf>,

    /// Read events printed by the legacy probes on the tracefs trace_pipe
    #[arg(long)]
    pub trace_pipe: bool,

    /// Alert output format: plaintext or json
    #[arg(long)]
    pub output_format: Option<OutputFormat>,

    /// Don't send alerts to syslog
    #[arg(long)]
    pub no_syslog: bool,
}

impl KwatchOpts {
    pub fn override_log_level(&self) -> Option<log::LevelFilter> {
        log_level_from_verbosity_flag_count(self.verbose)
    }
}

pub fn parse_from_args() -> KwatchOpts {
    parse_from(&mut std::env::args_os())
}

pub fn parse_from<I, T>(args: I) -> KwatchOpts
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    try_parse_from(args).unwrap_or_else(|e| e.exit())
}

pub fn try_parse_from<I, T>(args: I) -> Result<KwatchOpts, clap::Error>
where
    I: Iterator<Item = T>,
    T: Into<OsString> + Clone,
{
    KwatchOpts::try_parse_from(args)
}

fn log_level_from_verbosity_flag_count(num: u8) -> Option<log::LevelFilter> {
    match num {
        0 => None,
        1 => Some(log::LevelFilter::Debug),
        2..=u8::MAX => Some(log::LevelFilter::Trace),
    }
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

/// Log an error with its whole chain of causes. The debug representation,
/// with backtrace, is used at debug verbosity.
pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
