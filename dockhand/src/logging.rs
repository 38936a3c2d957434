// Copyright 2024 Oxide Computer Company
//! Logging configuration for the control plane.  All logging goes through
//! slog; this module turns a `ConfigLogging` block (usually a `[log]` table in
//! the consumer's TOML file) into a root `Logger`.

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use slog::Drain;
use slog::Level;
use slog::Logger;
use std::fs::OpenOptions;
use std::io;
use std::io::LineWriter;
use std::io::Write;
use std::path::Path;

/// Where and how a server logs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum ConfigLogging {
    /// Human-readable output to stderr, assumed to support terminal escapes.
    StderrTerminal { level: ConfigLoggingLevel },
    /// One JSON object per line on stderr, for log collectors that scrape
    /// container output.
    StderrJson { level: ConfigLoggingLevel },
    /// Bunyan-formatted output to a file.
    File {
        level: ConfigLoggingLevel,
        path: Utf8PathBuf,
        if_exists: ConfigLoggingIfExists,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<&ConfigLoggingLevel> for Level {
    fn from(config_level: &ConfigLoggingLevel) -> Level {
        match config_level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

/// Behavior when the configured log file already exists.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigLoggingIfExists {
    Fail,
    Truncate,
    Append,
}

impl ConfigLogging {
    /// Create a root logger based on the requested configuration.
    pub fn to_logger<S: AsRef<str>>(
        &self,
        log_name: S,
    ) -> Result<Logger, io::Error> {
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(level, drain, log_name.as_ref()))
            }

            ConfigLogging::StderrJson { level } => {
                let drain = slog_json::Json::new(io::stderr())
                    .add_default_keys()
                    .build()
                    .fuse();
                Ok(async_root_logger(level, drain, log_name.as_ref()))
            }

            ConfigLogging::File { level, path, if_exists } => {
                let mut open_options = OpenOptions::new();
                open_options.write(true).create(true);
                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }

                let drain = log_drain_for_file(
                    &open_options,
                    Path::new(path),
                    log_name.as_ref().to_string(),
                )?;
                // The bunyan record already carries the name.
                let logger = async_root_logger(level, drain, "");

                // Leave a note on stderr so that an operator knows where the
                // rest of the output went.  Failing to write it is not fatal.
                if let Err(err) = writeln!(
                    io::stderr(),
                    "note: configured to log to \"{path}\"",
                ) {
                    warn!(
                        logger,
                        "failed to report log path on stderr";
                        "err" => %err,
                    );
                }

                Ok(logger)
            }
        }
    }
}

fn async_root_logger<T>(
    level: &ConfigLoggingLevel,
    drain: T,
    name: &str,
) -> Logger
where
    T: slog::Drain + Send + 'static,
    <T as slog::Drain>::Err: std::fmt::Debug,
{
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain =
        slog_async::Async::new(level_drain).chan_size(1024).build().fuse();
    if name.is_empty() {
        Logger::root(async_drain, o!())
    } else {
        Logger::root(async_drain, o!("name" => name.to_string()))
    }
}

fn log_drain_for_file(
    open_options: &OpenOptions,
    path: &Path,
    log_name: String,
) -> Result<slog::Fuse<slog_json::Json<LineWriter<std::fs::File>>>, io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = LineWriter::new(open_options.open(path)?);

    // slog_bunyan wants a `&'static str` for the name.  Loggers are created a
    // handful of times per process, so leaking the name is acceptable.
    let log_name: &'static str = Box::leak(log_name.into_boxed_str());
    Ok(slog_bunyan::with_name(log_name, file).build().fuse())
}
