//! Tracing subscriber setup.
//!
//! Console output goes to stderr (text or JSON) so stdout stays free for command output.
//! Long-running commands also write a plain-text log per process under
//! `<state-dir>/logs/`, which keeps worker output apart.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Console log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// The value `--log-format` accepts for this format.
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    }
}

/// Keeps the file writer alive; dropping it flushes the log file.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Log file name for a process, e.g. `run.log` or `worker-123-ab12cd34.log`.
pub fn log_file_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}.log")
}

/// Install the global subscriber.
///
/// With `file` set to `(log_dir, name)`, events are also appended to
/// `log_dir/<name>.log`.
pub fn init_logging(
    verbose: bool,
    format: LogFormat,
    file: Option<(&Path, &str)>,
) -> Result<LoggingGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let (file_layer, file_guard) = match file {
        Some((log_dir, name)) => {
            fs::create_dir_all(log_dir)
                .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
            let appender = tracing_appender::rolling::never(log_dir, log_file_name(name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let text_layer = (format == LogFormat::Text).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });
    let json_layer = (format == LogFormat::Json).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
