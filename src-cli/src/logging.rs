//! Structured logging using tracing.
//!
//! Progress and results go to stderr in a compact human format, filtered by
//! `RUST_LOG` when it is set. Every run also appends JSON records to a daily
//! log file under the user's data directory.

use std::io::IsTerminal;
use std::path::PathBuf;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose events are recorded at the configured levels. Everything
/// else (reqwest, hyper, ...) only reports warnings.
const OWN_TARGETS: [&str; 2] = ["tunedrop", "tunedrop_core"];

/// Daily files kept before the oldest is deleted.
const KEPT_LOG_FILES: usize = 7;

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Directory holding the JSON log files.
    pub log_directory: PathBuf,
    /// Maximum level printed to stderr.
    pub console_level: Level,
    /// Maximum level written to the log file.
    pub file_level: Level,
    /// Colour stderr output.
    pub console_ansi: bool,
}

impl LoggingConfig {
    /// Settings for one command-line run. `verbose` adds debug output on
    /// stderr; the file always records debug events.
    #[must_use]
    pub fn for_cli(verbose: bool) -> Self {
        Self {
            log_directory: default_log_directory(),
            console_level: if verbose { Level::DEBUG } else { Level::INFO },
            file_level: Level::DEBUG,
            console_ansi: std::io::stderr().is_terminal(),
        }
    }

    /// Filter for our crates at `level`, everything else at `warn`.
    fn filter(level: Level) -> String {
        let level = level_to_directive(level);
        OWN_TARGETS
            .iter()
            .fold("warn".to_string(), |acc, target| {
                format!("{acc},{target}={level}")
            })
    }
}

/// Keeps the file writer alive. Drop it to flush pending records.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard").finish_non_exhaustive()
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the log directory cannot be created, the log file
/// cannot be opened, or a subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError> {
    std::fs::create_dir_all(&config.log_directory).map_err(|e| {
        LoggingError::DirectoryCreationFailed {
            path: config.log_directory.clone(),
            reason: e.to_string(),
        }
    })?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("tunedrop")
        .filename_suffix("log")
        .max_log_files(KEPT_LOG_FILES)
        .build(&config.log_directory)
        .map_err(|e| LoggingError::AppenderFailed(e.to_string()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LoggingConfig::filter(config.console_level)));

    let console_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(config.console_ansi)
        .with_target(false)
        .without_time()
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_current_span(true)
        .with_filter(EnvFilter::new(LoggingConfig::filter(config.file_level)));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// `<data dir>/tunedrop/logs`, or `./tunedrop/logs` without one.
#[must_use]
pub fn default_log_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunedrop")
        .join("logs")
}

const fn level_to_directive(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

/// Errors that can occur during logging initialization.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// Failed to create the log directory.
    #[error("Failed to create log directory {path}: {reason}")]
    DirectoryCreationFailed {
        /// The path that could not be created.
        path: PathBuf,
        /// The reason for the failure.
        reason: String,
    },
    /// The log file could not be opened.
    #[error("Failed to open log file: {0}")]
    AppenderFailed(String),
    /// A global subscriber is already installed.
    #[error("Logging already initialized: {0}")]
    AlreadyInitialized(String),
}
