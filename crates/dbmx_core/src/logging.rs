//! Structured logging setup with console and file output.
//!
//! - Daily rotating log files under `<data_dir>/logs`
//! - Build-type dependent default levels
//! - Console-only when attached to a terminal or when file logging fails
//! - Environment override via `DBMX_LOG` or `RUST_LOG`

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::settings::CoreSettings;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "DBMX_LOG";

/// Logging configuration.
pub struct LogConfig {
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Whether stdout is a terminal
    pub is_tty: bool,
    /// Optional explicit filter, overriding the environment
    pub log_filter: Option<String>,
}

impl LogConfig {
    /// Create a configuration writing to `log_dir`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, is_tty: atty::is(atty::Stream::Stdout), log_filter: None }
    }

    /// Derive the configuration from core settings.
    pub fn from_settings(settings: &CoreSettings) -> Self {
        let config = Self::new(settings.data_dir.join("logs"));
        match &settings.log_filter {
            Some(filter) => config.with_filter(filter.clone()),
            None => config,
        }
    }

    /// Set custom log filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }
}

/// Keeps the file writer alive; dropping it flushes pending entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// A subscriber that is already installed is left in place.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    if config.is_tty {
        return init_stdout_logging(config.log_filter.as_deref());
    }

    match init_file_logging(&config) {
        Ok(guard) => LoggingGuard { _worker_guard: guard },
        Err(e) => {
            eprintln!("Warning: Failed to initialize file logging: {e}. Using console only.");
            init_stdout_logging(config.log_filter.as_deref())
        }
    }
}

fn init_stdout_logging(filter: Option<&str>) -> LoggingGuard {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(filter))
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }

    LoggingGuard { _worker_guard: None }
}

fn init_file_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("dbmx")
        .filename_suffix("log")
        .build(&config.log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let stdout = std::io::stdout.with_max_level(tracing::Level::INFO);

    let installed = tracing_subscriber::fmt()
        .with_writer(stdout.and(non_blocking))
        .with_env_filter(build_env_filter(config.log_filter.as_deref()))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();

    match installed {
        Ok(()) => Ok(Some(guard)),
        Err(_) => {
            tracing::debug!("Global subscriber already installed");
            Ok(None)
        }
    }
}

/// Build the filter. Priority: explicit filter > `DBMX_LOG` > `RUST_LOG` > default.
pub fn build_env_filter(custom_filter: Option<&str>) -> EnvFilter {
    if let Some(filter) = custom_filter {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(default_log_filter()));
    }

    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// Get the default log filter based on build type.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "debug,dbmx=trace,dbmx_core=trace,tokio_postgres=warn,deadpool=warn,rusqlite=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "info,dbmx=info,dbmx_core=info,tokio_postgres=warn,deadpool=warn,rusqlite=warn"
    }
}
