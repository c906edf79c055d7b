use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Subprocess stderr and ORT chatter stay out of the console at the default
/// verbosity.
pub const DEFAULT_NOISE_FILTER: &str =
    "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
const LOG_FILE_PREFIX: &str = "fluidframe";
const LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingOptions {
    /// -v / -vv from the CLI.
    pub verbose: u8,
    /// Explicit filter from the CLI, overriding everything else.
    pub cli_log_filter: Option<String>,
    /// `RUST_LOG` as captured at startup.
    pub rust_log_env: Option<String>,
    /// When set, a daily-rolling log file is written here too.
    pub log_dir: Option<PathBuf>,
}

fn select_user_filter(options: &LoggingOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        DEFAULT_LOG_FILTER.to_string()
    }
}

/// The noise filter only applies when the user has not picked a filter
/// explicitly; `-v` or a CLI filter means they want to see everything.
pub fn compose_filter(options: &LoggingOptions) -> String {
    let user_filter = select_user_filter(options);
    if options.cli_log_filter.is_none() && options.verbose == 0 {
        format!("{DEFAULT_NOISE_FILTER},{user_filter}")
    } else {
        user_filter
    }
}

/// Install the global tracing subscriber. The returned guard must be held for
/// the process lifetime so buffered file output is flushed on exit.
pub fn init(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let filter = compose_filter(options);
    let env_filter = EnvFilter::try_new(&filter)
        .with_context(|| format!("invalid log filter: {filter}"))?;

    let console_layer = fmt::layer().with_target(true);

    let mut guard = None;
    let file_layer = match options.log_dir.as_deref() {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).with_context(|| {
                format!("failed to create log directory: {}", log_dir.display())
            })?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix(LOG_FILE_SUFFIX)
                .max_log_files(DEFAULT_LOG_RETENTION_FILES)
                .build(log_dir)
                .context("failed to initialize rolling log file")?;
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);
            Some(fmt::layer().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
