//! Logging initialization.
//!
//! - **Production**: JSON lines to a daily rolling file plus compact stdout for
//!   the journal. Events carry the `device` span, so every line of a device
//!   task has its `device_id`.
//! - **Development**: pretty stdout only.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from `VEGA_LOG_LEVEL`
//! (default `info`). Chatty dependencies are capped at `warn` unless the
//! directive names them.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Writer guards; dropping them would stop the background flush threads.
static GUARDS: OnceLock<(WorkerGuard, WorkerGuard)> = OnceLock::new();

/// Days of log files kept on disk.
const RETAINED_LOG_FILES: usize = 14;

const QUIET_TARGETS: [&str; 3] = ["bluer", "hyper", "zbus"];

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directive is malformed or the log
/// directory cannot be created.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let filter = env_filter()?;
    if is_production {
        init_production(filter)
    } else {
        init_development(filter);
        Ok(())
    }
}

fn env_filter() -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = std::env::var("VEGA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    Ok(EnvFilter::try_new(directive(&level))?)
}

/// Extends a bare level with caps for noisy dependencies.
fn directive(level: &str) -> String {
    let mut directive = level.to_string();
    for target in QUIET_TARGETS {
        if !level.contains(target) {
            directive.push_str(&format!(",{target}=warn"));
        }
    }
    directive
}

fn init_production(filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("vega")
        .filename_suffix("log")
        .max_log_files(RETAINED_LOG_FILES)
        .build(&log_dir)?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_writer(file_writer)
        .with_target(true);

    // journald adds its own timestamps
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(stdout_writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = GUARDS.set((file_guard, stdout_guard));
    tracing::info!(dir = %log_dir.display(), "file logging enabled");
    Ok(())
}

fn init_development(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

/// `VEGA_LOG_DIR` if set, else `/var/log/vega` on Linux and the platform data
/// directory elsewhere.
fn log_directory() -> PathBuf {
    if let Some(dir) = std::env::var_os("VEGA_LOG_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/vega")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "vega")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}
