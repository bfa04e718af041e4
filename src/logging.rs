//! Tracing setup for the two ways the core runs.
//!
//! A long-lived embedding gets a JSON file layer with daily rotation next
//! to the console; one-shot CLI subcommands get console output only. Both
//! honor `RUST_LOG`.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Rotated file prefix inside the logs directory.
const LOG_FILE_PREFIX: &str = "armitage.log";

/// How the process wants its logs.
#[derive(Debug, Clone)]
pub enum LogMode {
    /// Long-lived embedding: JSON file layer (daily rotation under the
    /// given directory) plus human-readable stderr.
    Service {
        /// Directory receiving `armitage.log.YYYY-MM-DD` files.
        logs_dir: PathBuf,
    },
    /// One-shot subcommand: stderr only, quiet by default.
    OneShot,
}

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes pending entries and closes the file, so a
/// service holds it until shutdown.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Install the global subscriber for the chosen mode.
///
/// Returns a guard in service mode; `None` for one-shot runs. The filter
/// comes from `RUST_LOG`, defaulting to `info` for services and `warn`
/// for one-shot commands.
///
/// # Errors
///
/// Returns an error when the logs directory cannot be created.
pub fn init(mode: &LogMode) -> anyhow::Result<Option<LoggingGuard>> {
    match mode {
        LogMode::Service { logs_dir } => init_service(logs_dir).map(Some),
        LogMode::OneShot => {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

fn init_service(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!("failed to create logs directory {}: {e}", logs_dir.display())
    })?;

    let (file_writer, guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX),
    );
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(file_writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(LoggingGuard { _guard: guard })
}
