use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::paths::ProjectPaths;

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Initialize logging for a component at the default `info` level.
///
/// See [`init_logging_with_level`].
pub fn init_logging(component_name: &str, file_logging: bool) -> io::Result<Option<WorkerGuard>> {
    init_logging_with_level(component_name, file_logging, "info")
}

/// Initialize logging for a component.
///
/// - `component_name`: Name of the component (e.g., "sim"), used for the log file name
/// - `file_logging`: If true, also log to `<data dir>/logs/<component>.log`
/// - `default_level`: Filter used when `RUST_LOG` is not set
///
/// Returns a guard that must be kept alive for the duration of the program.
pub fn init_logging_with_level(
    component_name: &str,
    file_logging: bool,
    default_level: &str,
) -> io::Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if file_logging {
        let log_dir = log_directory()?;
        fs::create_dir_all(&log_dir)?;

        let log_path = log_dir.join(format!("{}.log", component_name));
        truncate_if_needed(&log_path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(io::stdout).with_ansi(true))
            .with(
                fmt::layer()
                    .with_writer(non_blocking_file)
                    .with_ansi(false)
                    .with_target(true),
            )
            .try_init()
            .map_err(io::Error::other)?;

        tracing::info!(target: "runner", "Logging to file: {}", log_path.display());

        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init()
            .map_err(io::Error::other)?;

        Ok(None)
    }
}

fn log_directory() -> io::Result<PathBuf> {
    let paths = ProjectPaths::new("tickbot")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to find home directory"))?;

    Ok(paths.log_dir())
}

/// Start the log over once it grows past [`MAX_LOG_SIZE`]
fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() && fs::metadata(log_path)?.len() > MAX_LOG_SIZE {
        File::create(log_path)?;
    }
    Ok(())
}
