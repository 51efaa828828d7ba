// src/logging.rs
//
// Log output setup for binaries and host applications.
// Writes to stderr and, when a directory is configured, to a timestamped log
// file with a `portrx.log` symlink pointing at the newest one (Unix only).

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;
use crate::io::error::IoError;

const LINK_NAME: &str = "portrx.log";

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
/// Returns the path of the log file, if one was opened.
pub fn init_logging(config: &LogConfig) -> Result<Option<PathBuf>, IoError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| IoError::Config(format!("invalid log level {:?}: {}", config.level, e)))?;

    let (file_layer, log_path) = match &config.dir {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| IoError::Config(format!("logging already initialised: {}", e)))?;

    if let Some(path) = &log_path {
        tracing::info!("[logging] file logging started: {}", path.display());
    }
    Ok(log_path)
}

/// Create `<dir>/%Y%m%d-%H%M%S-portrx.log` and point the symlink at it
fn open_log_file(dir: &Path) -> Result<(std::fs::File, PathBuf), IoError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| IoError::Config(format!("failed to create log dir {}: {}", dir.display(), e)))?;

    let filename = log_file_name(chrono::Local::now());
    let path = dir.join(&filename);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| IoError::Config(format!("failed to create log file: {}", e)))?;

    // Windows symlinks need elevated privileges
    #[cfg(unix)]
    {
        let link = dir.join(LINK_NAME);
        let _ = std::fs::remove_file(&link);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &link) {
            eprintln!("[logging] failed to create {} symlink: {}", LINK_NAME, e);
        }
    }

    Ok((file, path))
}

fn log_file_name<Tz: chrono::TimeZone>(now: chrono::DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    now.format("%Y%m%d-%H%M%S-portrx.log").to_string()
}
