use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter};

/// Every log file this tool writes starts with this prefix.
pub const LOG_FILE_PREFIX: &str = "resource-";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Failed to clean log directory: {0}")]
    Cleanup(#[from] std::io::Error),

    #[error("Failed to open log file: {0}")]
    Appender(#[from] InitError),

    #[error("Failed to install log subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Remove stale log files, then log to stderr and to a fresh file in `dir`.
///
/// Filtering follows `RUST_LOG`, defaulting to `info`.
pub fn init(dir: &Path, retention: Duration) -> Result<(), LogError> {
    let removed = clean_stale_logs(dir, retention, SystemTime::now())?;

    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(format!("{LOG_FILE_PREFIX}check-{started}"))
        .filename_suffix("log")
        .build(dir)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_appender))
        .try_init()?;

    debug!(dir = %dir.display(), removed, "logging initialised");
    Ok(())
}

/// Delete regular files named `resource-*` in `dir` last modified more
/// than `retention` before `now`. Returns how many were removed.
pub fn clean_stale_logs(dir: &Path, retention: Duration, now: SystemTime) -> Result<usize, LogError> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let age = now
            .duration_since(metadata.modified()?)
            .unwrap_or_default();
        if age > retention {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RETENTION: Duration = Duration::from_secs(72 * 60 * 60);

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "log line\n").unwrap();
    }

    #[test]
    fn test_removes_only_old_resource_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "resource-check-1.log");
        touch(dir.path(), "resource-in-2.log");
        touch(dir.path(), "other.log");
        fs::create_dir(dir.path().join("resource-dir")).unwrap();

        let later = SystemTime::now() + RETENTION + Duration::from_secs(60);
        let removed = clean_stale_logs(dir.path(), RETENTION, later).unwrap();

        assert_eq!(removed, 2);
        assert!(!dir.path().join("resource-check-1.log").exists());
        assert!(dir.path().join("other.log").exists());
        assert!(dir.path().join("resource-dir").exists());
    }

    #[test]
    fn test_keeps_recent_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "resource-check-1.log");

        let removed = clean_stale_logs(dir.path(), RETENTION, SystemTime::now()).unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("resource-check-1.log").exists());
    }

    #[test]
    fn test_missing_dir_is_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("gone");
        assert!(clean_stale_logs(&missing, RETENTION, SystemTime::now()).is_err());
    }
}
