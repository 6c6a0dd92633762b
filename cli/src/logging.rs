//! Logging setup for one CLI invocation.
//!
//! A job run logs to its own file below the configured log directory, or to
//! stderr when no directory is configured. `RUST_LOG` overrides the level.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use engine::config::{check_job_id, LoggingPolicy};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file of a run started at `started`, if the policy names a log directory.
///
/// `<log_dir>/<job_id>/<stamp>.log` with subdirectories,
/// `<log_dir>/<job_id>_<stamp>.log` without. A job id that is not a plain
/// name gets no log file.
pub fn log_file_path(
    policy: &LoggingPolicy,
    job_id: &str,
    started: DateTime<Local>,
) -> Option<PathBuf> {
    let dir = policy.log_dir.as_ref()?;
    check_job_id(job_id).ok()?;
    let stamp = started.format("%Y%m%d-%H%M%S");
    let path = if policy.use_subdirs {
        dir.join(job_id).join(format!("{}.log", stamp))
    } else {
        dir.join(format!("{}_{}.log", job_id, stamp))
    };
    Some(path)
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber, writing to `file` or to stderr.
///
/// # Returns
/// A guard that must be held for the duration of the program so buffered
/// lines reach the file
pub fn setup_logging(level: &str, file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let path = match file {
        Some(path) => path,
        None => {
            tracing_subscriber::registry()
                .with(env_filter(level))
                .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
                .try_init()
                .context("Failed to initialize logging")?;
            return Ok(None);
        }
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .with_context(|| format!("Invalid log file name: {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy().into_owned())
        .build(dir)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false) // No ANSI codes in log files
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    tracing::info!("Logging initialized: file={}, level={}", path.display(), level);
    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(dir: Option<&str>, use_subdirs: bool) -> LoggingPolicy {
        LoggingPolicy {
            level: "info".to_string(),
            log_dir: dir.map(PathBuf::from),
            use_subdirs,
        }
    }

    #[test]
    fn test_log_file_path_layouts() {
        let started = Local
            .with_ymd_and_hms(2024, 5, 1, 22, 30, 5)
            .single()
            .expect("Invalid timestamp");
        assert_eq!(
            log_file_path(&policy(Some("/var/log/ft"), true), "nightly", started),
            Some(PathBuf::from("/var/log/ft/nightly/20240501-223005.log"))
        );
        assert_eq!(
            log_file_path(&policy(Some("/var/log/ft"), false), "nightly", started),
            Some(PathBuf::from("/var/log/ft/nightly_20240501-223005.log"))
        );
        assert_eq!(log_file_path(&policy(None, true), "nightly", started), None);
    }

    #[test]
    fn test_log_file_path_rejects_path_like_job_id() {
        let started = Local::now();
        let policy = policy(Some("/var/log/ft"), false);
        assert_eq!(log_file_path(&policy, "../x", started), None);
        assert_eq!(log_file_path(&policy, "a/b", started), None);
        assert_eq!(log_file_path(&policy, "", started), None);
    }
}
