//! Error types for the transfer engine.
//!
//! Each failure kind of a job run has its own type so the engine can check
//! outcomes step by step. `EngineError` wraps all of them for callers that
//! want a single error type.
//!
//! File-level failures (`TransferError`) are recovered by the engine and
//! counted; they only surface as text in the job result's file list.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// The endpoint a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "Source"),
            Side::Target => write!(f, "Target"),
        }
    }
}

/// Invalid or missing configuration. Fatal before a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key or section is absent
    #[error("\"{key}\" is required")]
    Missing { key: String },

    /// A key has a value that cannot be used
    #[error("wrong value for \"{key}\": {reason}")]
    Invalid { key: String, reason: String },

    /// A job references a host id that is not defined
    #[error("unknown host id \"{host_id}\" in \"{section}\"")]
    UnknownHost { section: String, host_id: String },

    /// Neither a command-line path nor the environment variable was given
    #[error("no configuration file given (set {env_var} or use --config)")]
    NoConfigFile { env_var: String },

    /// A configuration file could not be read
    #[error("cannot read configuration file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A configuration file is not valid YAML or has the wrong shape
    #[error("cannot parse configuration file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },
}

impl ConfigError {
    pub fn missing(key: impl Into<String>) -> Self {
        ConfigError::Missing { key: key.into() }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Failure to take the single-instance lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another live run owns the lock
    #[error("already running: job {job_id} ({owner})")]
    Held { job_id: String, owner: String },

    /// The lock directory or marker file could not be used
    #[error("lock file {} not usable", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The job's ready marker is absent at the source.
#[derive(Debug, Error)]
#[error("job {job_id} not ready: marker \"{marker}\" not found")]
pub struct NotReadyError {
    pub job_id: String,
    pub marker: String,
}

/// An endpoint could not be connected or authenticated.
#[derive(Debug, Error)]
#[error("connection to {endpoint} failed: {reason}")]
pub struct ConnectError {
    pub endpoint: String,
    pub reason: String,
    #[source]
    pub source: Option<io::Error>,
}

impl ConnectError {
    pub fn new(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        ConnectError {
            endpoint: endpoint.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub fn with_source(endpoint: impl Into<String>, source: io::Error) -> Self {
        ConnectError {
            endpoint: endpoint.into(),
            reason: source.to_string(),
            source: Some(source),
        }
    }
}

/// A single file operation failed.
///
/// Every variant is attributed to exactly one side, see [`TransferError::side`].
#[derive(Debug, Error)]
pub enum TransferError {
    /// Listing a source directory failed
    #[error("cannot list {path}")]
    List {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Reading the source file failed
    #[error("cannot read {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The content transform rejected the data
    #[error("content transform failed for {path}: {reason}")]
    Transform { path: String, reason: String },

    /// Writing the target file failed
    #[error("cannot write {path}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The stored file does not match what was read
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    Verify {
        path: String,
        expected: String,
        actual: String,
    },

    /// Deleting or moving the source file after transfer failed
    #[error("post-processing failed for {path}")]
    PostProcess {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    /// The counter this failure is charged to.
    ///
    /// Post-processing touches the source file but is charged to the target
    /// so that a file is never counted as both transferred and failed.
    pub fn side(&self) -> Side {
        match self {
            Self::List { .. } | Self::Read { .. } | Self::Transform { .. } => Side::Source,
            Self::Write { .. } | Self::Verify { .. } | Self::PostProcess { .. } => Side::Target,
        }
    }

    /// The file or directory the failure is about.
    pub fn path(&self) -> &str {
        match self {
            Self::List { path, .. }
            | Self::Read { path, .. }
            | Self::Transform { path, .. }
            | Self::Write { path, .. }
            | Self::Verify { path, .. }
            | Self::PostProcess { path, .. } => path,
        }
    }

    fn io_source(&self) -> Option<&io::Error> {
        match self {
            Self::List { source, .. }
            | Self::Read { source, .. }
            | Self::Write { source, .. }
            | Self::PostProcess { source, .. } => Some(source),
            Self::Transform { .. } | Self::Verify { .. } => None,
        }
    }

    /// True when the underlying session is gone and further operations on the
    /// same endpoint cannot succeed.
    pub fn is_connection_lost(&self) -> bool {
        self.io_source().is_some_and(|e| {
            matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            )
        })
    }

    /// Connection loss is not worth retrying; everything else is.
    pub fn is_retryable(&self) -> bool {
        !self.is_connection_lost()
    }
}

/// Cancellation was requested and observed at a checkpoint.
#[derive(Debug, Clone, Copy, Error)]
#[error("terminated")]
pub struct Terminated;

/// Any error the engine can report, for callers that need a single type.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    NotReady(#[from] NotReadyError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Terminated(#[from] Terminated),
}

/// Render an error and its causes on one line, `outer: inner: ...`.
pub fn error_chain(err: &dyn Error) -> String {
    let mut text = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        cause = inner.source();
    }
    text
}

/// Render an error and its causes as a multi-line trace.
pub fn error_trace(err: &dyn Error) -> String {
    let mut lines = vec![format!("{}", err)];
    let mut cause = err.source();
    while let Some(inner) = cause {
        lines.push(format!("  caused by: {}", inner));
        cause = inner.source();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_attribution() {
        let read = TransferError::Read {
            path: "a.txt".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "gone"),
        };
        let post = TransferError::PostProcess {
            path: "a.txt".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(read.side(), Side::Source);
        assert_eq!(post.side(), Side::Target);
    }

    #[test]
    fn test_connection_loss_is_not_retryable() {
        let lost = TransferError::Write {
            path: "b.txt".to_string(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "pipe"),
        };
        let full = TransferError::Write {
            path: "b.txt".to_string(),
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        assert!(lost.is_connection_lost());
        assert!(!lost.is_retryable());
        assert!(full.is_retryable());
    }

    #[test]
    fn test_error_chain_includes_causes() {
        let err = TransferError::Read {
            path: "c.txt".to_string(),
            source: io::Error::new(io::ErrorKind::Other, "bad sector"),
        };
        assert_eq!(error_chain(&err), "cannot read c.txt: bad sector");
        assert!(error_trace(&err).contains("caused by: bad sector"));
    }
}
