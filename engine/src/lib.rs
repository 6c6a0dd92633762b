//! # FileTransfer Engine - Transfer Job Execution Library
//!
//! Runs configured file-transfer jobs: list the files at a source endpoint,
//! copy each one to a target endpoint, post-process the source, and report a
//! single terminal result. Designed as the core for the CLI and for
//! embedding in schedulers.
//!
//! ## Overview
//!
//! - Single-instance locking per job, with stale-lock recovery
//! - Readiness markers that gate a run until the source is complete
//! - Local, FTP, FTPS and SFTP endpoints behind one session trait
//! - Per-file retries and error isolation, counted per side
//! - Cooperative cancellation
//! - Templated notifications on selected outcomes
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::Path;
//! use engine::{load_app_config, load_job, Engine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let app = load_app_config(Path::new("/etc/filetransfer/filetransfer.yml"))?;
//! let job = load_job(&app, "nightly")?;
//!
//! let result = Engine::new().run(&job);
//! println!("{}", result);
//! std::process::exit(result.status().exit_code());
//! # }
//! ```
//!
//! ## Modules
//!
//! - **config**: Validated job, host and application configuration
//! - **job**: The engine and its run lifecycle
//! - **endpoint**: Sessions, source listing and target writing
//! - **lock**: Single-instance lock files
//! - **ready**: Readiness gate
//! - **retry**: Bounded per-file retries
//! - **notify**: Notification rendering and dispatch
//! - **model**: Results, statuses and per-file records
//! - **error**: Error types

pub mod aggregate;
pub mod cancel;
pub mod checksums;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod job;
pub mod lock;
pub mod model;
pub mod notify;
pub mod progress;
pub mod ready;
pub mod retry;

// Re-export main types and functions
pub use cancel::CancellationToken;
pub use checksums::{ChecksumAlgorithm, ChecksumValue};
pub use config::{
    config_path, load_app_config, load_hosts, load_job, AppConfig, HostConfig, JobConfig,
    CONFIG_ENV_VAR,
};
pub use endpoint::{Connector, ContentTransform, Session, StandardConnector};
pub use error::{
    ConfigError, ConnectError, EngineError, LockError, NotReadyError, Terminated, TransferError,
};
pub use job::{run_job, Engine};
pub use model::{FileEntry, FileMark, FileRecord, FileTags, JobResult, JobState, Status};
pub use notify::{MailSender, Message, StandardSender};
pub use progress::ProgressCallback;
