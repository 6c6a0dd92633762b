//! Core data model for job runs.
//!
//! - `Status`: terminal outcome of a run
//! - `JobResult`: the immutable record a run produces
//! - `FileEntry`: a file listed at the source
//! - `FileRecord` / `FileMark`: per-file outcome for the collected file list
//! - `FileTags`: placeholder values gathered for notifications
//! - `JobState`: lifecycle states of the engine

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Terminal status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Every listed file was transferred
    Success,
    /// The job completed but some files failed
    Error,
    /// The run was aborted by a fatal condition
    Failure,
    /// The configuration is invalid; nothing was attempted
    ConfigError,
    /// Cancellation was requested and honored
    Terminated,
    /// Nothing to do: lock held by a live run or source not ready
    Other,
}

impl Status {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Error => 1,
            Status::Failure => 2,
            Status::ConfigError => 3,
            Status::Terminated => 5,
            Status::Other => 6,
        }
    }

    /// Short human-readable description, used as `status_text` in messages.
    pub fn description(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Error => "with errors",
            Status::Failure => "failure",
            Status::ConfigError => "config error",
            Status::Terminated => "terminated",
            Status::Other => "skipped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Success => "SUCCESS",
            Status::Error => "ERROR",
            Status::Failure => "FAILURE",
            Status::ConfigError => "CONFIG_ERROR",
            Status::Terminated => "TERMINATED",
            Status::Other => "OTHER",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "SUCCESS" => Ok(Status::Success),
            "ERROR" => Ok(Status::Error),
            "FAILURE" => Ok(Status::Failure),
            "CONFIG_ERROR" => Ok(Status::ConfigError),
            "TERMINATED" => Ok(Status::Terminated),
            "OTHER" => Ok(Status::Other),
            _ => Err(format!("unknown status '{}'", s)),
        }
    }
}

/// A file found at the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the source directory, `/`-separated
    pub rel_path: String,

    /// Size in bytes, if the listing reported one
    pub size: Option<u64>,

    /// Modification time, if the listing reported one
    pub modified: Option<SystemTime>,
}

impl FileEntry {
    /// Last path component.
    pub fn name(&self) -> &str {
        self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path)
    }
}

/// Outcome mark of a file in the collected file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileMark {
    /// Transferred (and post-processed)
    Transferred,
    /// Failed on the source side
    SourceError,
    /// Failed on the target side
    TargetError,
    /// Transferred but left unprocessed because the run was cancelled
    Unprocessed,
}

impl fmt::Display for FileMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = match self {
            FileMark::Transferred => "=",
            FileMark::SourceError => ">",
            FileMark::TargetError => "<",
            FileMark::Unprocessed => "~",
        };
        write!(f, "{}", mark)
    }
}

/// One line of the collected file list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Path relative to the source/target directory
    pub path: String,
    /// Duration of the transfer or error text
    pub info: String,
    pub mark: FileMark,
}

/// The terminal, immutable record of one run.
///
/// Built once by the engine (or by [`JobResult::config_error`]) and only
/// read afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    job_id: String,
    status: Status,
    start_time: DateTime<Local>,
    end_time: DateTime<Local>,
    files_cnt: u64,
    src_error_cnt: u64,
    tgt_error_cnt: u64,
    error_message: Option<String>,
    stack_trace: Option<String>,
    file_list: Option<Vec<FileRecord>>,
}

impl JobResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_id: String,
        status: Status,
        start_time: DateTime<Local>,
        end_time: DateTime<Local>,
        files_cnt: u64,
        src_error_cnt: u64,
        tgt_error_cnt: u64,
        error_message: Option<String>,
        stack_trace: Option<String>,
        file_list: Option<Vec<FileRecord>>,
    ) -> Self {
        JobResult {
            job_id,
            status,
            start_time,
            end_time,
            files_cnt,
            src_error_cnt,
            tgt_error_cnt,
            error_message,
            stack_trace,
            file_list,
        }
    }

    /// Result for a run that never started because its configuration is invalid.
    pub fn config_error(
        job_id: impl Into<String>,
        start_time: DateTime<Local>,
        err: &crate::error::ConfigError,
    ) -> Self {
        JobResult {
            job_id: job_id.into(),
            status: Status::ConfigError,
            start_time,
            end_time: Local::now(),
            files_cnt: 0,
            src_error_cnt: 0,
            tgt_error_cnt: 0,
            error_message: Some(crate::error::error_chain(err)),
            stack_trace: Some(crate::error::error_trace(err)),
            file_list: None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn start_time(&self) -> DateTime<Local> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Local> {
        self.end_time
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }

    pub fn files_cnt(&self) -> u64 {
        self.files_cnt
    }

    pub fn src_error_cnt(&self) -> u64 {
        self.src_error_cnt
    }

    pub fn tgt_error_cnt(&self) -> u64 {
        self.tgt_error_cnt
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    /// Per-file records, sorted by path; `None` unless data collection is on.
    pub fn file_list(&self) -> Option<&[FileRecord]> {
        self.file_list.as_deref()
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {} files transferred, {} source errors, {} target errors",
            self.job_id, self.status, self.files_cnt, self.src_error_cnt, self.tgt_error_cnt
        )?;
        if let Some(msg) = &self.error_message {
            write!(f, " ({})", msg)?;
        }
        Ok(())
    }
}

/// Placeholder values for notification templates, filled in during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTags {
    values: BTreeMap<String, String>,
}

impl FileTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Lifecycle states of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobState {
    Init,
    Locked,
    ReadyChecked,
    SourceConnected,
    Transferring,
    TargetFinalized,
    ResultBuilt,
    Unlocked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_names() {
        for status in [
            Status::Success,
            Status::Error,
            Status::Failure,
            Status::ConfigError,
            Status::Terminated,
            Status::Other,
        ] {
            assert_eq!(status.to_string().parse::<Status>(), Ok(status));
        }
        assert_eq!("config-error".parse::<Status>(), Ok(Status::ConfigError));
        assert!("bogus".parse::<Status>().is_err());
    }

    #[test]
    fn test_config_error_has_distinct_exit_code() {
        let others = [
            Status::Success,
            Status::Error,
            Status::Failure,
            Status::Terminated,
            Status::Other,
        ];
        assert!(others
            .iter()
            .all(|s| s.exit_code() != Status::ConfigError.exit_code()));
    }

    #[test]
    fn test_config_error_result_has_no_files() {
        let err = crate::error::ConfigError::missing("source.path");
        let result = JobResult::config_error("job1", Local::now(), &err);
        assert_eq!(result.status(), Status::ConfigError);
        assert_eq!(result.files_cnt(), 0);
        assert_eq!(result.error_message(), Some("\"source.path\" is required"));
    }

    #[test]
    fn test_file_entry_name() {
        let entry = FileEntry {
            rel_path: "a/b/c.txt".to_string(),
            size: None,
            modified: None,
        };
        assert_eq!(entry.name(), "c.txt");
    }
}
