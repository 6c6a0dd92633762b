//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which keeps the engine
//! independent of how progress is shown. The CLI prints it in verbose mode.

use crate::config::JobConfig;
use crate::model::{FileEntry, FileRecord, JobResult};

/// Receives progress updates from a job run.
///
/// All methods are called synchronously on the thread running the job.
pub trait ProgressCallback {
    /// Called once the source is listed, before the first file.
    fn on_job_started(&self, job: &JobConfig, file_count: usize);

    /// Called when a file is about to be transferred.
    fn on_file_started(&self, job: &JobConfig, file_index: usize, file: &FileEntry);

    /// Called when a file is done, with its outcome.
    fn on_file_completed(&self, job: &JobConfig, file_index: usize, record: &FileRecord);

    /// Called with the final result, on every exit path after locking.
    fn on_job_completed(&self, job: &JobConfig, result: &JobResult);
}
