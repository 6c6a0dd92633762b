//! Job execution.
//!
//! [`Engine::run`] takes one validated job from "about to run" to a terminal
//! [`JobResult`]:
//!
//! ```text
//! INIT -> LOCKED -> READY_CHECKED -> SOURCE_CONNECTED -> TRANSFERRING
//!      -> TARGET_FINALIZED -> RESULT_BUILT -> UNLOCKED
//! ```
//!
//! Every step returns a typed outcome; early exits jump to building the
//! result. The lock is a guard, so it is released on every path, and the
//! notification is dispatched before it is.
//!
//! Per-file failures never stop a run. They are counted against the source
//! or the target and the next file is tried.

use std::collections::BTreeMap;
use std::error::Error;
use std::time::Instant;

use chrono::{DateTime, Local};

use crate::aggregate::ErrorAggregator;
use crate::cancel::CancellationToken;
use crate::checksums::ChecksumAlgorithm;
use crate::config::{JobConfig, NotifyPolicy};
use crate::endpoint::pattern::FileFilter;
use crate::endpoint::{
    Connector, ContentTransform, SourceEndpoint, StandardConnector, TargetEndpoint,
};
use crate::error::{error_chain, error_trace, ConfigError, LockError, Side, Terminated, TransferError};
use crate::lock::{local_host_name, LockManager};
use crate::model::{FileEntry, FileTags, JobResult, JobState, Status};
use crate::notify::{Dispatcher, MailSender, Message, StandardSender};
use crate::progress::ProgressCallback;
use crate::ready::ReadinessGate;
use crate::retry::{self, Outcome};

/// Why a run left the transfer steps early.
enum Abort {
    NotReady(String),
    Fatal { message: String, trace: String },
    Terminated,
}

impl Abort {
    fn fatal(err: &dyn Error) -> Self {
        Abort::Fatal {
            message: error_chain(err),
            trace: error_trace(err),
        }
    }
}

impl From<Terminated> for Abort {
    fn from(_: Terminated) -> Self {
        Abort::Terminated
    }
}

/// How one file ended, as far as the file loop is concerned.
enum FileEnd {
    Done,
    /// The endpoint on this side is gone
    Lost {
        side: Side,
        message: String,
        trace: String,
    },
    Terminated,
}

/// Runs jobs with a set of collaborators.
///
/// ```no_run
/// use engine::{Engine, JobConfig, Status};
///
/// let job = JobConfig::local("nightly", "/data/out", "/data/in", "/var/lock/filetransfer");
/// let result = Engine::new().run(&job);
/// assert_ne!(result.status(), Status::ConfigError);
/// ```
pub struct Engine {
    connector: Box<dyn Connector>,
    sender: Box<dyn MailSender>,
    transforms: BTreeMap<String, Box<dyn ContentTransform>>,
    progress: Option<Box<dyn ProgressCallback>>,
    cancel: CancellationToken,
    tags: FileTags,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine with local/SFTP sessions and the standard mail sender.
    pub fn new() -> Self {
        Engine {
            connector: Box::new(StandardConnector),
            sender: Box::new(StandardSender),
            transforms: BTreeMap::new(),
            progress: None,
            cancel: CancellationToken::new(),
            tags: FileTags::new(),
        }
    }

    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Box::new(connector);
        self
    }

    pub fn with_sender(mut self, sender: impl MailSender + 'static) -> Self {
        self.sender = Box::new(sender);
        self
    }

    /// Register a content transform under the name jobs refer to.
    pub fn with_transform(
        mut self,
        name: impl Into<String>,
        transform: impl ContentTransform + 'static,
    ) -> Self {
        self.transforms.insert(name.into(), Box::new(transform));
        self
    }

    pub fn with_progress(mut self, progress: impl ProgressCallback + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Extra placeholder value for notifications, e.g. `logfile`.
    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name, value);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Placeholder values known before a run starts.
    pub fn run_tags(&self, job: &JobConfig) -> FileTags {
        let mut tags = self.tags.clone();
        tags.insert("jobid", job.job_id.as_str());
        tags.insert("jobname", job.name.as_str());
        tags.insert("info", job.info.as_deref().unwrap_or("-"));
        tags.insert("host", local_host_name());
        tags.insert("source", job.source_url());
        tags.insert("target", job.target_url());
        tags
    }

    /// Dispatch a notification for `result` if `policy` asks for one.
    pub fn notify(
        &self,
        policy: &NotifyPolicy,
        result: &JobResult,
        tags: &FileTags,
    ) -> Option<Message> {
        Dispatcher::new(self.sender.as_ref()).dispatch(policy, result, tags)
    }

    /// Run `job` to completion. Never panics on I/O; every outcome is in the result.
    pub fn run(&self, job: &JobConfig) -> JobResult {
        let start = Local::now();
        let tags = self.run_tags(job);
        tracing::info!(
            "job {} ({}) started: {} -> {}",
            job.job_id,
            job.name,
            job.source_url(),
            job.target_url()
        );

        let transform = match self.resolve_transform(job) {
            Ok(t) => t,
            Err(e) => return self.config_error(job, start, &e, &tags),
        };
        if let Err(e) = FileFilter::new(&job.source.files, &job.source.ignore) {
            return self.config_error(job, start, &e, &tags);
        }

        let mut lock = None;
        if job.lock.single_instance {
            let key = LockManager::lock_key(&job.job_id, job.lock.per_host);
            match LockManager::new(&job.lock.dir).acquire(&key) {
                Ok(l) => lock = Some(l),
                Err(err) => {
                    let (status, trace) = match &err {
                        LockError::Held { .. } => {
                            tracing::warn!("{}", err);
                            (Status::Other, None)
                        }
                        LockError::Io { .. } => {
                            tracing::error!("{}", error_chain(&err));
                            (Status::Failure, Some(error_trace(&err)))
                        }
                    };
                    let result = JobResult::new(
                        job.job_id.clone(),
                        status,
                        start,
                        Local::now(),
                        0,
                        0,
                        0,
                        Some(error_chain(&err)),
                        trace,
                        None,
                    );
                    self.report(job, &result, &tags);
                    return result;
                }
            }
        }

        let mut run = Run::new(self, job, transform);
        run.state(JobState::Locked);
        let outcome = run.execute();
        let result = run.into_result(start, outcome);

        self.report(job, &result, &tags);
        if let Some(mut lock) = lock {
            lock.release();
        }
        tracing::debug!("job {}: {:?}", job.job_id, JobState::Unlocked);
        result
    }

    fn resolve_transform(&self, job: &JobConfig) -> Result<Option<&dyn ContentTransform>, ConfigError> {
        match &job.source.transform {
            None => Ok(None),
            Some(name) => self
                .transforms
                .get(name)
                .map(|t| Some(&**t))
                .ok_or_else(|| {
                    ConfigError::invalid("source.transform", format!("unknown transform '{}'", name))
                }),
        }
    }

    fn config_error(
        &self,
        job: &JobConfig,
        start: DateTime<Local>,
        err: &ConfigError,
        tags: &FileTags,
    ) -> JobResult {
        tracing::error!("job {}: {}", job.job_id, error_chain(err));
        let result = JobResult::config_error(job.job_id.as_str(), start, err);
        self.report(job, &result, tags);
        result
    }

    fn report(&self, job: &JobConfig, result: &JobResult, tags: &FileTags) {
        match result.status() {
            Status::Success => tracing::info!("job finished: {}", result),
            Status::Other | Status::Terminated => tracing::warn!("job finished: {}", result),
            _ => tracing::error!("job finished: {}", result),
        }
        if let Some(progress) = &self.progress {
            progress.on_job_completed(job, result);
        }
        self.notify(&job.notify, result, tags);
    }
}

/// Run `job` with the standard collaborators.
pub fn run_job(job: &JobConfig, cancel: &CancellationToken) -> JobResult {
    Engine::new().with_cancellation(cancel.clone()).run(job)
}

/// State of one run, from locking to the built result.
struct Run<'e> {
    engine: &'e Engine,
    job: &'e JobConfig,
    transform: Option<&'e dyn ContentTransform>,
    state: JobState,
    counts: ErrorAggregator,
    terminated: bool,
    fatal: Option<(String, String)>,
}

impl<'e> Run<'e> {
    fn new(engine: &'e Engine, job: &'e JobConfig, transform: Option<&'e dyn ContentTransform>) -> Self {
        Run {
            engine,
            job,
            transform,
            state: JobState::Init,
            counts: ErrorAggregator::new(),
            terminated: false,
            fatal: None,
        }
    }

    fn state(&mut self, next: JobState) {
        tracing::debug!("job {}: {:?} -> {:?}", self.job.job_id, self.state, next);
        self.state = next;
    }

    fn execute(&mut self) -> Result<(), Abort> {
        let job = self.job;
        let engine = self.engine;
        let cancel = &engine.cancel;
        let gate = ReadinessGate::new(&job.ready);

        let session = engine
            .connector
            .open(job.source.host.as_deref())
            .map_err(|e| Abort::fatal(&e))?;
        let mut source = SourceEndpoint::new(&job.source, session).map_err(|e| Abort::fatal(&e))?;

        // A remote marker can only be seen through a session, which is then reused.
        if gate.marker().is_some() && source.is_remote() {
            cancel.check()?;
            source.connect().map_err(|e| Abort::fatal(&e))?;
        }
        gate.check(&job.job_id, &mut source).map_err(|e| {
            tracing::warn!("{}", e);
            Abort::NotReady(e.to_string())
        })?;
        self.state(JobState::ReadyChecked);

        cancel.check()?;
        source.connect().map_err(|e| Abort::fatal(&e))?;
        let listing = source.list(gate.marker()).map_err(|e| Abort::fatal(&e))?;
        for err in &listing.errors {
            self.counts.failed(err);
        }
        self.state(JobState::SourceConnected);
        tracing::info!("{} files to transfer from {}", listing.files.len(), source.url());
        if let Some(progress) = &engine.progress {
            progress.on_job_started(job, listing.files.len());
        }
        if listing.files.is_empty() {
            source.close();
            self.state(JobState::TargetFinalized);
            return Ok(());
        }

        cancel.check()?;
        let opened = engine
            .connector
            .open(job.target.host.as_deref())
            .map(|session| TargetEndpoint::new(&job.target, session))
            .and_then(|mut target| target.connect().map(|()| target));
        let mut target = match opened {
            Ok(target) => target,
            Err(e) => {
                tracing::error!("Target - {}", error_chain(&e));
                let reason = error_chain(&e);
                for entry in &listing.files {
                    self.counts.failed_on(Side::Target, &entry.rel_path, reason.as_str());
                }
                return Err(Abort::fatal(&e));
            }
        };

        self.state(JobState::Transferring);
        let mut dead: Option<(Side, String)> = None;
        for (index, entry) in listing.files.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!(
                    "job {} terminated, {} files not attempted",
                    job.job_id,
                    listing.files.len() - index
                );
                self.terminated = true;
                break;
            }
            if let Some((side, reason)) = &dead {
                let record = self.counts.failed_on(*side, &entry.rel_path, reason.as_str());
                if let Some(progress) = &engine.progress {
                    progress.on_file_completed(job, index, record);
                }
                continue;
            }
            if let Some(progress) = &engine.progress {
                progress.on_file_started(job, index, entry);
            }
            match self.transfer_file(&mut source, &mut target, index, entry) {
                FileEnd::Done => {}
                FileEnd::Lost { side, message, trace } => {
                    tracing::error!("{} connection lost, remaining files fail", side);
                    dead = Some((side, format!("{} connection lost", side)));
                    if self.fatal.is_none() {
                        self.fatal = Some((message, trace));
                    }
                }
                FileEnd::Terminated => {
                    self.terminated = true;
                    break;
                }
            }
        }

        target.close();
        source.close();
        self.state(JobState::TargetFinalized);
        Ok(())
    }

    fn transfer_file(
        &mut self,
        source: &mut SourceEndpoint<'_>,
        target: &mut TargetEndpoint<'_>,
        index: usize,
        entry: &FileEntry,
    ) -> FileEnd {
        let job = self.job;
        let engine = self.engine;
        let transform = self.transform;
        let started = Instant::now();
        let target_rel = source.target_rel(entry).to_string();

        let outcome = retry::attempt(
            |attempt| {
                if attempt > 1 {
                    tracing::info!("attempt {} for {}", attempt, entry.rel_path);
                }
                copy_file(source, target, transform, job.verify, entry, &target_rel)
            },
            &job.retry,
            &engine.cancel,
        );

        let (record, end) = match outcome {
            Outcome::Succeeded { attempts, .. } => {
                if engine.cancel.is_cancelled() {
                    tracing::warn!("{} transferred but not post-processed", entry.rel_path);
                    let record = self
                        .counts
                        .unprocessed(&entry.rel_path, "transferred, not post-processed");
                    (record, FileEnd::Terminated)
                } else {
                    match source.postprocess(entry) {
                        Ok(()) => {
                            tracing::info!(
                                "transferred {} -> {} ({} attempt(s))",
                                entry.rel_path,
                                target_rel,
                                attempts
                            );
                            let info = format!("{:.2}s", started.elapsed().as_secs_f64());
                            (self.counts.transferred(&entry.rel_path, info), FileEnd::Done)
                        }
                        Err(err) => {
                            tracing::error!("Source - post-processing: {}", error_chain(&err));
                            // Post-processing runs on the source session
                            let end = lost_or_done(&err, Side::Source);
                            (self.counts.failed(&err), end)
                        }
                    }
                }
            }
            Outcome::Exhausted { error, attempts } => {
                tracing::error!(
                    "{} - file: {} ({} attempt(s))",
                    error.side(),
                    error_chain(&error),
                    attempts
                );
                let end = lost_or_done(&error, error.side());
                (self.counts.failed(&error), end)
            }
            Outcome::Cancelled { attempts } => {
                tracing::warn!(
                    "{} abandoned after {} attempt(s): terminated",
                    entry.rel_path,
                    attempts
                );
                return FileEnd::Terminated;
            }
        };
        if let Some(progress) = &engine.progress {
            progress.on_file_completed(job, index, record);
        }
        end
    }

    fn into_result(mut self, start: DateTime<Local>, outcome: Result<(), Abort>) -> JobResult {
        let (status, message, trace) = match outcome {
            Err(Abort::NotReady(message)) => (Status::Other, Some(message), None),
            Err(Abort::Terminated) => (Status::Terminated, Some(Terminated.to_string()), None),
            Ok(()) if self.terminated => (Status::Terminated, Some(Terminated.to_string()), None),
            Err(Abort::Fatal { message, trace }) => (Status::Failure, Some(message), Some(trace)),
            Ok(()) => match self.fatal.take() {
                Some((message, trace)) => (Status::Failure, Some(message), Some(trace)),
                None if self.counts.has_errors() => (Status::Error, None, None),
                None => (Status::Success, None, None),
            },
        };
        self.state(JobState::ResultBuilt);

        let (files, src, tgt) = (
            self.counts.files(),
            self.counts.src_errors(),
            self.counts.tgt_errors(),
        );
        let file_list = self.job.collect_data.then(|| self.counts.into_records());
        JobResult::new(
            self.job.job_id.clone(),
            status,
            start,
            Local::now(),
            files,
            src,
            tgt,
            message,
            trace,
            file_list,
        )
    }
}

fn lost_or_done(err: &TransferError, side: Side) -> FileEnd {
    if err.is_connection_lost() {
        FileEnd::Lost {
            side,
            message: error_chain(err),
            trace: error_trace(err),
        }
    } else {
        FileEnd::Done
    }
}

/// Fetch, transform, send and optionally verify one file.
fn copy_file(
    source: &mut SourceEndpoint<'_>,
    target: &mut TargetEndpoint<'_>,
    transform: Option<&dyn ContentTransform>,
    verify: Option<ChecksumAlgorithm>,
    entry: &FileEntry,
    target_rel: &str,
) -> Result<(), TransferError> {
    let data = source.fetch(entry)?;
    let data = match transform {
        Some(t) => t
            .apply(&entry.rel_path, data)
            .map_err(|reason| TransferError::Transform {
                path: entry.rel_path.clone(),
                reason,
            })?,
        None => data,
    };
    target.send(target_rel, &data, entry.modified)?;
    if let Some(algorithm) = verify {
        let expected = algorithm.digest(&data);
        let actual = algorithm.digest(&target.read_back(target_rel)?);
        if expected != actual {
            return Err(TransferError::Verify {
                path: target_rel.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PostProcess;
    use std::fs;
    use std::path::Path;

    fn local_job(dir: &Path) -> JobConfig {
        let src = dir.join("src");
        let dst = dir.join("dst");
        fs::create_dir_all(&src).expect("Failed to create src dir");
        fs::create_dir_all(&dst).expect("Failed to create dst dir");
        JobConfig::local(
            "unit",
            src.to_string_lossy().into_owned(),
            dst.to_string_lossy().into_owned(),
            dir.join("locks"),
        )
    }

    struct Upper;

    impl ContentTransform for Upper {
        fn apply(&self, _path: &str, data: Vec<u8>) -> Result<Vec<u8>, String> {
            Ok(data.to_ascii_uppercase())
        }
    }

    #[test]
    fn test_run_transfers_and_deletes() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut job = local_job(temp_dir.path());
        job.source.post = PostProcess::Delete;
        job.verify = Some(ChecksumAlgorithm::Sha256);
        job.collect_data = true;
        let src = temp_dir.path().join("src");
        fs::write(src.join("file1.txt"), b"test data 1").expect("Failed to write file1");
        fs::write(src.join("file2.txt"), b"test data 2").expect("Failed to write file2");

        let result = Engine::new().run(&job);

        assert_eq!(result.status(), Status::Success);
        assert_eq!(result.files_cnt(), 2);
        assert!(!src.join("file1.txt").exists());
        let copied = fs::read(temp_dir.path().join("dst").join("file2.txt")).expect("Failed to read");
        assert_eq!(copied, b"test data 2");
        assert_eq!(result.file_list().map(|l| l.len()), Some(2));
        assert!(!temp_dir.path().join("locks").join("unit.lock").exists());
    }

    #[test]
    fn test_empty_source_is_success() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let job = local_job(temp_dir.path());
        let result = Engine::new().run(&job);
        assert_eq!(result.status(), Status::Success);
        assert_eq!(result.files_cnt(), 0);
        assert!(result.file_list().is_none());
    }

    #[test]
    fn test_unknown_transform_is_config_error_without_lock() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut job = local_job(temp_dir.path());
        job.source.transform = Some("encrypt".to_string());
        let result = Engine::new().run(&job);
        assert_eq!(result.status(), Status::ConfigError);
        assert_eq!(result.files_cnt(), 0);
        assert!(!temp_dir.path().join("locks").exists());
    }

    #[test]
    fn test_registered_transform_is_applied() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut job = local_job(temp_dir.path());
        job.source.transform = Some("upper".to_string());
        fs::write(temp_dir.path().join("src").join("a.txt"), b"abc").expect("Failed to write");

        let result = Engine::new().with_transform("upper", Upper).run(&job);
        assert_eq!(result.status(), Status::Success);
        let copied = fs::read(temp_dir.path().join("dst").join("a.txt")).expect("Failed to read");
        assert_eq!(copied, b"ABC");
    }

    #[test]
    fn test_missing_source_dir_is_failure() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mut job = local_job(temp_dir.path());
        job.source.path = temp_dir.path().join("missing").to_string_lossy().into_owned();
        let result = Engine::new().run(&job);
        assert_eq!(result.status(), Status::Failure);
        assert!(result.stack_trace().is_some());
        assert!(!temp_dir.path().join("locks").join("unit.lock").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_fails_only_that_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let job = local_job(temp_dir.path());
        let src = temp_dir.path().join("src");
        fs::write(src.join("a.txt"), b"a").expect("Failed to write a.txt");
        fs::write(src.join("c.txt"), b"c").expect("Failed to write c.txt");
        std::os::unix::fs::symlink(src.join("gone"), src.join("b.txt"))
            .expect("Failed to create symlink");

        let result = Engine::new().run(&job);
        assert_eq!(result.status(), Status::Error);
        assert_eq!(result.files_cnt(), 2);
        assert_eq!(result.src_error_cnt(), 1);
        assert_eq!(result.tgt_error_cnt(), 0);
        assert!(temp_dir.path().join("dst").join("c.txt").exists());
    }

    #[test]
    fn test_cancelled_before_start_is_terminated() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let job = local_job(temp_dir.path());
        fs::write(temp_dir.path().join("src").join("a.txt"), b"a").expect("Failed to write");
        let token = CancellationToken::new();
        token.cancel();

        let result = run_job(&job, &token);
        assert_eq!(result.status(), Status::Terminated);
        assert_eq!(result.files_cnt(), 0);
        assert!(!temp_dir.path().join("dst").join("a.txt").exists());
    }

    #[test]
    fn test_run_tags() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let job = local_job(temp_dir.path());
        let tags = Engine::new().with_tag("logfile", "/var/log/ft.log").run_tags(&job);
        assert_eq!(tags.get("jobid"), Some("unit"));
        assert_eq!(tags.get("logfile"), Some("/var/log/ft.log"));
        assert_eq!(tags.get("info"), Some("-"));
    }
}
