//! Single-instance locking.
//!
//! A lock is a marker file `<job_id>.lock` (or `<job_id>@<host>.lock`) in the
//! lock directory. The marker is written to a private file first and then
//! hard-linked into place, so racing processes cannot both win and nobody
//! sees a half-written marker. The marker records the owner; a marker whose
//! owner process is gone is stale and reclaimed.
//!
//! [`JobLock`] releases the marker when dropped, so every exit path of a run
//! gives the lock back.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use sysinfo::{Pid, System};
use uuid::Uuid;

use crate::error::LockError;

/// Identity written into a lock marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub run_id: Uuid,
}

impl LockOwner {
    /// Identity of the current process.
    pub fn current() -> Self {
        LockOwner {
            pid: std::process::id(),
            host: local_host_name(),
            run_id: Uuid::new_v4(),
        }
    }

    fn to_marker(&self) -> String {
        format!(
            "pid={}\nhost={}\nrun={}\nstarted={}\n",
            self.pid,
            self.host,
            self.run_id,
            Local::now().to_rfc3339()
        )
    }

    fn parse(content: &str) -> Option<Self> {
        let mut pid = None;
        let mut host = None;
        let mut run_id = None;
        for line in content.lines() {
            match line.split_once('=') {
                Some(("pid", v)) => pid = v.trim().parse().ok(),
                Some(("host", v)) => host = Some(v.trim().to_string()),
                Some(("run", v)) => run_id = Uuid::parse_str(v.trim()).ok(),
                _ => {}
            }
        }
        Some(LockOwner {
            pid: pid?,
            host: host?,
            run_id: run_id?,
        })
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pid {} on {}", self.pid, self.host)
    }
}

/// Host name of this machine, `localhost` if unknown.
pub fn local_host_name() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Decides whether a recorded owner is still running.
pub trait Liveness {
    fn is_alive(&self, owner: &LockOwner) -> bool;
}

/// Process table lookup on the local host.
///
/// A marker written on another host cannot be checked and counts as alive.
#[derive(Debug, Default)]
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    fn is_alive(&self, owner: &LockOwner) -> bool {
        if owner.host != local_host_name() {
            return true;
        }
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(owner.pid))
    }
}

/// Creates job locks in one directory.
pub struct LockManager {
    dir: PathBuf,
    liveness: Box<dyn Liveness + Send + Sync>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").field("dir", &self.dir).finish()
    }
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_liveness(dir, ProcessLiveness)
    }

    pub fn with_liveness(
        dir: impl Into<PathBuf>,
        liveness: impl Liveness + Send + Sync + 'static,
    ) -> Self {
        LockManager {
            dir: dir.into(),
            liveness: Box::new(liveness),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Marker path for a lock key.
    pub fn marker_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", key))
    }

    /// Lock key for a job: the job id, optionally qualified by this host.
    pub fn lock_key(job_id: &str, per_host: bool) -> String {
        if per_host {
            format!("{}@{}", job_id, local_host_name())
        } else {
            job_id.to_string()
        }
    }

    /// Take the lock for `key` or fail with `LockError::Held`.
    pub fn acquire(&self, key: &str) -> Result<JobLock, LockError> {
        fs::create_dir_all(&self.dir).map_err(|e| LockError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let path = self.marker_path(key);
        let owner = LockOwner::current();

        for _ in 0..ACQUIRE_ATTEMPTS {
            match self.publish(key, &path, &owner) {
                Ok(()) => {
                    tracing::debug!("lock acquired: {}", path.display());
                    return Ok(JobLock {
                        path,
                        owner,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LockError::Io { path, source: e }),
            }

            let seen = match fs::read_to_string(&path) {
                Ok(content) => content,
                // Released since our attempt
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(LockError::Io { path, source: e }),
            };
            match LockOwner::parse(&seen) {
                Some(other) if self.liveness.is_alive(&other) => {
                    return Err(held(key, Some(other)));
                }
                Some(other) => {
                    tracing::warn!("removing stale lock {} ({})", path.display(), other);
                }
                None if !older_than(&path, UNREADABLE_GRACE) => return Err(held(key, None)),
                None => tracing::warn!("removing unreadable lock {}", path.display()),
            }
            self.reclaim(key, &path, &seen, &owner)?;
        }
        // Other processes kept winning the marker
        Err(held(key, None))
    }

    /// Write the owner record to a private file and link it to `path`.
    ///
    /// The link fails with `AlreadyExists` if a marker is present, and a
    /// marker is never visible before its content is complete.
    fn publish(&self, key: &str, path: &Path, owner: &LockOwner) -> io::Result<()> {
        let tmp = self.dir.join(format!(".{}.{}.tmp", key, owner.run_id));
        let result = write_marker(&tmp, owner).and_then(|()| fs::hard_link(&tmp, path));
        match fs::remove_file(&tmp) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("cannot remove {}: {}", tmp.display(), e),
        }
        result
    }

    /// Remove a stale marker whose content was `seen`.
    ///
    /// The marker is first renamed to a private name, so only one process
    /// can take it away. If the renamed file is no longer the stale marker,
    /// a new owner published in between and its marker is put back.
    fn reclaim(
        &self,
        key: &str,
        path: &Path,
        seen: &str,
        owner: &LockOwner,
    ) -> Result<(), LockError> {
        let aside = self.dir.join(format!(".{}.{}.stale", key, owner.run_id));
        match fs::rename(path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }
        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved != seen {
            if let Err(e) = fs::hard_link(&aside, path) {
                tracing::error!("cannot restore lock {}: {}", path.display(), e);
            }
            remove_aside(&aside);
            return Err(held(key, LockOwner::parse(&moved)));
        }
        remove_aside(&aside);
        Ok(())
    }
}

/// Attempts to publish a marker before giving up on a contended lock.
const ACQUIRE_ATTEMPTS: usize = 3;

/// An unparsable marker younger than this is treated as held.
const UNREADABLE_GRACE: Duration = Duration::from_secs(30);

fn held(key: &str, owner: Option<LockOwner>) -> LockError {
    LockError::Held {
        job_id: key.to_string(),
        owner: owner.map_or_else(|| "unknown".to_string(), |o| o.to_string()),
    }
}

fn older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed >= age)
}

fn remove_aside(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("cannot remove {}: {}", path.display(), e);
    }
}

fn write_marker(path: &Path, owner: &LockOwner) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(owner.to_marker().as_bytes())?;
    file.sync_all()
}

/// A held job lock. Released on drop.
#[derive(Debug)]
pub struct JobLock {
    path: PathBuf,
    owner: LockOwner,
    released: bool,
}

impl JobLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Remove the marker. Calling it again is a no-op.
    ///
    /// The marker is only removed while it still names this run, so a lock
    /// reclaimed by someone else is left alone.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| LockOwner::parse(&c))
            .is_some_and(|o| o.run_id == self.owner.run_id);
        if !ours {
            tracing::warn!("lock {} no longer owned by this run", self.path.display());
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("lock released: {}", self.path.display()),
            Err(e) => tracing::error!("cannot remove lock {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        self.release();
    }
}
