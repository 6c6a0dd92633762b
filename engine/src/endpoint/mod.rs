//! Transfer endpoints.
//!
//! A [`Session`] is the narrow capability a protocol has to provide: list a
//! directory, read, write, rename and remove files. Local filesystem, FTP,
//! FTPS and SFTP sessions ship with the crate; a [`Connector`] decides which one a host
//! configuration gets, so new protocols never touch the engine.
//!
//! [`SourceEndpoint`] and [`TargetEndpoint`] add the job semantics on top of
//! a session: pattern matching, recursion, post-processing, temp files.
//!
//! Paths handed to a session are `/`-separated strings.

pub mod ftp;
pub mod local;
pub mod pattern;
pub mod sftp;

use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::{endpoint_url, HostConfig, PostProcess, Protocol, SourceConfig, TargetConfig, TempStrategy};
use crate::error::{ConfigError, ConnectError, TransferError};
use crate::model::FileEntry;

use self::ftp::FtpSession;
use self::local::LocalSession;
use self::pattern::FileFilter;
use self::sftp::SftpSession;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
}

/// An open (or openable) connection to one endpoint.
pub trait Session {
    /// Establish the connection. Called once before any other operation.
    fn connect(&mut self) -> Result<(), ConnectError>;

    /// True if `connect` does network I/O.
    fn is_remote(&self) -> bool {
        false
    }

    fn read_dir(&mut self, dir: &str) -> io::Result<Vec<DirEntry>>;

    fn read(&mut self, path: &str) -> io::Result<Vec<u8>>;

    /// Create or truncate `path` and write `data`.
    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()>;

    fn exists(&mut self, path: &str) -> io::Result<bool>;

    fn mkdir_all(&mut self, dir: &str) -> io::Result<()>;

    fn remove(&mut self, path: &str) -> io::Result<()>;

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()>;

    /// Set the modification time, where the protocol supports it.
    fn set_modified(&mut self, _path: &str, _time: SystemTime) -> io::Result<()> {
        Ok(())
    }

    /// Close the connection. Must be safe to call more than once.
    fn close(&mut self);
}

/// Creates sessions for host configurations.
pub trait Connector {
    /// A session for `host`, or for the local filesystem when `None`.
    fn open(&self, host: Option<&HostConfig>) -> Result<Box<dyn Session>, ConnectError>;
}

/// Local, FTP, FTPS and SFTP sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardConnector;

impl Connector for StandardConnector {
    fn open(&self, host: Option<&HostConfig>) -> Result<Box<dyn Session>, ConnectError> {
        match host {
            None => Ok(Box::new(LocalSession)),
            Some(h) => match h.protocol {
                Protocol::Local => Ok(Box::new(LocalSession)),
                Protocol::Ftp => Ok(Box::new(FtpSession::new(Arc::new(h.clone()), false))),
                Protocol::Ftps => Ok(Box::new(FtpSession::new(Arc::new(h.clone()), true))),
                Protocol::Sftp => Ok(Box::new(SftpSession::new(Arc::new(h.clone())))),
            },
        }
    }
}

/// Transformation of file content between fetch and send, e.g. encryption.
pub trait ContentTransform {
    /// Transform `data` read from `path`. An `Err` is reported as a source error.
    fn apply(&self, path: &str, data: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// Join a base directory and a relative path.
pub fn join(base: &str, rel: &str) -> String {
    let base = base.trim_end_matches('/');
    match (base.is_empty(), rel.is_empty()) {
        (_, true) => base.to_string(),
        (true, false) => rel.to_string(),
        (false, false) => format!("{}/{}", base, rel),
    }
}

/// Split a path into its parent directory and last component.
fn split(path: &str) -> (Option<&str>, &str) {
    match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    }
}

/// Result of listing a source.
#[derive(Debug, Default)]
pub struct Listing {
    /// Matching files in listing order
    pub files: Vec<FileEntry>,
    /// Subdirectories that could not be read
    pub errors: Vec<TransferError>,
}

/// The source side of a job.
pub struct SourceEndpoint<'a> {
    config: &'a SourceConfig,
    filter: FileFilter,
    session: Box<dyn Session>,
    connected: bool,
}

impl<'a> SourceEndpoint<'a> {
    pub fn new(config: &'a SourceConfig, session: Box<dyn Session>) -> Result<Self, ConfigError> {
        Ok(SourceEndpoint {
            filter: FileFilter::new(&config.files, &config.ignore)?,
            config,
            session,
            connected: false,
        })
    }

    pub fn url(&self) -> String {
        endpoint_url(self.config.host.as_deref(), &self.config.path)
    }

    pub fn is_remote(&self) -> bool {
        self.session.is_remote()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connect unless already connected.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        if !self.connected {
            self.session.connect()?;
            self.connected = true;
        }
        Ok(())
    }

    /// True if `marker` exists in the source directory.
    pub fn has_marker(&mut self, marker: &str) -> io::Result<bool> {
        let path = join(&self.config.path, marker);
        self.session.exists(&path)
    }

    /// List the matching files, sorted by name within each directory.
    ///
    /// Fails only if the source directory itself cannot be read. `exclude`
    /// names a root-relative file that is never listed (the ready marker).
    pub fn list(&mut self, exclude: Option<&str>) -> Result<Listing, TransferError> {
        let mut listing = Listing::default();
        self.walk("", exclude, &mut listing)
            .map_err(|source| TransferError::List {
                path: self.config.path.clone(),
                source,
            })?;
        Ok(listing)
    }

    fn walk(&mut self, dir: &str, exclude: Option<&str>, listing: &mut Listing) -> io::Result<()> {
        let config = self.config;
        let mut entries = self.session.read_dir(&join(&config.path, dir))?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let skip_dir = match &config.post {
            PostProcess::MoveTo(d) => Some(d.trim_matches('/')),
            _ => None,
        };

        for entry in entries {
            let rel = join(dir, &entry.name);
            if entry.is_dir {
                if !config.recursive || Some(rel.as_str()) == skip_dir {
                    continue;
                }
                if let Err(source) = self.walk(&rel, exclude, listing) {
                    tracing::error!("Source - directory: {} ({})", rel, source);
                    listing.errors.push(TransferError::List { path: rel, source });
                }
            } else if Some(rel.as_str()) != exclude && self.filter.matches(&rel) {
                listing.files.push(FileEntry {
                    rel_path: rel,
                    size: entry.size,
                    modified: entry.modified,
                });
            }
        }
        Ok(())
    }

    /// Path of `entry` at the target: its relative path, or only its name
    /// when subdirectories are not kept.
    pub fn target_rel<'e>(&self, entry: &'e FileEntry) -> &'e str {
        if self.config.use_subdirs {
            &entry.rel_path
        } else {
            entry.name()
        }
    }

    pub fn fetch(&mut self, entry: &FileEntry) -> Result<Vec<u8>, TransferError> {
        let path = join(&self.config.path, &entry.rel_path);
        self.session.read(&path).map_err(|source| TransferError::Read {
            path: entry.rel_path.clone(),
            source,
        })
    }

    /// Apply the configured post-processing to a transferred file.
    pub fn postprocess(&mut self, entry: &FileEntry) -> Result<(), TransferError> {
        let path = join(&self.config.path, &entry.rel_path);
        let result = match &self.config.post {
            PostProcess::Keep => Ok(()),
            PostProcess::Delete => self.session.remove(&path),
            PostProcess::MoveTo(dir) => {
                let dest = join(&join(&self.config.path, dir), &entry.rel_path);
                let (parent, _) = split(&dest);
                parent
                    .map_or(Ok(()), |p| self.session.mkdir_all(p))
                    .and_then(|()| self.session.rename(&path, &dest))
            }
        };
        result.map_err(|source| TransferError::PostProcess {
            path: entry.rel_path.clone(),
            source,
        })
    }

    pub fn close(&mut self) {
        if self.connected {
            self.session.close();
            self.connected = false;
        }
    }
}

impl Drop for SourceEndpoint<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

/// The target side of a job.
pub struct TargetEndpoint<'a> {
    config: &'a TargetConfig,
    session: Box<dyn Session>,
    connected: bool,
}

impl<'a> TargetEndpoint<'a> {
    pub fn new(config: &'a TargetConfig, session: Box<dyn Session>) -> Self {
        TargetEndpoint {
            config,
            session,
            connected: false,
        }
    }

    pub fn url(&self) -> String {
        endpoint_url(self.config.host.as_deref(), &self.config.path)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn connect(&mut self) -> Result<(), ConnectError> {
        if !self.connected {
            self.session.connect()?;
            self.connected = true;
        }
        Ok(())
    }

    /// Store `data` as `rel` below the target directory, replacing an
    /// existing file. With a temp strategy the file only appears under its
    /// final name once complete.
    pub fn send(
        &mut self,
        rel: &str,
        data: &[u8],
        modified: Option<SystemTime>,
    ) -> Result<(), TransferError> {
        self.store(rel, data, modified)
            .map_err(|source| TransferError::Write {
                path: rel.to_string(),
                source,
            })
    }

    fn store(&mut self, rel: &str, data: &[u8], modified: Option<SystemTime>) -> io::Result<()> {
        let full = join(&self.config.path, rel);
        let (parent, name) = split(&full);
        if let Some(dir) = parent {
            self.session.mkdir_all(dir)?;
        }
        let temp = match &self.config.temp {
            TempStrategy::Direct => None,
            TempStrategy::Dot => Some(join(parent.unwrap_or(""), &format!(".{}", name))),
            TempStrategy::Ext(suffix) => Some(format!("{}{}", full, suffix)),
            TempStrategy::Dir(dir) => {
                let dir = join(&self.config.path, dir);
                self.session.mkdir_all(&dir)?;
                Some(join(&dir, name))
            }
        };
        tracing::debug!("target store {} (temp {:?})", full, temp);

        if self.session.exists(&full)? {
            self.session.remove(&full)?;
        }
        match &temp {
            Some(tmp) => {
                self.session.write(tmp, data)?;
                self.session.rename(tmp, &full)?;
            }
            None => self.session.write(&full, data)?,
        }
        if let Some(time) = modified {
            if let Err(e) = self.session.set_modified(&full, time) {
                tracing::debug!("cannot set modification time of {}: {}", full, e);
            }
        }
        Ok(())
    }

    /// Read a stored file back, for verification.
    pub fn read_back(&mut self, rel: &str) -> Result<Vec<u8>, TransferError> {
        let full = join(&self.config.path, rel);
        self.session.read(&full).map_err(|source| TransferError::Write {
            path: rel.to_string(),
            source,
        })
    }

    pub fn close(&mut self) {
        if self.connected {
            self.session.close();
            self.connected = false;
        }
    }
}

impl Drop for TargetEndpoint<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
