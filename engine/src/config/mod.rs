//! Validated configuration for one job run.
//!
//! These types are produced by [`load`] from the YAML files and are read-only
//! afterwards. Host configurations are shared between source and target via
//! `Arc`, so a job only refers to them.

pub mod load;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::checksums::ChecksumAlgorithm;
use crate::model::Status;

pub use load::{check_job_id, config_path, load_app_config, load_hosts, load_job, CONFIG_ENV_VAR};

/// Default FTP port.
pub const FTP_PORT: u16 = 21;

/// Default SSH/SFTP port.
pub const SSH_PORT: u16 = 22;

/// Default SMTP port.
pub const SMTP_PORT: u16 = 25;

/// Transfer protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Local,
    Ftp,
    /// FTP with explicit TLS
    Ftps,
    Sftp,
}

impl Protocol {
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Local => 0,
            Protocol::Ftp | Protocol::Ftps => FTP_PORT,
            Protocol::Sftp => SSH_PORT,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Local => write!(f, "LOCAL"),
            Protocol::Ftp => write!(f, "FTP"),
            Protocol::Ftps => write!(f, "FTPS"),
            Protocol::Sftp => write!(f, "SFTP"),
        }
    }
}

/// Private key types accepted for SFTP authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Dsa,
    Ecdsa,
    Ed25519,
}

impl KeyType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "RSA" => Some(KeyType::Rsa),
            "DSA" => Some(KeyType::Dsa),
            "ECDSA" => Some(KeyType::Ecdsa),
            "ED25519" => Some(KeyType::Ed25519),
            _ => None,
        }
    }

    /// Lower-case name used in application-level key settings (`key_<name>_file`).
    pub fn name(&self) -> &'static str {
        match self {
            KeyType::Rsa => "rsa",
            KeyType::Dsa => "dsa",
            KeyType::Ecdsa => "ecdsa",
            KeyType::Ed25519 => "ed25519",
        }
    }
}

/// How a remote session authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Password(String),
    PrivateKey {
        key_type: KeyType,
        key_file: PathBuf,
        passphrase: Option<String>,
    },
}

/// Server host-key checking for SFTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownHosts {
    /// Reject servers whose key is not in this OpenSSH known-hosts file
    File(PathBuf),
    /// Accept any server key
    AcceptAny,
}

/// Connection facts for one named endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub id: String,
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub auth: Auth,
    pub passive_mode: bool,
    pub timeout: Option<Duration>,
    pub known_hosts: KnownHosts,
}

impl HostConfig {
    /// `sftp://user@host:port/path` style description for logs and messages.
    pub fn url(&self, path: &str) -> String {
        let scheme = self.protocol.to_string().to_lowercase();
        let sep = if path.starts_with('/') { "" } else { "/" };
        format!(
            "{}://{}@{}:{}{}{}",
            scheme, self.user, self.hostname, self.port, sep, path
        )
    }
}

/// What happens to a source file after it was transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcess {
    Keep,
    Delete,
    /// Move into this directory, relative to the source root
    MoveTo(String),
}

/// How the target writes a file before it is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempStrategy {
    /// Write the final name directly
    Direct,
    /// Write `.name` next to the final file
    Dot,
    /// Write `name<suffix>` next to the final file
    Ext(String),
    /// Write into this directory below the target root
    Dir(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// `None` for the local filesystem
    pub host: Option<Arc<HostConfig>>,
    pub path: String,
    pub files: Vec<String>,
    pub ignore: Vec<String>,
    pub recursive: bool,
    /// Keep the relative directory structure at the target
    pub use_subdirs: bool,
    pub post: PostProcess,
    /// Name of a registered content transform
    pub transform: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub host: Option<Arc<HostConfig>>,
    pub path: String,
    pub temp: TempStrategy,
}

/// Endpoint description for logs and messages.
pub fn endpoint_url(host: Option<&HostConfig>, path: &str) -> String {
    match host {
        Some(h) => h.url(path),
        None => format!("local://{}", path),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    pub single_instance: bool,
    /// Key the lock by job id and host name
    pub per_host: bool,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyPolicy {
    /// Marker file name, relative to the source directory
    pub marker: Option<String>,
}

/// A named mail configuration from the application config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailConfig {
    pub name: String,
    pub from: String,
    pub to: Vec<String>,
    /// SMTP host; `TEST` prints messages instead of sending them
    pub host: String,
    pub port: u16,
    pub subject: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPolicy {
    pub on: Vec<Status>,
    pub mail: Option<MailConfig>,
}

impl NotifyPolicy {
    pub fn wants(&self, status: Status) -> bool {
        self.mail.is_some() && self.on.contains(&status)
    }
}

impl Default for NotifyPolicy {
    fn default() -> Self {
        NotifyPolicy {
            on: default_notify_statuses(),
            mail: None,
        }
    }
}

pub(crate) fn default_notify_statuses() -> Vec<Status> {
    vec![
        Status::Error,
        Status::Failure,
        Status::ConfigError,
        Status::Terminated,
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingPolicy {
    pub level: String,
    pub log_dir: Option<PathBuf>,
    pub use_subdirs: bool,
}

impl Default for LoggingPolicy {
    fn default() -> Self {
        LoggingPolicy {
            level: "info".to_string(),
            log_dir: None,
            use_subdirs: true,
        }
    }
}

/// One validated job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub job_id: String,
    pub name: String,
    pub info: Option<String>,
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub retry: RetryPolicy,
    pub lock: LockPolicy,
    pub ready: ReadyPolicy,
    pub notify: NotifyPolicy,
    pub logging: LoggingPolicy,
    pub verify: Option<ChecksumAlgorithm>,
    /// Keep per-file records in the result
    pub collect_data: bool,
}

impl JobConfig {
    /// A local-to-local job with defaults, mainly for embedding and tests.
    pub fn local(
        job_id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        let job_id = job_id.into();
        JobConfig {
            name: job_id.clone(),
            job_id,
            info: None,
            source: SourceConfig {
                host: None,
                path: source.into(),
                files: vec!["*".to_string()],
                ignore: vec![".*".to_string()],
                recursive: false,
                use_subdirs: true,
                post: PostProcess::Keep,
                transform: None,
            },
            target: TargetConfig {
                host: None,
                path: target.into(),
                temp: TempStrategy::Direct,
            },
            retry: RetryPolicy::default(),
            lock: LockPolicy {
                single_instance: true,
                per_host: false,
                dir: lock_dir.into(),
            },
            ready: ReadyPolicy::default(),
            notify: NotifyPolicy::default(),
            logging: LoggingPolicy::default(),
            verify: None,
            collect_data: false,
        }
    }

    pub fn source_url(&self) -> String {
        endpoint_url(self.source.host.as_deref(), &self.source.path)
    }

    pub fn target_url(&self) -> String {
        endpoint_url(self.target.host.as_deref(), &self.target.path)
    }
}

/// SFTP defaults from the application config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SftpDefaults {
    pub known_hosts: Option<PathBuf>,
    /// Key file and passphrase per key type name (`rsa`, `ed25519`, ...)
    pub keys: BTreeMap<String, (PathBuf, Option<String>)>,
}

/// Application-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub path: PathBuf,
    pub jobs_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub hosts_cfg: Option<PathBuf>,
    pub logging: LoggingPolicy,
    pub sftp: SftpDefaults,
    pub mail: BTreeMap<String, MailConfig>,
}
