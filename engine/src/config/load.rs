//! Loading and validating the YAML configuration files.
//!
//! Three files are involved:
//! - the application config (path from the command line or `FILETRANSFER_CFG`)
//! - one job file per job: `<jobs_dir>/<job_id>.yaml`
//! - the hosts file named by `global.hosts_cfg`
//!
//! Raw serde structs mirror the files; `validate_*` functions turn them into
//! the types of the parent module or fail with a `ConfigError` naming the key.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::{
    default_notify_statuses, AppConfig, Auth, HostConfig, JobConfig, KeyType, KnownHosts,
    LockPolicy, LoggingPolicy, MailConfig, NotifyPolicy, PostProcess, Protocol, ReadyPolicy,
    RetryPolicy, SftpDefaults, SourceConfig, TargetConfig, TempStrategy, SMTP_PORT,
};
use crate::checksums::ChecksumAlgorithm;
use crate::endpoint::pattern::FileFilter;
use crate::error::ConfigError;
use crate::model::Status;

/// Environment variable holding the application config path.
pub const CONFIG_ENV_VAR: &str = "FILETRANSFER_CFG";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_vec(self, sep: char) -> Vec<String> {
        let items = match self {
            StringOrList::One(s) => s.split(sep).map(str::to_string).collect(),
            StringOrList::Many(v) => v,
        };
        items
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawApp {
    global: Option<RawGlobal>,
    logging: Option<RawLogging>,
    sftp: Option<RawSftp>,
    #[serde(default)]
    mail: BTreeMap<String, RawMail>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGlobal {
    jobs_dir: Option<String>,
    locks_dir: Option<String>,
    hosts_cfg: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLogging {
    log_dir: Option<String>,
    use_subdirs: Option<bool>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSftp {
    known_hosts: Option<String>,
    key_rsa_file: Option<String>,
    key_rsa_pass: Option<String>,
    key_dsa_file: Option<String>,
    key_dsa_pass: Option<String>,
    key_ecdsa_file: Option<String>,
    key_ecdsa_pass: Option<String>,
    key_ed25519_file: Option<String>,
    key_ed25519_pass: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMail {
    from: Option<String>,
    to: Option<StringOrList>,
    host: Option<String>,
    port: Option<u32>,
    subject: Option<String>,
    template: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawHost {
    #[serde(alias = "type")]
    protocol: Option<String>,
    host: Option<String>,
    port: Option<u32>,
    user: Option<String>,
    password: Option<String>,
    key_type: Option<String>,
    key_file: Option<String>,
    key_pass: Option<String>,
    passive_mode: Option<bool>,
    timeout_secs: Option<f64>,
    known_hosts: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawJob {
    job: Option<RawJobSection>,
    source: Option<RawSource>,
    target: Option<RawTarget>,
    retry: Option<RawRetry>,
    verify: Option<String>,
    notify: Option<RawNotify>,
}

#[derive(Debug, Default, Deserialize)]
struct RawJobSection {
    name: Option<String>,
    info: Option<String>,
    single_instance: Option<bool>,
    lock_per_host: Option<bool>,
    ready_marker: Option<String>,
    collect_data: Option<bool>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    host_id: Option<String>,
    path: Option<String>,
    files: Option<StringOrList>,
    ignore: Option<StringOrList>,
    recursive: Option<bool>,
    use_subdirs: Option<bool>,
    post: Option<String>,
    delete: Option<bool>,
    transform: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    host_id: Option<String>,
    path: Option<String>,
    temp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    max_attempts: Option<u32>,
    delay_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawNotify {
    on: Option<Vec<String>>,
    mail: Option<String>,
}

/// Resolve the application config path: explicit path first, then the
/// environment variable.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => Err(ConfigError::NoConfigFile {
            env_var: CONFIG_ENV_VAR.to_string(),
        }),
    }
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_yaml_ng::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn expand_user(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn check_port(value: u32, key: &str) -> Result<u16, ConfigError> {
    if (1..=65535).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ConfigError::invalid(key, "port must be between 1 and 65535"))
    }
}

/// Split `host[:port]`, falling back to `default_port`.
fn split_host_port(s: &str, default_port: u16, key: &str) -> Result<(String, u16), ConfigError> {
    match s.split_once(':') {
        None => Ok((s.to_string(), default_port)),
        Some((host, port)) => {
            let port: u32 = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(key, format!("port must be integer in \"{}\"", s)))?;
            Ok((host.to_string(), check_port(port, key)?))
        }
    }
}

fn check_log_level(level: &str, key: &str) -> Result<String, ConfigError> {
    let level = level.trim().to_lowercase();
    if LOG_LEVELS.contains(&level.as_str()) {
        Ok(level)
    } else {
        Err(ConfigError::invalid(key, format!("unknown log level '{}'", level)))
    }
}

/// Load and validate the application config file.
pub fn load_app_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw: RawApp = read_yaml(path)?;
    let global = raw.global.ok_or_else(|| ConfigError::missing("global"))?;
    let jobs_dir = global
        .jobs_dir
        .map(|d| expand_user(&d))
        .ok_or_else(|| ConfigError::missing("global.jobs_dir"))?;
    let locks_dir = global
        .locks_dir
        .map(|d| expand_user(&d))
        .unwrap_or_else(std::env::temp_dir);
    let hosts_cfg = global.hosts_cfg.map(|p| expand_user(&p));

    let raw_logging = raw.logging.unwrap_or_default();
    let logging = LoggingPolicy {
        level: match raw_logging.log_level {
            Some(level) => check_log_level(&level, "logging.log_level")?,
            None => "info".to_string(),
        },
        log_dir: raw_logging.log_dir.map(|d| expand_user(&d)),
        use_subdirs: raw_logging.use_subdirs.unwrap_or(true),
    };

    let raw_sftp = raw.sftp.unwrap_or_default();
    let mut keys = BTreeMap::new();
    for (name, file, pass) in [
        ("rsa", raw_sftp.key_rsa_file, raw_sftp.key_rsa_pass),
        ("dsa", raw_sftp.key_dsa_file, raw_sftp.key_dsa_pass),
        ("ecdsa", raw_sftp.key_ecdsa_file, raw_sftp.key_ecdsa_pass),
        ("ed25519", raw_sftp.key_ed25519_file, raw_sftp.key_ed25519_pass),
    ] {
        if let Some(file) = file {
            keys.insert(name.to_string(), (expand_user(&file), pass));
        }
    }
    let sftp = SftpDefaults {
        known_hosts: raw_sftp.known_hosts.map(|p| expand_user(&p)),
        keys,
    };

    let mut mail = BTreeMap::new();
    for (name, raw_mail) in raw.mail {
        let cfg = validate_mail(&name, raw_mail)?;
        mail.insert(name, cfg);
    }

    tracing::debug!(
        "app config: jobs_dir={} locks_dir={} hosts_cfg={:?}",
        jobs_dir.display(),
        locks_dir.display(),
        hosts_cfg
    );

    Ok(AppConfig {
        path: path.to_path_buf(),
        jobs_dir,
        locks_dir,
        hosts_cfg,
        logging,
        sftp,
        mail,
    })
}

fn validate_mail(name: &str, raw: RawMail) -> Result<MailConfig, ConfigError> {
    let key = |k: &str| format!("mail.{}.{}", name, k);
    let from = raw.from.ok_or_else(|| ConfigError::missing(key("from")))?;
    let to = raw.to.map(|t| t.into_vec(',')).unwrap_or_default();
    if to.is_empty() {
        return Err(ConfigError::missing(key("to")));
    }
    let host = raw.host.ok_or_else(|| ConfigError::missing(key("host")))?;
    let port = match raw.port {
        Some(p) => check_port(p, &key("port"))?,
        None => SMTP_PORT,
    };
    let template = match raw.template {
        Some(path) => {
            let path = expand_user(&path);
            Some(fs::read_to_string(&path).map_err(|e| ConfigError::Read { path, source: e })?)
        }
        None => None,
    };
    Ok(MailConfig {
        name: name.to_string(),
        from,
        to,
        host,
        port,
        subject: raw.subject,
        template,
    })
}

/// Load every host definition from a hosts file.
pub fn load_hosts(
    path: &Path,
    sftp: &SftpDefaults,
) -> Result<BTreeMap<String, Arc<HostConfig>>, ConfigError> {
    let raw: BTreeMap<String, RawHost> = read_yaml(path)?;
    let mut hosts = BTreeMap::new();
    for (id, raw_host) in raw {
        let host = validate_host(&id, raw_host, sftp)?;
        hosts.insert(id, Arc::new(host));
    }
    Ok(hosts)
}

fn validate_host(id: &str, raw: RawHost, sftp: &SftpDefaults) -> Result<HostConfig, ConfigError> {
    let key = |k: &str| format!("{}.{}", id, k);
    let protocol = match raw.protocol.as_deref().map(str::to_lowercase).as_deref() {
        Some("local") => Protocol::Local,
        Some("ftp") => Protocol::Ftp,
        Some("ftps") => Protocol::Ftps,
        Some("sftp") => Protocol::Sftp,
        Some(other) => {
            return Err(ConfigError::invalid(
                key("protocol"),
                format!("unknown protocol '{}'", other),
            ))
        }
        None => return Err(ConfigError::missing(key("protocol"))),
    };

    let (hostname, mut port) = match raw.host {
        Some(h) => split_host_port(&h, protocol.default_port(), &key("host"))?,
        None if protocol == Protocol::Local => (String::new(), 0),
        None => return Err(ConfigError::missing(key("host"))),
    };
    if let Some(p) = raw.port {
        port = check_port(p, &key("port"))?;
    }

    let auth = match raw.key_type {
        Some(kt) => {
            if protocol != Protocol::Sftp {
                return Err(ConfigError::invalid(
                    key("key_type"),
                    "key authentication requires SFTP",
                ));
            }
            let key_type = KeyType::parse(&kt).ok_or_else(|| {
                ConfigError::invalid(key("key_type"), format!("unknown key type: {}", kt))
            })?;
            let (key_file, passphrase) = match raw.key_file {
                Some(file) => (expand_user(&file), raw.key_pass),
                None => {
                    let app_key = format!("sftp.key_{}_file", key_type.name());
                    sftp.keys
                        .get(key_type.name())
                        .cloned()
                        .ok_or_else(|| ConfigError::missing(app_key))?
                }
            };
            Auth::PrivateKey {
                key_type,
                key_file,
                passphrase,
            }
        }
        None => Auth::Password(raw.password.unwrap_or_default()),
    };

    let known_hosts = if protocol == Protocol::Sftp {
        match raw.known_hosts {
            Some(v) if v.eq_ignore_ascii_case("none") => KnownHosts::AcceptAny,
            Some(v) => KnownHosts::File(expand_user(&v)),
            None => match &sftp.known_hosts {
                Some(p) => KnownHosts::File(p.clone()),
                None => return Err(ConfigError::missing(key("known_hosts"))),
            },
        }
    } else {
        KnownHosts::AcceptAny
    };

    let timeout = match raw.timeout_secs {
        Some(t) if t < 0.0 || !t.is_finite() => {
            return Err(ConfigError::invalid(key("timeout_secs"), "must be positive"))
        }
        Some(t) if t > 0.0 => Some(
            Duration::try_from_secs_f64(t)
                .map_err(|e| ConfigError::invalid(key("timeout_secs"), e.to_string()))?,
        ),
        _ => None,
    };

    Ok(HostConfig {
        id: id.to_string(),
        protocol,
        hostname,
        port,
        user: raw.user.unwrap_or_default(),
        auth,
        passive_mode: raw.passive_mode.unwrap_or(true),
        timeout,
        known_hosts,
    })
}

fn parse_post(raw: &RawSource) -> Result<PostProcess, ConfigError> {
    match raw.post.as_deref() {
        None => Ok(if raw.delete.unwrap_or(false) {
            PostProcess::Delete
        } else {
            PostProcess::Keep
        }),
        Some("keep") => Ok(PostProcess::Keep),
        Some("delete") => Ok(PostProcess::Delete),
        Some(other) => match other.split_once(':') {
            Some(("move", dir)) if !dir.trim().is_empty() => {
                Ok(PostProcess::MoveTo(dir.trim().to_string()))
            }
            _ => Err(ConfigError::invalid("source.post", other)),
        },
    }
}

fn parse_temp(value: Option<&str>) -> Result<TempStrategy, ConfigError> {
    let value = match value.map(str::trim) {
        None | Some("") => return Ok(TempStrategy::Direct),
        Some(v) => v,
    };
    let mut parts = value.splitn(2, ':');
    let kind = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
    match (kind, arg) {
        ("dot", None) => Ok(TempStrategy::Dot),
        ("ext", Some(suffix)) => Ok(TempStrategy::Ext(suffix.to_string())),
        ("dir", Some(dir)) => Ok(TempStrategy::Dir(dir.to_string())),
        _ => Err(ConfigError::invalid("target.temp", value)),
    }
}

/// Reject job ids that are not a plain file name.
pub fn check_job_id(job_id: &str) -> Result<(), ConfigError> {
    if job_id.is_empty()
        || job_id.starts_with('.')
        || job_id.contains(['/', '\\', '\0'])
    {
        return Err(ConfigError::invalid("job_id", format!("'{}'", job_id)));
    }
    Ok(())
}

/// Load the job `job_id` from `<jobs_dir>/<job_id>.yaml` and resolve its hosts.
pub fn load_job(app: &AppConfig, job_id: &str) -> Result<JobConfig, ConfigError> {
    check_job_id(job_id)?;
    let job_file = app.jobs_dir.join(format!("{}.yaml", job_id));
    let raw: RawJob = read_yaml(&job_file)?;
    tracing::debug!("job config: {}", job_file.display());

    let needs_hosts = raw.source.as_ref().is_some_and(|s| s.host_id.is_some())
        || raw.target.as_ref().is_some_and(|t| t.host_id.is_some());
    let hosts = if needs_hosts {
        let path = app
            .hosts_cfg
            .as_ref()
            .ok_or_else(|| ConfigError::missing("global.hosts_cfg"))?;
        load_hosts(path, &app.sftp)?
    } else {
        BTreeMap::new()
    };

    validate_job(app, job_id, raw, &hosts)
}

fn resolve_host(
    hosts: &BTreeMap<String, Arc<HostConfig>>,
    section: &str,
    host_id: Option<String>,
) -> Result<Option<Arc<HostConfig>>, ConfigError> {
    match host_id {
        None => Ok(None),
        Some(id) => match hosts.get(&id) {
            Some(h) if h.protocol == Protocol::Local => Ok(None),
            Some(h) => Ok(Some(Arc::clone(h))),
            None => Err(ConfigError::UnknownHost {
                section: section.to_string(),
                host_id: id,
            }),
        },
    }
}

fn validate_job(
    app: &AppConfig,
    job_id: &str,
    raw: RawJob,
    hosts: &BTreeMap<String, Arc<HostConfig>>,
) -> Result<JobConfig, ConfigError> {
    let section = raw.job.unwrap_or_default();
    let raw_source = raw.source.ok_or_else(|| ConfigError::missing("source"))?;
    let raw_target = raw.target.ok_or_else(|| ConfigError::missing("target"))?;

    let post = parse_post(&raw_source)?;
    if let PostProcess::MoveTo(dir) = &post {
        if dir.starts_with('/') || dir.split('/').any(|c| c == "..") {
            return Err(ConfigError::invalid(
                "source.post",
                "move directory must be relative to the source path",
            ));
        }
    }
    let files = raw_source
        .files
        .map(|f| f.into_vec(','))
        .unwrap_or_default();
    if files.is_empty() {
        return Err(ConfigError::missing("source.files"));
    }
    let ignore = match raw_source.ignore {
        Some(i) => i.into_vec(','),
        None => vec![".*".to_string()],
    };
    FileFilter::new(&files, &ignore)?;
    let source = SourceConfig {
        host: resolve_host(hosts, "source", raw_source.host_id)?,
        path: raw_source
            .path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigError::missing("source.path"))?,
        files,
        ignore,
        recursive: raw_source.recursive.unwrap_or(false),
        use_subdirs: raw_source.use_subdirs.unwrap_or(true),
        post,
        transform: raw_source.transform,
    };

    let target = TargetConfig {
        host: resolve_host(hosts, "target", raw_target.host_id)?,
        path: raw_target
            .path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| ConfigError::missing("target.path"))?,
        temp: parse_temp(raw_target.temp.as_deref())?,
    };

    let retry = match raw.retry {
        None => RetryPolicy::default(),
        Some(r) => {
            let max_attempts = r.max_attempts.unwrap_or(1);
            if max_attempts == 0 {
                return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
            }
            let delay = r.delay_secs.unwrap_or(0.0);
            if delay < 0.0 || !delay.is_finite() {
                return Err(ConfigError::invalid("retry.delay_secs", "must not be negative"));
            }
            RetryPolicy {
                max_attempts,
                delay: Duration::try_from_secs_f64(delay)
                    .map_err(|e| ConfigError::invalid("retry.delay_secs", e.to_string()))?,
            }
        }
    };

    let verify = match raw.verify {
        Some(name) => Some(ChecksumAlgorithm::from_name(&name).ok_or_else(|| {
            ConfigError::invalid("verify", format!("unknown checksum algorithm '{}'", name))
        })?),
        None => None,
    };

    let notify = match raw.notify {
        None => NotifyPolicy {
            on: default_notify_statuses(),
            mail: app.mail.get("default").cloned(),
        },
        Some(n) => {
            let on = match n.on {
                Some(names) => names
                    .iter()
                    .map(|s| s.parse::<Status>().map_err(|e| ConfigError::invalid("notify.on", e)))
                    .collect::<Result<Vec<_>, _>>()?,
                None => default_notify_statuses(),
            };
            let mail = match n.mail {
                Some(name) => Some(app.mail.get(&name).cloned().ok_or_else(|| {
                    ConfigError::invalid("notify.mail", format!("unknown mail config '{}'", name))
                })?),
                None => app.mail.get("default").cloned(),
            };
            NotifyPolicy { on, mail }
        }
    };

    let logging = LoggingPolicy {
        level: match section.log_level {
            Some(level) => check_log_level(&level, "job.log_level")?,
            None => app.logging.level.clone(),
        },
        ..app.logging.clone()
    };

    Ok(JobConfig {
        job_id: job_id.to_string(),
        name: section.name.unwrap_or_else(|| job_id.to_string()),
        info: section.info,
        source,
        target,
        retry,
        lock: LockPolicy {
            single_instance: section.single_instance.unwrap_or(true),
            per_host: section.lock_per_host.unwrap_or(false),
            dir: app.locks_dir.clone(),
        },
        ready: ReadyPolicy {
            marker: section.ready_marker.filter(|m| !m.trim().is_empty()),
        },
        notify,
        logging,
        verify,
        collect_data: section.collect_data.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).expect("Failed to write config file");
        path
    }

    fn app_fixture(dir: &Path) -> PathBuf {
        let jobs = dir.join("jobs");
        fs::create_dir_all(&jobs).expect("Failed to create jobs dir");
        write(
            dir,
            "hosts.yaml",
            "remote:\n  protocol: sftp\n  host: files.example.com:2222\n  user: batch\n  key_type: ed25519\n  known_hosts: none\nftp1:\n  type: FTP\n  host: ftp.example.com\n  user: anon\n  password: pw\n",
        );
        write(
            dir,
            "app.yaml",
            &format!(
                "global:\n  jobs_dir: {}\n  locks_dir: {}\n  hosts_cfg: {}\nsftp:\n  key_ed25519_file: /keys/id_ed25519\nmail:\n  default:\n    from: ft@example.com\n    to: ops@example.com, dev@example.com\n    host: TEST\n",
                jobs.display(),
                dir.join("locks").display(),
                dir.join("hosts.yaml").display()
            ),
        )
    }

    #[test]
    fn test_config_path_prefers_explicit() {
        let path = config_path(Some(Path::new("/etc/ft.yaml"))).expect("Failed to resolve");
        assert_eq!(path, PathBuf::from("/etc/ft.yaml"));
    }

    #[test]
    fn test_load_app_config() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let app = load_app_config(&app_fixture(temp_dir.path())).expect("Failed to load");
        assert_eq!(app.logging.level, "info");
        let mail = app.mail.get("default").expect("Missing mail config");
        assert_eq!(mail.to, vec!["ops@example.com", "dev@example.com"]);
        assert_eq!(mail.port, SMTP_PORT);
    }

    #[test]
    fn test_app_config_requires_jobs_dir() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = write(temp_dir.path(), "app.yaml", "global:\n  locks_dir: /tmp\n");
        let err = load_app_config(&path).unwrap_err();
        assert_eq!(err.to_string(), "\"global.jobs_dir\" is required");
    }

    #[test]
    fn test_load_job_resolves_hosts_and_key_defaults() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let app = load_app_config(&app_fixture(temp_dir.path())).expect("Failed to load");
        write(
            &app.jobs_dir,
            "j1.yaml",
            "job:\n  name: Nightly\n  ready_marker: READY\nsource:\n  host_id: remote\n  path: /out\n  files: [\"*.csv\", \"*.txt\"]\n  post: \"move:done\"\ntarget:\n  path: /in\n  temp: \"ext:.part\"\nretry:\n  max_attempts: 3\n  delay_secs: 0.5\nverify: sha256\nnotify:\n  on: [ERROR, OTHER]\n",
        );
        let job = load_job(&app, "j1").expect("Failed to load job");
        let host = job.source.host.as_ref().expect("Missing source host");
        assert_eq!(host.port, 2222);
        assert_eq!(
            host.auth,
            Auth::PrivateKey {
                key_type: KeyType::Ed25519,
                key_file: PathBuf::from("/keys/id_ed25519"),
                passphrase: None,
            }
        );
        assert!(job.target.host.is_none());
        assert_eq!(job.source.files, vec!["*.csv", "*.txt"]);
        assert_eq!(job.source.ignore, vec![".*"]);
        assert_eq!(job.source.post, PostProcess::MoveTo("done".to_string()));
        assert_eq!(job.target.temp, TempStrategy::Ext(".part".to_string()));
        assert_eq!(job.retry.max_attempts, 3);
        assert_eq!(job.retry.delay, Duration::from_millis(500));
        assert_eq!(job.verify, Some(ChecksumAlgorithm::Sha256));
        assert_eq!(job.ready.marker.as_deref(), Some("READY"));
        assert_eq!(job.notify.on, vec![Status::Error, Status::Other]);
        assert!(job.notify.mail.is_some());
    }

    #[test]
    fn test_load_job_rejects_unknown_host() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let app = load_app_config(&app_fixture(temp_dir.path())).expect("Failed to load");
        write(
            &app.jobs_dir,
            "j2.yaml",
            "source:\n  host_id: nowhere\n  path: /out\n  files: '*'\ntarget:\n  path: /in\n",
        );
        let err = load_job(&app, "j2").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHost { .. }));
    }

    #[test]
    fn test_load_job_rejects_zero_attempts_and_bad_temp() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let app = load_app_config(&app_fixture(temp_dir.path())).expect("Failed to load");
        write(
            &app.jobs_dir,
            "j3.yaml",
            "source:\n  path: /out\n  files: '*'\ntarget:\n  path: /in\nretry:\n  max_attempts: 0\n",
        );
        write(
            &app.jobs_dir,
            "j4.yaml",
            "source:\n  path: /out\n  files: '*'\ntarget:\n  path: /in\n  temp: 'dot:x'\n",
        );
        assert!(load_job(&app, "j3").is_err());
        assert!(load_job(&app, "j4").is_err());
    }

    #[test]
    fn test_oversized_durations_are_config_errors() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let app = load_app_config(&app_fixture(temp_dir.path())).expect("Failed to load");
        write(
            &app.jobs_dir,
            "j5.yaml",
            "source:\n  path: /out\n  files: '*'\ntarget:\n  path: /in\nretry:\n  max_attempts: 2\n  delay_secs: 1.0e30\n",
        );
        let err = load_job(&app, "j5").expect_err("huge delay must be rejected");
        assert!(err.to_string().contains("retry.delay_secs"));

        let raw = RawHost {
            protocol: Some("ftps".to_string()),
            host: Some("ftp.example.com".to_string()),
            port: None,
            user: None,
            password: None,
            key_type: None,
            key_file: None,
            key_pass: None,
            passive_mode: None,
            timeout_secs: Some(1.0e30),
            known_hosts: None,
        };
        let err = validate_host("ftp2", raw, &SftpDefaults::default())
            .expect_err("huge timeout must be rejected");
        assert!(err.to_string().contains("ftp2.timeout_secs"));
    }

    #[test]
    fn test_ftps_host_defaults() {
        let raw = RawHost {
            protocol: Some("FTPS".to_string()),
            host: Some("ftp.example.com".to_string()),
            port: None,
            user: Some("batch".to_string()),
            password: Some("pw".to_string()),
            key_type: None,
            key_file: None,
            key_pass: None,
            passive_mode: Some(false),
            timeout_secs: Some(30.0),
            known_hosts: None,
        };
        let host = validate_host("ftp3", raw, &SftpDefaults::default()).expect("Failed to validate");
        assert_eq!(host.protocol, Protocol::Ftps);
        assert_eq!(host.port, crate::config::FTP_PORT);
        assert!(!host.passive_mode);
        assert_eq!(host.timeout, Some(Duration::from_secs(30)));
        assert_eq!(host.url("/in"), "ftps://batch@ftp.example.com:21/in");
    }

    #[test]
    fn test_load_job_rejects_path_like_id() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let app = load_app_config(&app_fixture(temp_dir.path())).expect("Failed to load");
        assert!(load_job(&app, "../etc/passwd").is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com", 21, "h").expect("Failed to split"),
            ("example.com".to_string(), 21)
        );
        assert_eq!(
            split_host_port("example.com:2121", 21, "h").expect("Failed to split"),
            ("example.com".to_string(), 2121)
        );
        assert!(split_host_port("example.com:0", 21, "h").is_err());
        assert!(split_host_port("example.com:abc", 21, "h").is_err());
    }

    #[test]
    fn test_ftp_host_rejects_key_auth() {
        let raw = RawHost {
            protocol: Some("ftp".to_string()),
            host: Some("ftp.example.com".to_string()),
            port: None,
            user: None,
            password: None,
            key_type: Some("rsa".to_string()),
            key_file: Some("/k".to_string()),
            key_pass: None,
            passive_mode: None,
            timeout_secs: None,
            known_hosts: None,
        };
        assert!(validate_host("ftp1", raw, &SftpDefaults::default()).is_err());
    }
}
