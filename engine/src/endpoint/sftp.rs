//! SFTP session on top of `ssh2`, plus host-key maintenance helpers.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ssh2::{
    CheckResult, ErrorCode, FileStat, HashType, HostKeyType, KnownHostFileKind, KnownHostKeyFormat,
    Sftp,
};

use super::{DirEntry, Session};
use crate::config::{Auth, HostConfig, KnownHosts, SSH_PORT};
use crate::error::ConnectError;

// libssh2 error codes that mean the transport is gone
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;

fn io_error(err: ssh2::Error) -> io::Error {
    match err.code() {
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_RECV,
        ) => io::Error::new(io::ErrorKind::ConnectionAborted, err),
        _ => io::Error::from(err),
    }
}

/// Name of a host in a known-hosts file.
pub fn known_hosts_name(hostname: &str, port: u16) -> String {
    if port == SSH_PORT {
        hostname.to_string()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

fn open_tcp(hostname: &str, port: u16, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let addr = (hostname, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host name did not resolve"))?;
    match timeout {
        Some(t) => TcpStream::connect_timeout(&addr, t),
        None => TcpStream::connect(addr),
    }
}

fn handshake(hostname: &str, port: u16, timeout: Option<Duration>) -> io::Result<ssh2::Session> {
    let tcp = open_tcp(hostname, port, timeout)?;
    let mut session = ssh2::Session::new().map_err(io_error)?;
    if let Some(t) = timeout {
        session.set_timeout(u32::try_from(t.as_millis()).unwrap_or(u32::MAX));
    }
    session.set_tcp_stream(tcp);
    session.handshake().map_err(io_error)?;
    Ok(session)
}

/// SFTP session for one host.
pub struct SftpSession {
    host: Arc<HostConfig>,
    session: Option<ssh2::Session>,
    sftp: Option<Sftp>,
}

impl SftpSession {
    pub fn new(host: Arc<HostConfig>) -> Self {
        SftpSession {
            host,
            session: None,
            sftp: None,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host.hostname, self.host.port)
    }

    fn sftp(&self) -> io::Result<&Sftp> {
        self.sftp
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "sftp session not connected"))
    }

    fn check_host_key(&self, session: &ssh2::Session) -> Result<(), ConnectError> {
        let file = match &self.host.known_hosts {
            KnownHosts::AcceptAny => return Ok(()),
            KnownHosts::File(file) => file,
        };
        let (key, _) = session
            .host_key()
            .ok_or_else(|| ConnectError::new(self.endpoint(), "server sent no host key"))?;
        let mut known = session
            .known_hosts()
            .map_err(|e| ConnectError::with_source(self.endpoint(), io_error(e)))?;
        known
            .read_file(file, KnownHostFileKind::OpenSSH)
            .map_err(|e| ConnectError::with_source(self.endpoint(), io_error(e)))?;
        match known.check_port(&self.host.hostname, self.host.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(ConnectError::new(
                self.endpoint(),
                format!("host key not found in {}", file.display()),
            )),
            CheckResult::Mismatch => Err(ConnectError::new(
                self.endpoint(),
                format!("host key does not match {}", file.display()),
            )),
            CheckResult::Failure => Err(ConnectError::new(self.endpoint(), "host key check failed")),
        }
    }

    fn authenticate(&self, session: &ssh2::Session) -> Result<(), ConnectError> {
        let user = &self.host.user;
        let result = match &self.host.auth {
            Auth::Password(password) => session.userauth_password(user, password),
            Auth::PrivateKey {
                key_file,
                passphrase,
                ..
            } => session.userauth_pubkey_file(user, None, key_file, passphrase.as_deref()),
        };
        result.map_err(|e| ConnectError::with_source(self.endpoint(), io_error(e)))?;
        if !session.authenticated() {
            return Err(ConnectError::new(self.endpoint(), "authentication failed"));
        }
        Ok(())
    }
}

impl Session for SftpSession {
    fn connect(&mut self) -> Result<(), ConnectError> {
        let session = handshake(&self.host.hostname, self.host.port, self.host.timeout)
            .map_err(|e| ConnectError::with_source(self.endpoint(), e))?;
        self.check_host_key(&session)?;
        self.authenticate(&session)?;
        let sftp = session
            .sftp()
            .map_err(|e| ConnectError::with_source(self.endpoint(), io_error(e)))?;
        tracing::info!("connected to {}", self.host.url(""));
        self.sftp = Some(sftp);
        self.session = Some(session);
        Ok(())
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn read_dir(&mut self, dir: &str) -> io::Result<Vec<DirEntry>> {
        let entries = self.sftp()?.readdir(Path::new(dir)).map_err(io_error)?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    return None;
                }
                Some(DirEntry {
                    name,
                    is_dir: stat.is_dir(),
                    size: stat.size,
                    modified: stat.mtime.map(|t| UNIX_EPOCH + Duration::from_secs(t)),
                })
            })
            .collect())
    }

    fn read(&mut self, path: &str) -> io::Result<Vec<u8>> {
        let mut file = self.sftp()?.open(Path::new(path)).map_err(io_error)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut file = self.sftp()?.create(Path::new(path)).map_err(io_error)?;
        file.write_all(data)?;
        file.flush()
    }

    fn exists(&mut self, path: &str) -> io::Result<bool> {
        match self.sftp()?.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => Ok(false),
            Err(e) => Err(io_error(e)),
        }
    }

    fn mkdir_all(&mut self, dir: &str) -> io::Result<()> {
        let sftp = self.sftp()?;
        let mut acc = if dir.starts_with('/') { String::from("/") } else { String::new() };
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if !acc.is_empty() && !acc.ends_with('/') {
                acc.push('/');
            }
            acc.push_str(part);
            match sftp.stat(Path::new(&acc)) {
                Ok(stat) if stat.is_dir() => {}
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} exists but is not a directory", acc),
                    ))
                }
                Err(_) => sftp.mkdir(Path::new(&acc), 0o755).map_err(io_error)?,
            }
        }
        Ok(())
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        self.sftp()?.unlink(Path::new(path)).map_err(io_error)
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        self.sftp()?
            .rename(Path::new(from), Path::new(to), None)
            .map_err(io_error)
    }

    fn set_modified(&mut self, path: &str, time: SystemTime) -> io::Result<()> {
        let secs = time
            .duration_since(UNIX_EPOCH)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
            .as_secs();
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(secs),
            mtime: Some(secs),
        };
        self.sftp()?.setstat(Path::new(path), stat).map_err(io_error)
    }

    fn close(&mut self) {
        self.sftp = None;
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "closing", None) {
                tracing::debug!("disconnect from {}: {}", self.endpoint(), e);
            }
        }
    }
}

/// A server host key as presented during the handshake.
pub struct HostKey {
    pub hostname: String,
    pub port: u16,
    pub key_type: HostKeyType,
    pub key: Vec<u8>,
    /// `aa:bb:...` MD5 fingerprint
    pub md5: String,
    /// Hex SHA256 fingerprint
    pub sha256: String,
}

impl HostKey {
    pub fn type_name(&self) -> &'static str {
        match self.key_type {
            HostKeyType::Rsa => "ssh-rsa",
            HostKeyType::Dss => "ssh-dss",
            HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
            HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
            HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
            HostKeyType::Ed25519 => "ssh-ed25519",
            HostKeyType::Unknown => "unknown",
        }
    }
}

/// Connect to `hostname:port` and return the server's host key.
pub fn fetch_host_key(
    hostname: &str,
    port: u16,
    timeout: Option<Duration>,
) -> Result<HostKey, ConnectError> {
    let endpoint = format!("{}:{}", hostname, port);
    let session =
        handshake(hostname, port, timeout).map_err(|e| ConnectError::with_source(&endpoint, e))?;
    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| ConnectError::new(&endpoint, "server sent no host key"))?;
    let hex = |bytes: &[u8], sep: &str| {
        bytes
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(sep)
    };
    let md5 = session.host_key_hash(HashType::Md5).map(|h| hex(h, ":"));
    let sha256 = session.host_key_hash(HashType::Sha256).map(|h| hex(h, ""));
    Ok(HostKey {
        hostname: hostname.to_string(),
        port,
        key_type,
        key: key.to_vec(),
        md5: md5.unwrap_or_default(),
        sha256: sha256.unwrap_or_default(),
    })
}

/// Add `key` to an OpenSSH known-hosts file, replacing entries for the same host.
pub fn save_host_key(key: &HostKey, file: &Path) -> io::Result<()> {
    let name = known_hosts_name(&key.hostname, key.port);
    let session = ssh2::Session::new().map_err(io_error)?;
    let mut known = session.known_hosts().map_err(io_error)?;
    if file.exists() {
        known
            .read_file(file, KnownHostFileKind::OpenSSH)
            .map_err(io_error)?;
    }
    for host in known.hosts().map_err(io_error)? {
        if host.name() == Some(name.as_str()) {
            known.remove(&host).map_err(io_error)?;
        }
    }
    known
        .add(&name, &key.key, "", KnownHostKeyFormat::from(key.key_type))
        .map_err(io_error)?;
    known
        .write_file(file, KnownHostFileKind::OpenSSH)
        .map_err(io_error)
}

/// Remove all entries for `hostname:port` from a known-hosts file.
///
/// Returns the number of removed entries.
pub fn delete_host_key(hostname: &str, port: u16, file: &Path) -> io::Result<usize> {
    let name = known_hosts_name(hostname, port);
    let session = ssh2::Session::new().map_err(io_error)?;
    let mut known = session.known_hosts().map_err(io_error)?;
    known
        .read_file(file, KnownHostFileKind::OpenSSH)
        .map_err(io_error)?;
    let mut removed = 0;
    for host in known.hosts().map_err(io_error)? {
        if host.name() == Some(name.as_str()) {
            known.remove(&host).map_err(io_error)?;
            removed += 1;
        }
    }
    if removed > 0 {
        known
            .write_file(file, KnownHostFileKind::OpenSSH)
            .map_err(io_error)?;
    }
    Ok(removed)
}
