//! FTP and FTPS sessions on top of `suppaftp`.
//!
//! FTPS uses explicit TLS (`AUTH TLS`) and protects the data channel as well.

use std::io::{self, Cursor};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use suppaftp::list::File;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode, NativeTlsConnector, NativeTlsFtpStream};

use super::{split, DirEntry, Session};
use crate::config::{Auth, HostConfig};
use crate::error::ConnectError;

/// Control connection, plain or protected.
enum Control {
    Plain(FtpStream),
    Secure(NativeTlsFtpStream),
}

/// Run `$body` with `$s` bound to the stream of either variant.
macro_rules! with_stream {
    ($control:expr, $s:ident => $body:expr) => {
        match $control {
            Control::Plain($s) => $body,
            Control::Secure($s) => $body,
        }
    };
}

fn io_error(err: FtpError) -> io::Error {
    match err {
        FtpError::ConnectionError(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

fn resolve(hostname: &str, port: u16) -> io::Result<SocketAddr> {
    (hostname, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host name did not resolve"))
}

/// FTP or FTPS session for one host.
pub struct FtpSession {
    host: Arc<HostConfig>,
    tls: bool,
    control: Option<Control>,
}

impl FtpSession {
    pub fn new(host: Arc<HostConfig>, tls: bool) -> Self {
        FtpSession {
            host,
            tls,
            control: None,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host.hostname, self.host.port)
    }

    fn control(&mut self) -> io::Result<&mut Control> {
        self.control
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "ftp session not connected"))
    }

    fn open(&self) -> Result<Control, ConnectError> {
        let fail = |e: FtpError| ConnectError::with_source(self.endpoint(), io_error(e));
        let addr = resolve(&self.host.hostname, self.host.port)
            .map_err(|e| ConnectError::with_source(self.endpoint(), e))?;
        if !self.tls {
            let stream = match self.host.timeout {
                Some(t) => FtpStream::connect_timeout(addr, t),
                None => FtpStream::connect(addr),
            };
            return stream.map(Control::Plain).map_err(fail);
        }
        let stream = match self.host.timeout {
            Some(t) => NativeTlsFtpStream::connect_timeout(addr, t),
            None => NativeTlsFtpStream::connect(addr),
        }
        .map_err(fail)?;
        let tls = TlsConnector::new()
            .map_err(|e| ConnectError::new(self.endpoint(), format!("TLS setup failed: {}", e)))?;
        stream
            .into_secure(NativeTlsConnector::from(tls), &self.host.hostname)
            .map(Control::Secure)
            .map_err(fail)
    }

    /// The listing entry for `path`, if its directory lists it.
    fn lookup(&mut self, path: &str) -> io::Result<Option<DirEntry>> {
        let (parent, name) = match split(path) {
            (Some(""), name) => ("/", name),
            (Some(parent), name) => (parent, name),
            (None, name) => (".", name),
        };
        let entries = self.read_dir(parent)?;
        Ok(entries.into_iter().find(|e| e.name == name))
    }
}

fn set_timeouts(control: &Control, timeout: Option<Duration>) -> io::Result<()> {
    with_stream!(control, s => {
        s.get_ref().set_read_timeout(timeout)?;
        s.get_ref().set_write_timeout(timeout)
    })
}

impl Session for FtpSession {
    fn connect(&mut self) -> Result<(), ConnectError> {
        let password = match &self.host.auth {
            Auth::Password(password) => password.clone(),
            Auth::PrivateKey { .. } => {
                return Err(ConnectError::new(
                    self.endpoint(),
                    "key authentication requires SFTP",
                ))
            }
        };
        let mut control = self.open()?;
        set_timeouts(&control, self.host.timeout)
            .map_err(|e| ConnectError::with_source(self.endpoint(), e))?;

        let mode = if self.host.passive_mode {
            Mode::Passive
        } else {
            Mode::Active
        };
        let user = self.host.user.as_str();
        let result = with_stream!(&mut control, s => match s.login(user, password.as_str()) {
            Ok(()) => {
                s.set_mode(mode);
                s.transfer_type(FileType::Binary)
            }
            Err(e) => Err(e),
        });
        result.map_err(|e| ConnectError::with_source(self.endpoint(), io_error(e)))?;

        tracing::info!(
            "connected to {} (passive: {})",
            self.host.url(""),
            self.host.passive_mode
        );
        self.control = Some(control);
        Ok(())
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn read_dir(&mut self, dir: &str) -> io::Result<Vec<DirEntry>> {
        let lines = with_stream!(self.control()?, s => s.list(Some(dir))).map_err(io_error)?;
        let mut entries = Vec::new();
        for line in lines {
            let file = match File::from_str(&line) {
                Ok(file) => file,
                Err(_) => {
                    tracing::debug!("skipping listing line {:?}", line);
                    continue;
                }
            };
            let name = file.name().rsplit('/').next().unwrap_or_default().to_string();
            if name.is_empty() || name == "." || name == ".." {
                continue;
            }
            let is_dir = file.is_directory();
            entries.push(DirEntry {
                name,
                is_dir,
                size: (!is_dir).then(|| file.size() as u64),
                modified: Some(file.modified()),
            });
        }
        Ok(entries)
    }

    fn read(&mut self, path: &str) -> io::Result<Vec<u8>> {
        let buffer: Cursor<Vec<u8>> =
            with_stream!(self.control()?, s => s.retr_as_buffer(path)).map_err(io_error)?;
        Ok(buffer.into_inner())
    }

    fn write(&mut self, path: &str, data: &[u8]) -> io::Result<()> {
        let mut reader = Cursor::new(data);
        with_stream!(self.control()?, s => s.put_file(path, &mut reader)).map_err(io_error)?;
        Ok(())
    }

    fn exists(&mut self, path: &str) -> io::Result<bool> {
        Ok(self.lookup(path)?.is_some())
    }

    fn mkdir_all(&mut self, dir: &str) -> io::Result<()> {
        let mut acc = if dir.starts_with('/') { String::from("/") } else { String::new() };
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if !acc.is_empty() && !acc.ends_with('/') {
                acc.push('/');
            }
            acc.push_str(part);
            let created = with_stream!(self.control()?, s => s.mkdir(acc.as_str()));
            if let Err(e) = created {
                // Usually the directory is already there
                let err = io_error(e);
                if !self.lookup(&acc)?.is_some_and(|e| e.is_dir) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, path: &str) -> io::Result<()> {
        with_stream!(self.control()?, s => s.rm(path)).map_err(io_error)
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        with_stream!(self.control()?, s => s.rename(from, to)).map_err(io_error)
    }

    fn close(&mut self) {
        if let Some(mut control) = self.control.take() {
            if let Err(e) = with_stream!(&mut control, s => s.quit()) {
                tracing::debug!("quit from {}: {}", self.endpoint(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KnownHosts, Protocol};

    fn host(auth: Auth) -> Arc<HostConfig> {
        Arc::new(HostConfig {
            id: "ftp1".to_string(),
            protocol: Protocol::Ftp,
            hostname: "localhost".to_string(),
            port: 21,
            user: "anon".to_string(),
            auth,
            passive_mode: false,
            timeout: Some(Duration::from_secs(1)),
            known_hosts: KnownHosts::AcceptAny,
        })
    }

    #[test]
    fn test_operations_fail_before_connect() {
        let mut session = FtpSession::new(host(Auth::Password("pw".to_string())), false);
        assert!(session.is_remote());
        let err = session.read("/x").expect_err("read must fail when not connected");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        let err = session.exists("/x").expect_err("exists must fail when not connected");
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        session.close();
        session.close();
    }

    #[test]
    fn test_key_auth_is_refused() {
        let auth = Auth::PrivateKey {
            key_type: crate::config::KeyType::Rsa,
            key_file: "/keys/id_rsa".into(),
            passphrase: None,
        };
        let mut session = FtpSession::new(host(auth), true);
        let err = session.connect().expect_err("key auth must be refused");
        assert!(err.to_string().contains("requires SFTP"));
    }

    #[test]
    fn test_connection_errors_keep_their_kind() {
        let err = io_error(FtpError::ConnectionError(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe",
        )));
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
