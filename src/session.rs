/*!
 * SSH session establishment and the SFTP channel pool
 *
 * ssh2 does blocking I/O; every SFTP operation inherits the session-level
 * timeout, so a stuck server surfaces as a per-operation error rather than
 * a hang. Channels are multiplexed over one session where the server
 * allows it, with dedicated fallback sessions otherwise.
 */

use crate::config::TransferConfig;
use crate::endpoint::Endpoint;
use crate::error::{FerryError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use secrecy::{ExposeSecret, SecretString};
use ssh2::{Session, Sftp};
use std::io::Read;
use std::net::TcpStream;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// SSH authentication method
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// SSH agent (honors SSH_AUTH_SOCK)
    Agent,

    /// Public key authentication with a private key file
    KeyFile {
        key_path: PathBuf,
        passphrase: Option<SecretString>,
    },

    /// Password authentication
    Password(SecretString),
}

/// Connection parameters for one remote endpoint
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub timeout: Duration,
    pub compress: bool,
}

impl SessionSettings {
    pub fn from_endpoint(endpoint: &Endpoint, config: &TransferConfig) -> Result<Self> {
        let host = endpoint
            .host
            .clone()
            .ok_or_else(|| FerryError::Parse("remote endpoint without host".into()))?;

        let auth = match &endpoint.key_file {
            Some(path) => SshAuth::KeyFile {
                key_path: path.clone(),
                passphrase: None,
            },
            None => SshAuth::Agent,
        };

        Ok(Self {
            host,
            port: endpoint.port,
            username: endpoint.user.clone().unwrap_or_else(|| "root".to_string()),
            auth,
            timeout: config.timeout_duration(),
            compress: config.compress,
        })
    }
}

/// One established SSH session
pub struct SshSession {
    session: Session,
}

impl SshSession {
    /// Connect and authenticate. Distinguishes connection failures
    /// (recoverable at the session level) from authentication failures
    /// (terminal).
    pub fn connect(settings: &SessionSettings) -> Result<Self> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| FerryError::Connect(format!("{}: {}", addr, e)))?;
        tcp.set_read_timeout(Some(settings.timeout)).ok();
        tcp.set_write_timeout(Some(settings.timeout)).ok();

        let mut session = Session::new()
            .map_err(|e| FerryError::Connect(format!("failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(settings.timeout.as_millis() as u32);
        session.set_compress(settings.compress);

        session
            .handshake()
            .map_err(|e| FerryError::Connect(format!("{}: handshake failed: {}", addr, e)))?;

        Self::authenticate(&session, settings)?;

        if !session.authenticated() {
            return Err(FerryError::Auth(format!(
                "{}@{}: authentication did not complete",
                settings.username, settings.host
            )));
        }

        debug!(host = %settings.host, port = settings.port, "SSH session established");
        Ok(Self { session })
    }

    fn authenticate(session: &Session, settings: &SessionSettings) -> Result<()> {
        match &settings.auth {
            SshAuth::Password(password) => session
                .userauth_password(&settings.username, password.expose_secret())
                .map_err(|e| FerryError::Auth(format!("password auth failed: {}", e))),

            SshAuth::KeyFile {
                key_path,
                passphrase,
            } => {
                let pass: Option<&str> = passphrase.as_ref().map(|p| p.expose_secret().as_str());
                session
                    .userauth_pubkey_file(&settings.username, None, key_path, pass)
                    .map_err(|e| {
                        FerryError::Auth(format!(
                            "key file {} rejected: {}",
                            key_path.display(),
                            e
                        ))
                    })
            }

            SshAuth::Agent => {
                let mut agent = session
                    .agent()
                    .map_err(|e| FerryError::Auth(format!("cannot reach SSH agent: {}", e)))?;
                agent
                    .connect()
                    .map_err(|e| FerryError::Auth(format!("cannot reach SSH agent: {}", e)))?;
                agent
                    .list_identities()
                    .map_err(|e| FerryError::Auth(format!("agent listing failed: {}", e)))?;

                let identities = agent
                    .identities()
                    .map_err(|e| FerryError::Auth(format!("agent listing failed: {}", e)))?;

                for identity in identities {
                    if agent.userauth(&settings.username, &identity).is_ok() {
                        return Ok(());
                    }
                }

                Err(FerryError::Auth(format!(
                    "no agent identity accepted for {}",
                    settings.username
                )))
            }
        }
    }

    /// Open one SFTP channel on this session
    pub fn sftp(&self) -> Result<Sftp> {
        self.session
            .sftp()
            .map_err(|e| FerryError::Connect(format!("failed to open SFTP channel: {}", e)))
    }

    /// Run a command and capture stdout
    pub fn exec(&self, command: &str) -> Result<String> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        channel.wait_close().ok();
        Ok(output)
    }

    /// The remote home directory, from `$HOME` with an SFTP realpath
    /// fallback.
    pub fn home_dir(&self, sftp: &Sftp) -> Result<String> {
        if let Ok(output) = self.exec("printf %s \"$HOME\"") {
            let home = output.trim();
            if !home.is_empty() {
                return Ok(home.to_string());
            }
        }
        let real = sftp.realpath(Path::new("."))?;
        Ok(real.to_string_lossy().into_owned())
    }

    /// Expand `~` and resolve relative paths against the remote home.
    pub fn resolve_path(&self, sftp: &Sftp, path: &str) -> Result<String> {
        if path == "~" {
            return self.home_dir(sftp);
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return Ok(format!("{}/{}", self.home_dir(sftp)?, rest));
        }
        if !path.starts_with('/') {
            return Ok(format!("{}/{}", self.home_dir(sftp)?, path));
        }
        Ok(path.to_string())
    }

    pub fn disconnect(&self) {
        let _ = self
            .session
            .disconnect(None, "closing connection", None);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Metadata for a remote file
#[derive(Debug, Clone, Copy)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: f64,
    pub mode: Option<u32>,
    pub is_dir: bool,
}

/// Stat a remote path, mapping "no such file" to `None`
pub fn stat_opt(sftp: &Sftp, path: &Path) -> Result<Option<RemoteStat>> {
    match sftp.stat(path) {
        Ok(stat) => Ok(Some(RemoteStat {
            size: stat.size.unwrap_or(0),
            mtime: stat.mtime.unwrap_or(0) as f64,
            mode: stat.perm.map(|p| p & 0o7777),
            is_dir: stat.is_dir(),
        })),
        Err(_) => Ok(None),
    }
}

/// Create a remote directory chain, ignoring components that already exist
pub fn ensure_dir(sftp: &Sftp, dir: &Path) -> Result<()> {
    if sftp.stat(dir).is_ok() {
        return Ok(());
    }
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if current.as_os_str().is_empty() || current == Path::new("/") {
            continue;
        }
        if sftp.stat(&current).is_err() {
            sftp.mkdir(&current, 0o755).ok();
        }
    }
    // The final component has to exist even if intermediate mkdirs raced
    sftp.stat(dir)
        .map(|_| ())
        .map_err(|e| FerryError::Connect(format!("cannot create {}: {}", dir.display(), e)))
}

/// Fixed-size pool of SFTP channels with exclusive checkout.
///
/// Channels are multiplexed over the primary session when the server
/// cooperates; otherwise each remaining slot gets its own SSH connection.
/// A checked-out channel belongs to exactly one worker until returned.
pub struct SftpPool {
    slots: Receiver<Sftp>,
    returns: Sender<Sftp>,
    size: usize,
    /// Dedicated fallback sessions; dropping one disconnects, so they must
    /// live as long as the channels multiplexed over them
    _extra_sessions: Vec<SshSession>,
}

impl SftpPool {
    pub fn open(primary: &SshSession, settings: &SessionSettings, count: usize) -> Result<Self> {
        let count = count.max(1);
        let (returns, slots) = bounded(count);

        let mut opened = 0;
        while opened < count {
            match primary.session.sftp() {
                Ok(sftp) => {
                    returns.send(sftp).expect("pool channel closed during fill");
                    opened += 1;
                }
                Err(e) => {
                    debug!(
                        opened,
                        error = %e,
                        "server refused another SFTP channel, falling back to dedicated sessions"
                    );
                    break;
                }
            }
        }

        // One SSH connection per remaining channel
        let mut extra_sessions = Vec::new();
        while opened < count {
            let extra = SshSession::connect(settings)?;
            let sftp = extra.sftp()?;
            returns.send(sftp).expect("pool channel closed during fill");
            extra_sessions.push(extra);
            opened += 1;
        }

        Ok(Self {
            slots,
            returns,
            size: count,
            _extra_sessions: extra_sessions,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Blocks until a channel is free
    pub fn checkout(&self) -> PooledSftp {
        let sftp = self
            .slots
            .recv()
            .expect("SFTP pool disconnected while checking out");
        PooledSftp {
            sftp: Some(sftp),
            returns: self.returns.clone(),
        }
    }
}

/// Guard for a checked-out channel; returns it to the pool on drop
pub struct PooledSftp {
    sftp: Option<Sftp>,
    returns: Sender<Sftp>,
}

impl Deref for PooledSftp {
    type Target = Sftp;

    fn deref(&self) -> &Sftp {
        self.sftp.as_ref().expect("channel already returned")
    }
}

impl Drop for PooledSftp {
    fn drop(&mut self) {
        if let Some(sftp) = self.sftp.take() {
            // Receiver gone means the pool is shutting down; the channel
            // closes with the session
            let _ = self.returns.send(sftp);
        }
    }
}
