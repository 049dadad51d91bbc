//! Server identity, connection options and session establishment

use crate::auth::{authenticate, credential_chain, expand_home};
use crate::TransportError;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use socks::Socks5Stream;
use ssh2::{CheckResult, HashType, KnownHostFileKind, Session};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default dial timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 60;

/// A logical server: pool key plus the parameters needed to reach it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Pool key
    pub key: String,
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
    /// Password, tried first when set
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Private key path, may start with `~`
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl ServerIdentity {
    /// Create an identity on the default port with no credentials
    pub fn new(key: impl Into<String>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            password: None,
            identity_file: None,
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the private key path
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("key", &self.key)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// How the server's host key is checked after the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum HostKeyPolicy {
    /// Accept any host key. Insecure; every dial logs a warning.
    #[default]
    AcceptAny,
    /// Require this SHA-256 fingerprint (`SHA256:<base64>`)
    Fingerprint(String),
    /// Require a matching entry in an OpenSSH known_hosts file
    KnownHosts(PathBuf),
}

/// Options applied when a connection dials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Dial and handshake timeout in seconds
    pub connect_timeout: u64,
    /// SOCKS5 proxy address (`host:port`), no proxy authentication
    pub proxy: Option<String>,
    /// Host key policy
    pub host_key: HostKeyPolicy,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            proxy: None,
            host_key: HostKeyPolicy::default(),
        }
    }
}

impl ConnectOptions {
    /// Set the dial timeout in seconds
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout = secs;
        self
    }

    /// Dial through a SOCKS5 proxy
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Set the host key policy
    pub fn with_host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    /// Dial timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

/// Open, verify and authenticate an SSH session. Blocking.
///
/// The returned session is in non-blocking mode.
pub fn connect(
    identity: &ServerIdentity,
    options: &ConnectOptions,
) -> Result<Session, TransportError> {
    let credentials = credential_chain(identity)?;
    let timeout = options.timeout();

    let tcp = match options.proxy.as_deref() {
        Some(proxy) => dial_proxy(proxy, identity)?,
        None => dial_direct(identity, timeout)?,
    };

    let mut session =
        Session::new().map_err(|e| TransportError::Handshake(format!("create session: {}", e)))?;
    session.set_timeout(timeout_millis(timeout));
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| TransportError::Handshake(format!("{}: {}", identity.address(), e)))?;

    verify_host_key(&session, identity, &options.host_key)?;
    authenticate(&session, &identity.user, &credentials)?;

    // Commands are not bounded by the dial timeout. From here on every call
    // is retried through `poll::until_ready`.
    session.set_timeout(0);
    session.set_blocking(false);

    info!("Connected to {}@{}", identity.user, identity.address());
    Ok(session)
}

fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX)
}

fn dial_direct(identity: &ServerIdentity, timeout: Duration) -> Result<TcpStream, TransportError> {
    let address = identity.address();
    debug!("Dialing {}", address);

    let addrs = (identity.host.as_str(), identity.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Dial(format!("resolve {}: {}", address, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Dial {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(TransportError::Dial(match last_error {
        Some(e) => format!("{}: {}", address, e),
        None => format!("{}: no addresses resolved", address),
    }))
}

fn dial_proxy(proxy: &str, identity: &ServerIdentity) -> Result<TcpStream, TransportError> {
    debug!("Dialing {} through SOCKS5 proxy {}", identity.address(), proxy);

    let stream = Socks5Stream::connect(proxy, (identity.host.as_str(), identity.port))
        .map_err(|e| {
            TransportError::Dial(format!("{} via proxy {}: {}", identity.address(), proxy, e))
        })?;
    Ok(stream.into_inner())
}

fn verify_host_key(
    session: &Session,
    identity: &ServerIdentity,
    policy: &HostKeyPolicy,
) -> Result<(), TransportError> {
    match policy {
        HostKeyPolicy::AcceptAny => {
            warn!("Accepting host key of {} without verification", identity.address());
            Ok(())
        }
        HostKeyPolicy::Fingerprint(expected) => {
            let expected = normalize_fingerprint(expected);
            let observed = host_key_fingerprint(session).ok_or_else(|| {
                TransportError::HostKey(format!("{} presented no host key", identity.address()))
            })?;
            if observed != expected {
                return Err(TransportError::HostKey(format!(
                    "{} mismatch: expected {}, got {}",
                    identity.address(),
                    expected,
                    observed
                )));
            }
            Ok(())
        }
        HostKeyPolicy::KnownHosts(path) => {
            let path = expand_home(path)?;
            let mut known = session
                .known_hosts()
                .map_err(|e| TransportError::HostKey(format!("known_hosts init: {}", e)))?;
            known
                .read_file(&path, KnownHostFileKind::OpenSSH)
                .map_err(|e| TransportError::HostKey(format!("read {}: {}", path.display(), e)))?;
            let (key, _) = session.host_key().ok_or_else(|| {
                TransportError::HostKey(format!("{} presented no host key", identity.address()))
            })?;

            match known.check_port(&identity.host, identity.port, key) {
                CheckResult::Match => Ok(()),
                CheckResult::NotFound => Err(TransportError::HostKey(format!(
                    "{} not found in {}",
                    identity.address(),
                    path.display()
                ))),
                CheckResult::Mismatch => Err(TransportError::HostKey(format!(
                    "{} does not match the key recorded in {}",
                    identity.address(),
                    path.display()
                ))),
                CheckResult::Failure => Err(TransportError::HostKey(format!(
                    "could not check {} against {}",
                    identity.address(),
                    path.display()
                ))),
            }
        }
    }
}

/// SHA-256 fingerprint of the server's host key, OpenSSH style
pub fn host_key_fingerprint(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(HashType::Sha256)?;
    Some(format!("SHA256:{}", STANDARD_NO_PAD.encode(hash)))
}

fn normalize_fingerprint(value: &str) -> String {
    let cleaned = value.trim().trim_end_matches('=');
    let body = match cleaned.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => &cleaned[7..],
        _ => cleaned,
    };
    format!("SHA256:{}", body.trim())
}
