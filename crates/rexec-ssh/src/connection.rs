//! SSH connection management

use crate::executor::run_merged;
use crate::poll::until_ready;
use crate::transport::{self, ConnectOptions, ServerIdentity};
use crate::TransportError;
use ssh2::{Session, Sftp};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const PING_COMMAND: &str = r#"echo "pong""#;
const PING_REPLY: &str = "pong";

#[derive(Default)]
struct ConnectionState {
    session: Option<Session>,
    sftp: Option<Arc<Sftp>>,
    /// Bumped by every close so an in-flight dial can tell it was overtaken
    generation: u64,
}

/// A lazily established SSH connection to one server.
///
/// The session is dialed on first use and reused afterwards; it is only
/// dropped by [`RemoteConnection::close`]. Commands open their own channels
/// on the shared non-blocking session, so concurrent callers do not
/// serialize behind each other.
pub struct RemoteConnection {
    identity: ServerIdentity,
    options: ConnectOptions,
    state: Mutex<ConnectionState>,
    /// Serializes dialing and SFTP setup
    opening: Mutex<()>,
}

impl RemoteConnection {
    /// Create a connection with default options. Nothing is dialed yet.
    pub fn new(identity: ServerIdentity) -> Self {
        Self::with_options(identity, ConnectOptions::default())
    }

    /// Create a connection with explicit options
    pub fn with_options(identity: ServerIdentity, options: ConnectOptions) -> Self {
        Self {
            identity,
            options,
            state: Mutex::new(ConnectionState::default()),
            opening: Mutex::new(()),
        }
    }

    /// Server this connection targets
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Pool key of the server
    pub fn key(&self) -> &str {
        &self.identity.key
    }

    /// Dial options
    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    /// Whether a session is currently open
    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.session.is_some()
    }

    /// The open session, if any. It is in non-blocking mode; see
    /// [`until_ready`](crate::until_ready).
    pub async fn session(&self) -> Option<Session> {
        self.state.lock().await.session.clone()
    }

    /// The open SFTP handle, if any
    pub async fn file_transfer(&self) -> Option<Arc<Sftp>> {
        self.state.lock().await.sftp.clone()
    }

    /// Return the open session, dialing it first if needed.
    ///
    /// Concurrent first callers share one dial.
    pub async fn ensure_session(&self) -> Result<Session, TransportError> {
        if let Some(session) = self.session().await {
            return Ok(session);
        }
        let _opening = self.opening.lock().await;
        self.dial_if_needed().await
    }

    /// Return the SFTP handle, opening the session and the sub-channel first
    /// if needed
    pub async fn ensure_file_transfer(&self) -> Result<Arc<Sftp>, TransportError> {
        if let Some(sftp) = self.file_transfer().await {
            return Ok(sftp);
        }
        let _opening = self.opening.lock().await;
        if let Some(sftp) = self.file_transfer().await {
            return Ok(sftp);
        }

        let session = self.dial_if_needed().await?;
        let generation = self.state.lock().await.generation;
        let sftp = tokio::task::spawn_blocking(move || until_ready(|| session.sftp()))
            .await?
            .map_err(|e| TransportError::FileTransfer(e.to_string()))?;
        let sftp = Arc::new(sftp);

        let mut state = self.state.lock().await;
        if state.generation != generation {
            drop(state);
            tokio::task::spawn_blocking(move || drop(sftp)).await?;
            return Err(TransportError::FileTransfer(
                "connection closed while opening SFTP".to_string(),
            ));
        }
        debug!("Opened SFTP channel to {}", self.identity.address());
        state.sftp = Some(Arc::clone(&sftp));
        Ok(sftp)
    }

    /// Dial unless a session already exists. Callers hold `opening`; `state`
    /// is only locked briefly so `close` and the accessors stay responsive
    /// during a slow dial.
    async fn dial_if_needed(&self) -> Result<Session, TransportError> {
        let generation = {
            let state = self.state.lock().await;
            if let Some(session) = &state.session {
                return Ok(session.clone());
            }
            state.generation
        };

        info!(
            "Connecting to {}@{} ({})",
            self.identity.user,
            self.identity.address(),
            self.identity.key
        );
        let identity = self.identity.clone();
        let options = self.options.clone();
        let session =
            tokio::task::spawn_blocking(move || transport::connect(&identity, &options)).await??;

        let mut state = self.state.lock().await;
        if state.generation != generation {
            drop(state);
            warn!("Connection to {} closed while dialing", self.identity.address());
            shutdown(self.identity.address(), None, Some(session)).await;
            return Err(TransportError::Session(
                "connection closed while dialing".to_string(),
            ));
        }
        state.session = Some(session.clone());
        Ok(session)
    }

    /// Close the SFTP channel, then the session.
    ///
    /// Best-effort and idempotent; a connection that never dialed closes
    /// immediately. A dial still in progress is discarded when it completes.
    pub async fn close(&self) {
        let (sftp, session) = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            (state.sftp.take(), state.session.take())
        };
        if sftp.is_none() && session.is_none() {
            return;
        }

        debug!("Closing connection to {}", self.identity.address());
        shutdown(self.identity.address(), sftp, session).await;
    }

    /// Check the server answers a trivial command on a fresh channel
    pub async fn ping(&self) -> Result<(), TransportError> {
        let session = self.ensure_session().await?;
        let (exit, output) =
            tokio::task::spawn_blocking(move || run_merged(&session, PING_COMMAND, None))
                .await?
                .map_err(|e| TransportError::Ping(e.to_string()))?;

        if !exit.success() {
            return Err(TransportError::Ping(exit.describe()));
        }

        let reply = String::from_utf8_lossy(&output);
        if reply.trim() != PING_REPLY {
            return Err(TransportError::Ping(format!(
                "server did not respond '{}'",
                PING_REPLY
            )));
        }
        Ok(())
    }
}

/// Drop the SFTP handle and disconnect the session off the runtime
async fn shutdown(address: String, sftp: Option<Arc<Sftp>>, session: Option<Session>) {
    let closed = tokio::task::spawn_blocking(move || {
        drop(sftp);
        if let Some(session) = session {
            if let Err(e) = until_ready(|| session.disconnect(None, "connection closed", None)) {
                debug!("Disconnect from {} failed: {}", address, e);
            }
        }
    })
    .await;

    if let Err(e) = closed {
        warn!("Error closing connection: {}", e);
    }
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("identity", &self.identity)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_core::Phase;
    use std::net::TcpListener;

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn unreachable_identity() -> ServerIdentity {
        ServerIdentity::new("local", "127.0.0.1", "nobody")
            .with_port(closed_port())
            .with_password("secret")
    }

    #[test]
    fn test_connection_creation() {
        let conn = RemoteConnection::new(ServerIdentity::new("web", "example.com", "deploy"));
        assert_eq!(conn.key(), "web");
        assert_eq!(conn.identity().host, "example.com");
        assert_eq!(conn.options().connect_timeout, 60);
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let conn = RemoteConnection::new(ServerIdentity::new("web", "example.com", "deploy"));
        assert!(!conn.is_connected().await);

        conn.close().await;
        conn.close().await;

        assert!(!conn.is_connected().await);
        assert!(conn.session().await.is_none());
        assert!(conn.file_transfer().await.is_none());
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let conn = RemoteConnection::new(unreachable_identity());

        let err = conn.ensure_session().await.err().expect("dial must fail");
        assert_eq!(err.phase(), Phase::Dial);
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_dial() {
        let identity = unreachable_identity().with_identity_file("/no/such/key");
        let conn = RemoteConnection::new(identity);

        let err = conn.ensure_session().await.err().expect("missing key must fail");
        assert_eq!(err.phase(), Phase::Credentials);
    }

    #[tokio::test]
    async fn test_file_transfer_requires_session() {
        let conn = RemoteConnection::new(unreachable_identity());

        let err = conn
            .ensure_file_transfer()
            .await
            .err()
            .expect("SFTP without a session must fail");
        assert_eq!(err.phase(), Phase::Dial);
        assert!(conn.file_transfer().await.is_none());
    }

    #[tokio::test]
    async fn test_ping_without_server() {
        let conn = RemoteConnection::new(unreachable_identity());
        assert!(conn.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_close_during_slow_dial_is_prompt() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (release, released) = std::sync::mpsc::channel::<()>();

        // Accepts the TCP connection but never speaks SSH until released.
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let _ = released.recv();
            drop(stream);
        });

        let identity = ServerIdentity::new("slow", "127.0.0.1", "nobody")
            .with_port(port)
            .with_password("secret");
        let conn = Arc::new(RemoteConnection::with_options(
            identity,
            ConnectOptions::default().with_connect_timeout(10),
        ));

        let dialing = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.ensure_session().await.err() }
        });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), conn.close())
            .await
            .expect("close blocked behind the dial");
        assert!(!conn.is_connected().await);

        release.send(()).unwrap();
        let err = tokio::time::timeout(std::time::Duration::from_secs(10), dialing)
            .await
            .expect("dial did not finish")
            .unwrap();
        assert!(err.is_some());
        assert!(!conn.is_connected().await);
        server.join().unwrap();
    }
}
