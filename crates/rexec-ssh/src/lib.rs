//! # rexec SSH transport
//!
//! Lazily established SSH connections, remote command execution and a keyed
//! connection pool.

#![warn(missing_docs)]

/// Server identity, dial options and session establishment
pub mod transport;

/// Credential chain and authentication
pub mod auth;

/// SSH connection management
pub mod connection;

/// Remote command execution
pub mod executor;

/// Connection pool and management
pub mod pool;

/// SSH-specific error types
pub mod error;

/// Non-blocking session helpers
pub mod poll;

pub use transport::{ConnectOptions, HostKeyPolicy, ServerIdentity};
pub use auth::Credential;
pub use connection::RemoteConnection;
pub use executor::RemoteExecutor;
pub use pool::ConnectionPool;
pub use error::TransportError;
pub use poll::until_ready;
pub use ssh2::{Session, Sftp};

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
