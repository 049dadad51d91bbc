//! # rexec
//!
//! Run shell commands locally or over SSH, either buffering their combined
//! output or streaming stdout and stderr live to the caller.
//!
//! Local commands go through [`ProcessRunner`]. Remote commands go through a
//! [`RemoteExecutor`] built on a [`RemoteConnection`], usually obtained from
//! a [`ConnectionPool`] so repeated work against one server reuses a single
//! SSH session. [`Executor`] covers both.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use rexec_core as core;
pub use rexec_core::{CapturedOutput, FailurePolicy, OutputStreams, Phase};

#[cfg(feature = "ssh2")]
pub use rexec_ssh as ssh;
#[cfg(feature = "ssh2")]
pub use rexec_ssh::{
    ConnectOptions, ConnectionPool, HostKeyPolicy, RemoteConnection, RemoteExecutor,
    ServerIdentity, TransportError,
};

/// Error types for the rexec library
pub mod error;

/// Local command execution
pub mod runner;

/// Common execution seam
pub mod executor;

pub use error::RexecError;
pub use runner::{CommandSpec, ProcessRunner, DEFAULT_SHELL};
pub use executor::Executor;
pub use tokio_util::sync::CancellationToken;

/// Result type alias for rexec operations
pub type Result<T> = std::result::Result<T, RexecError>;
