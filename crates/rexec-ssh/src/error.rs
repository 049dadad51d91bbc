//! SSH-specific error types

use rexec_core::Phase;
use std::io;
use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Key material could not be loaded
    #[error("credential error: {0}")]
    Credentials(String),

    /// TCP connection (direct or proxied) could not be opened
    #[error("dial error: {0}")]
    Dial(String),

    /// SSH handshake failed
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Host key was rejected by the configured policy
    #[error("host key error: {0}")]
    HostKey(String),

    /// No credential in the chain was accepted
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A channel could not be opened on the session
    #[error("session error: {0}")]
    Session(String),

    /// Running a command failed
    #[error("session run command error: {0}")]
    Run(String),

    /// Remote command exited unsuccessfully.
    ///
    /// The message is the command's own trimmed combined output.
    #[error("{output}")]
    CommandFailed {
        /// Exit code of the failed command
        code: i32,
        /// Trimmed combined stdout and stderr
        output: String,
    },

    /// Liveness ping failed
    #[error("ping error: {0}")]
    Ping(String),

    /// SFTP sub-channel could not be opened
    #[error("init sftp client error: {0}")]
    FileTransfer(String),

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// The step that failed
    pub fn phase(&self) -> Phase {
        match self {
            TransportError::Credentials(_) => Phase::Credentials,
            TransportError::Dial(_) => Phase::Dial,
            TransportError::Handshake(_) => Phase::Handshake,
            TransportError::HostKey(_) => Phase::HostKey,
            TransportError::Authentication(_) => Phase::Auth,
            TransportError::Session(_) => Phase::Session,
            TransportError::Run(_) | TransportError::CommandFailed { .. } | TransportError::Io(_) => {
                Phase::Run
            }
            TransportError::Ping(_) => Phase::Ping,
            TransportError::FileTransfer(_) => Phase::FileTransfer,
            TransportError::Cancelled => Phase::Cancelled,
        }
    }
}

impl From<tokio::task::JoinError> for TransportError {
    fn from(err: tokio::task::JoinError) -> Self {
        TransportError::Io(io::Error::other(format!("worker task failed: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_displays_output_only() {
        let err = TransportError::CommandFailed {
            code: 2,
            output: "ls: cannot access '/nope': No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "ls: cannot access '/nope': No such file or directory"
        );
        assert_eq!(err.phase(), Phase::Run);
    }

    #[test]
    fn test_run_error_context() {
        let err = TransportError::Run("process exited with status 1".to_string());
        assert_eq!(
            err.to_string(),
            "session run command error: process exited with status 1"
        );
    }

    #[test]
    fn test_phases() {
        assert_eq!(TransportError::Dial("refused".into()).phase(), Phase::Dial);
        assert_eq!(TransportError::Authentication("x".into()).phase(), Phase::Auth);
        assert_eq!(TransportError::FileTransfer("x".into()).phase(), Phase::FileTransfer);
        assert_eq!(TransportError::Cancelled.phase(), Phase::Cancelled);
    }
}
