//! Error types for the rexec library

use rexec_core::Phase;
use std::io;
use thiserror::Error;

/// Main error type for rexec operations
#[derive(Debug, Error)]
pub enum RexecError {
    /// The interpreter could not be started
    #[error("spawn error: `{command}`: {source}")]
    Spawn {
        /// Command that was being started
        command: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// A local command exited unsuccessfully
    #[error("run error: `{command}` {}", describe_exit(.code, .output))]
    Exit {
        /// Command that failed
        command: String,
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Trimmed combined output, empty in piped mode
        output: String,
    },

    /// Caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error while copying output
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Remote transport errors
    #[cfg(feature = "ssh2")]
    #[error(transparent)]
    Transport(#[from] rexec_ssh::TransportError),
}

fn describe_exit(code: &Option<i32>, output: &str) -> String {
    let status = match code {
        Some(code) => format!("exited with status {}", code),
        None => "was killed by a signal".to_string(),
    };
    if output.is_empty() {
        status
    } else {
        format!("{}: {}", status, output)
    }
}

impl RexecError {
    /// The step that failed
    pub fn phase(&self) -> Phase {
        match self {
            RexecError::Spawn { .. } => Phase::Spawn,
            RexecError::Exit { .. } | RexecError::Io(_) => Phase::Run,
            RexecError::Cancelled => Phase::Cancelled,
            #[cfg(feature = "ssh2")]
            RexecError::Transport(e) => e.phase(),
        }
    }

    /// Exit code of a failed local command
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RexecError::Exit { code, .. } => *code,
            _ => None,
        }
    }

    /// Whether an ignoring failure policy may swallow this error
    pub(crate) fn is_command_failure(&self) -> bool {
        matches!(self.phase(), Phase::Spawn | Phase::Session | Phase::Run)
    }
}

impl From<tokio::task::JoinError> for RexecError {
    fn from(err: tokio::task::JoinError) -> Self {
        RexecError::Io(io::Error::other(format!("worker task failed: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_display() {
        let err = RexecError::Exit {
            command: "false".to_string(),
            code: Some(1),
            output: String::new(),
        };
        assert_eq!(err.to_string(), "run error: `false` exited with status 1");
        assert_eq!(err.exit_code(), Some(1));
        assert_eq!(err.phase(), Phase::Run);

        let err = RexecError::Exit {
            command: "ls /nope".to_string(),
            code: Some(2),
            output: "ls: /nope: No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "run error: `ls /nope` exited with status 2: ls: /nope: No such file or directory"
        );
    }

    #[test]
    fn test_signal_display() {
        let err = RexecError::Exit {
            command: "sleep 10".to_string(),
            code: None,
            output: String::new(),
        };
        assert_eq!(err.to_string(), "run error: `sleep 10` was killed by a signal");
        assert_eq!(err.exit_code(), None);
    }

    #[test]
    fn test_command_failure_classification() {
        let spawn = RexecError::Spawn {
            command: "x".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(spawn.is_command_failure());
        assert!(!RexecError::Cancelled.is_command_failure());
    }

    #[cfg(feature = "ssh2")]
    #[test]
    fn test_transport_error_is_transparent() {
        let err: RexecError = rexec_ssh::TransportError::CommandFailed {
            code: 1,
            output: "permission denied".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "permission denied");
        assert_eq!(err.phase(), Phase::Run);

        let err: RexecError = rexec_ssh::TransportError::Dial("refused".to_string()).into();
        assert_eq!(err.phase(), Phase::Dial);
        assert!(!err.is_command_failure());
    }
}
