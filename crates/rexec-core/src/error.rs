//! Error classification shared by the local and remote executors

use serde::{Deserialize, Serialize};
use std::fmt;

/// The step of an execution that produced an error.
///
/// Every error type in the workspace reports one of these through its
/// `phase()` method, so callers can branch on where a failure happened
/// without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Loading authentication material (key files)
    Credentials,
    /// Opening the TCP connection, directly or through a proxy
    Dial,
    /// SSH protocol handshake
    Handshake,
    /// Host key verification
    HostKey,
    /// User authentication
    Auth,
    /// Opening a channel on an established session
    Session,
    /// Starting a local subprocess
    Spawn,
    /// Running a command, local or remote
    Run,
    /// Liveness ping
    Ping,
    /// Opening the file-transfer sub-channel
    FileTransfer,
    /// Execution was cancelled by the caller
    Cancelled,
}

impl Phase {
    /// Short static name of the phase
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Credentials => "credentials",
            Phase::Dial => "dial",
            Phase::Handshake => "handshake",
            Phase::HostKey => "host-key",
            Phase::Auth => "auth",
            Phase::Session => "session",
            Phase::Spawn => "spawn",
            Phase::Run => "run",
            Phase::Ping => "ping",
            Phase::FileTransfer => "file-transfer",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a piped execution does when a command fails.
///
/// Piped output has already reached the caller's streams by the time a
/// command exits, so reporting the failure is optional. Local piped runs
/// default to [`FailurePolicy::Ignore`], remote piped runs to
/// [`FailurePolicy::Report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and carry on with the next command
    Ignore,
    /// Stop and return the failure to the caller
    Report,
}

impl FailurePolicy {
    /// Whether failures should be returned to the caller
    pub fn reports(&self) -> bool {
        matches!(self, FailurePolicy::Report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Dial.to_string(), "dial");
        assert_eq!(Phase::FileTransfer.to_string(), "file-transfer");
        assert_eq!(Phase::HostKey.as_str(), "host-key");
    }

    #[test]
    fn test_failure_policy() {
        assert!(FailurePolicy::Report.reports());
        assert!(!FailurePolicy::Ignore.reports());
    }
}
