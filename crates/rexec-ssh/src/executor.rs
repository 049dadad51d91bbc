//! Command execution over a remote connection

use crate::poll::{drain, until_ready};
use crate::{RemoteConnection, TransportError};
use rexec_core::{CaptureBuffer, ChunkCopier, FailurePolicy, OutputStreams, Phase, SharedWriter};
use ssh2::{Channel, ExtendedData, Session, Stream};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a remote command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExitInfo {
    pub(crate) code: i32,
    pub(crate) signal: Option<String>,
}

impl ExitInfo {
    pub(crate) fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }

    pub(crate) fn describe(&self) -> String {
        match &self.signal {
            Some(signal) => format!("process killed by signal {}", signal),
            None => format!("process exited with status {}", self.code),
        }
    }
}

/// Runs commands over a [`RemoteConnection`], one channel per call
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    connection: Arc<RemoteConnection>,
    streams: OutputStreams,
    failure_policy: FailurePolicy,
    cancel: Option<CancellationToken>,
}

impl RemoteExecutor {
    /// Executor writing piped output to the process's own streams
    pub fn new(connection: Arc<RemoteConnection>) -> Self {
        Self {
            connection,
            streams: OutputStreams::inherit(),
            failure_policy: FailurePolicy::Report,
            cancel: None,
        }
    }

    /// Send piped output somewhere else
    pub fn with_streams(mut self, streams: OutputStreams) -> Self {
        self.streams = streams;
        self
    }

    /// Change what `run_piped` does with a failed command
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Abandon the running command when the token is cancelled.
    ///
    /// The caller gets [`TransportError::Cancelled`] at once and the command's
    /// channel is closed.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The underlying connection
    pub fn connection(&self) -> &Arc<RemoteConnection> {
        &self.connection
    }

    /// Run a command and return its trimmed combined output.
    ///
    /// On failure the error text is the command's own trimmed output.
    pub async fn run_combined(&self, command: &str) -> Result<String, TransportError> {
        self.check_cancelled()?;
        let session = self.connection.ensure_session().await?;
        debug!("Running on {}: {}", self.connection.key(), command);

        let command = command.to_string();
        let cancel = self.cancel.clone();
        let task =
            tokio::task::spawn_blocking(move || run_merged(&session, &command, cancel.as_ref()));
        let (exit, output) = self.wait(task).await?;
        combined_outcome(&exit, &output)
    }

    /// Run a command, streaming stdout and stderr to the configured sinks
    pub async fn run_piped(&self, command: &str) -> Result<(), TransportError> {
        self.check_cancelled()?;
        let session = self.connection.ensure_session().await?;
        debug!("Streaming on {}: {}", self.connection.key(), command);

        let streams = self.streams.clone();
        let owned = command.to_string();
        let cancel = self.cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            run_streamed(&session, &owned, &streams, cancel.as_ref())
        });

        let result = self.wait(task).await.and_then(|exit| {
            if exit.success() {
                Ok(())
            } else {
                Err(TransportError::Run(exit.describe()))
            }
        });

        match result {
            Err(e) if !self.failure_policy.reports() && swallowable(&e) => {
                warn!("Command on {} failed: {}: {}", self.connection.key(), command, e);
                Ok(())
            }
            other => other,
        }
    }

    fn check_cancelled(&self) -> Result<(), TransportError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(TransportError::Cancelled),
            _ => Ok(()),
        }
    }

    async fn wait<T>(&self, task: JoinHandle<Result<T, TransportError>>) -> Result<T, TransportError>
    where
        T: Send + 'static,
    {
        let Some(token) = &self.cancel else {
            return task.await?;
        };

        tokio::select! {
            joined = task => joined?,
            _ = token.cancelled() => {
                warn!("Stopped waiting for command on {}", self.connection.key());
                Err(TransportError::Cancelled)
            }
        }
    }
}

fn swallowable(err: &TransportError) -> bool {
    matches!(err.phase(), Phase::Session | Phase::Run)
}

pub(crate) fn combined_outcome(exit: &ExitInfo, output: &[u8]) -> Result<String, TransportError> {
    let text = String::from_utf8_lossy(output).trim().to_string();
    if exit.success() {
        Ok(text)
    } else {
        Err(TransportError::CommandFailed {
            code: exit.code,
            output: text,
        })
    }
}

/// Run a command with stderr merged into stdout and collect it. Blocking.
pub(crate) fn run_merged(
    session: &Session,
    command: &str,
    cancel: Option<&CancellationToken>,
) -> Result<(ExitInfo, Vec<u8>), TransportError> {
    let mut channel = start(session, command, true)?;
    let output = CaptureBuffer::new();
    let mut pipes = [(
        channel.stream(0),
        ChunkCopier::new(SharedWriter::new(output.clone())),
    )];

    let exit = pump_channel(&mut channel, &mut pipes, cancel)?;
    Ok((exit, output.snapshot().to_vec()))
}

/// Run a command and copy both streams to the sinks as data arrives. Blocking.
fn run_streamed(
    session: &Session,
    command: &str,
    streams: &OutputStreams,
    cancel: Option<&CancellationToken>,
) -> Result<ExitInfo, TransportError> {
    let mut channel = start(session, command, false)?;
    let mut pipes = [
        (channel.stream(0), ChunkCopier::new(streams.stdout().clone())),
        (channel.stderr(), ChunkCopier::new(streams.stderr().clone())),
    ];

    let exit = pump_channel(&mut channel, &mut pipes, cancel)?;
    debug!(
        "Copied {} stdout and {} stderr bytes",
        pipes[0].1.total(),
        pipes[1].1.total()
    );
    Ok(exit)
}

fn start(session: &Session, command: &str, merge: bool) -> Result<Channel, TransportError> {
    let mut channel = until_ready(|| session.channel_session())
        .map_err(|e| TransportError::Session(e.to_string()))?;
    if merge {
        until_ready(|| channel.handle_extended_data(ExtendedData::Merge))
            .map_err(|e| TransportError::Session(e.to_string()))?;
    }
    until_ready(|| channel.exec(command)).map_err(|e| TransportError::Run(e.to_string()))?;

    // Nothing is ever written to stdin; commands reading it see EOF.
    until_ready(|| channel.send_eof()).map_err(|e| TransportError::Run(e.to_string()))?;
    Ok(channel)
}

/// Drain the channel's streams, then wait for it to close
fn pump_channel(
    channel: &mut Channel,
    pipes: &mut [(Stream, ChunkCopier)],
    cancel: Option<&CancellationToken>,
) -> Result<ExitInfo, TransportError> {
    if let Err(e) = drain(pipes, || channel.eof(), cancel) {
        if let Err(close) = until_ready(|| channel.close()) {
            debug!("Closing abandoned channel failed: {}", close);
        }
        return Err(e);
    }
    finish(channel)
}

fn finish(channel: &mut Channel) -> Result<ExitInfo, TransportError> {
    until_ready(|| channel.wait_close()).map_err(|e| TransportError::Run(e.to_string()))?;
    let code = channel
        .exit_status()
        .map_err(|e| TransportError::Run(e.to_string()))?;
    let signal = channel.exit_signal().ok().and_then(|s| s.exit_signal);
    Ok(ExitInfo { code, signal })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerIdentity;
    use std::net::TcpListener;

    fn exited(code: i32) -> ExitInfo {
        ExitInfo { code, signal: None }
    }

    fn unreachable_connection() -> Arc<RemoteConnection> {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        Arc::new(RemoteConnection::new(
            ServerIdentity::new("local", "127.0.0.1", "nobody")
                .with_port(port)
                .with_password("secret"),
        ))
    }

    #[test]
    fn test_combined_outcome_success_trims() {
        let output = combined_outcome(&exited(0), b"\n  hello world \n").unwrap();
        assert_eq!(output, "hello world");
    }

    #[test]
    fn test_combined_outcome_failure_is_output() {
        let err = combined_outcome(&exited(2), b"cat: /missing: No such file or directory\n")
            .unwrap_err();
        assert_eq!(err.to_string(), "cat: /missing: No such file or directory");
        assert!(matches!(err, TransportError::CommandFailed { code: 2, .. }));
    }

    #[test]
    fn test_signal_is_failure() {
        let exit = ExitInfo {
            code: 0,
            signal: Some("KILL".to_string()),
        };
        assert!(!exit.success());
        assert_eq!(exit.describe(), "process killed by signal KILL");
        assert!(combined_outcome(&exit, b"partial").is_err());
    }

    #[test]
    fn test_exit_describe() {
        assert_eq!(exited(127).describe(), "process exited with status 127");
    }

    #[test]
    fn test_swallowable_phases() {
        assert!(swallowable(&TransportError::Run("x".into())));
        assert!(swallowable(&TransportError::Session("x".into())));
        assert!(!swallowable(&TransportError::Dial("x".into())));
        assert!(!swallowable(&TransportError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_combined_dial_failure() {
        let executor = RemoteExecutor::new(unreachable_connection());
        let err = executor.run_combined("true").await.unwrap_err();
        assert_eq!(err.phase(), Phase::Dial);
    }

    #[tokio::test]
    async fn test_run_piped_dial_failure_not_swallowed() {
        let executor = RemoteExecutor::new(unreachable_connection())
            .with_failure_policy(FailurePolicy::Ignore);
        let err = executor.run_piped("true").await.unwrap_err();
        assert_eq!(err.phase(), Phase::Dial);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let executor = RemoteExecutor::new(unreachable_connection()).with_cancellation(token);

        let err = executor.run_combined("true").await.unwrap_err();
        assert_eq!(err.phase(), Phase::Cancelled);
        assert!(!executor.connection().is_connected().await);
    }
}
