//! Local command execution through a shell interpreter

use crate::{Result, RexecError};
use rexec_core::{pump, FailurePolicy, OutputStreams};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Interpreter used when none is configured
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// What to run and how to launch it.
///
/// Each command string is passed to `<shell> -c <command>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSpec {
    /// Shell command strings, run in order
    pub commands: Vec<String>,
    /// Interpreter path
    pub shell: PathBuf,
    /// Working directory, inherited when unset
    pub dir: Option<PathBuf>,
    /// Environment. Empty inherits the caller's environment, anything else
    /// replaces it entirely.
    pub env: BTreeMap<String, String>,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            shell: PathBuf::from(DEFAULT_SHELL),
            dir: None,
            env: BTreeMap::new(),
        }
    }
}

/// Runs shell commands as local subprocesses.
///
/// `run_combined` buffers and returns output, stopping at the first failure.
/// `run_piped` streams output live; with the default
/// [`FailurePolicy::Ignore`] a failed command is logged and the next one runs.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    spec: CommandSpec,
    streams: OutputStreams,
    failure_policy: FailurePolicy,
    cancel: Option<CancellationToken>,
}

impl ProcessRunner {
    /// Runner with no commands and the default shell
    pub fn new() -> Self {
        Self::from_spec(CommandSpec::default())
    }

    /// Runner for an existing spec
    pub fn from_spec(spec: CommandSpec) -> Self {
        Self {
            spec,
            streams: OutputStreams::inherit(),
            failure_policy: FailurePolicy::Ignore,
            cancel: None,
        }
    }

    /// Replace the command list
    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Append one command
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.spec.commands.push(command.into());
        self
    }

    /// Set the interpreter
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.spec.shell = shell.into();
        self
    }

    /// Set the working directory
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec.dir = Some(dir.into());
        self
    }

    /// Add an environment variable. Once any is set the caller's
    /// environment is no longer inherited.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(key.into(), value.into());
        self
    }

    /// Send piped output somewhere other than the process's own streams
    pub fn with_streams(mut self, streams: OutputStreams) -> Self {
        self.streams = streams;
        self
    }

    /// Change what `run_piped` does with a failed command
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Kill the running command when the token is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The launch spec
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Run every command in order and return the concatenation of their
    /// trimmed combined output. Stops at the first failure and returns only
    /// the error.
    pub async fn run_combined(&self) -> Result<String> {
        let mut result = String::new();
        for command in &self.spec.commands {
            result.push_str(&self.combined_one(command).await?);
        }
        Ok(result)
    }

    /// Run every command in order, streaming output live
    pub async fn run_piped(&self) -> Result<()> {
        for command in &self.spec.commands {
            let outcome = self.piped_one(command).await;
            self.settle(command, outcome)?;
        }
        Ok(())
    }

    /// Run one command with stdout and stderr sharing a single pipe, so the
    /// output keeps the order the command wrote it in
    pub(crate) async fn combined_one(&self, command: &str) -> Result<String> {
        self.check_cancelled()?;

        let (reader, writer) = io::pipe()?;
        let stderr = writer.try_clone()?;
        let mut child = self.spawn(command, Stdio::null(), writer.into(), stderr.into())?;

        let mut reader = pipe::Receiver::from_file(File::from(OwnedFd::from(reader)))?;
        let collect = tokio::spawn(async move {
            let mut output = Vec::new();
            reader.read_to_end(&mut output).await?;
            Ok::<_, io::Error>(output)
        });

        let status = self.wait_child(&mut child, [&collect]).await?;
        let output = collect.await??;
        let output = String::from_utf8_lossy(&output).trim().to_string();

        if !status.success() {
            return Err(RexecError::Exit {
                command: command.to_string(),
                code: status.code(),
                output,
            });
        }
        Ok(output)
    }

    pub(crate) async fn piped_one(&self, command: &str) -> Result<()> {
        self.check_cancelled()?;

        let mut child = self.spawn(command, Stdio::inherit(), Stdio::piped(), Stdio::piped())?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RexecError::Io(io::Error::other(
                "child output pipes were not captured",
            )));
        };

        let out_task = tokio::spawn(pump(stdout, self.streams.stdout().clone()));
        let err_task = tokio::spawn(pump(stderr, self.streams.stderr().clone()));

        let status = self.wait_child(&mut child, [&out_task, &err_task]).await?;
        let (out, err) = tokio::join!(out_task, err_task);
        let copied_out = out??;
        let copied_err = err??;
        debug!(
            "Process exited with {} after {} stdout and {} stderr bytes",
            status, copied_out, copied_err
        );

        if !status.success() {
            return Err(RexecError::Exit {
                command: command.to_string(),
                code: status.code(),
                output: String::new(),
            });
        }
        Ok(())
    }

    /// Apply the failure policy to the outcome of one piped command
    pub(crate) fn settle(&self, command: &str, outcome: Result<()>) -> Result<()> {
        match outcome {
            Err(e) if !self.failure_policy.reports() && e.is_command_failure() => {
                warn!("Command failed: {}: {}", command, e);
                Ok(())
            }
            other => other,
        }
    }

    fn build_command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.spec.shell);
        cmd.arg("-c").arg(command);

        if let Some(dir) = self.spec.dir.as_ref().filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        if !self.spec.env.is_empty() {
            cmd.env_clear();
            cmd.envs(&self.spec.env);
        }

        cmd.kill_on_drop(true);
        cmd
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(RexecError::Cancelled),
            _ => Ok(()),
        }
    }

    fn spawn(&self, command: &str, stdin: Stdio, stdout: Stdio, stderr: Stdio) -> Result<Child> {
        debug!("Executing process: {} -c {:?}", self.spec.shell.display(), command);
        // The `Command` is dropped at the end of this statement, closing the
        // parent's copies of any pipe ends handed to the child.
        self.build_command(command)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|source| RexecError::Spawn {
                command: command.to_string(),
                source,
            })
    }

    /// Wait for the child, killing it on cancellation. The output readers
    /// are aborted when the wait fails.
    async fn wait_child<T, const N: usize>(
        &self,
        child: &mut Child,
        readers: [&JoinHandle<T>; N],
    ) -> Result<ExitStatus> {
        let waited = match &self.cancel {
            None => child.wait().await.map_err(RexecError::from),
            Some(token) => {
                let finished = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = token.cancelled() => None,
                };
                match finished {
                    Some(status) => status.map_err(RexecError::from),
                    None => {
                        warn!("Cancelled, killing process {:?}", child.id());
                        if let Err(e) = child.kill().await {
                            warn!("Failed to kill process: {}", e);
                        }
                        Err(RexecError::Cancelled)
                    }
                }
            }
        };

        if waited.is_err() {
            for reader in readers {
                reader.abort();
            }
        }
        waited
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}
