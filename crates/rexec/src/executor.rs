//! One seam for running a single command locally or remotely

use crate::{ProcessRunner, Result};
use async_trait::async_trait;

/// Something that can run one shell command in either output mode
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `command` and return its trimmed combined output
    async fn exec_combined(&self, command: &str) -> Result<String>;

    /// Run `command`, streaming its output live
    async fn exec_piped(&self, command: &str) -> Result<()>;
}

/// Runs the given command with the runner's shell, directory, environment,
/// sinks and failure policy. The runner's own command list is not used.
#[async_trait]
impl Executor for ProcessRunner {
    async fn exec_combined(&self, command: &str) -> Result<String> {
        self.combined_one(command).await
    }

    async fn exec_piped(&self, command: &str) -> Result<()> {
        let outcome = self.piped_one(command).await;
        self.settle(command, outcome)
    }
}

#[cfg(feature = "ssh2")]
#[async_trait]
impl Executor for rexec_ssh::RemoteExecutor {
    async fn exec_combined(&self, command: &str) -> Result<String> {
        Ok(self.run_combined(command).await?)
    }

    async fn exec_piped(&self, command: &str) -> Result<()> {
        Ok(self.run_piped(command).await?)
    }
}
