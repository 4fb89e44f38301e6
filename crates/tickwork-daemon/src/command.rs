//! Shell command actions.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::process::Command;
use tracing::debug;

use tickwork_scheduler::{Action, ActionFuture};

/// Stderr excerpt kept in the error message of a failed command.
const MAX_STDERR_CHARS: usize = 512;

/// A command run through `<shell> -c` on every firing.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    shell: String,
    command: String,
    timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new(
        shell: impl Into<String>,
        command: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            shell: shell.into(),
            command: command.into(),
            timeout,
        }
    }

    /// Run the command once. A non-zero exit status or an expired timeout is an
    /// error. The child is killed when this future is dropped, so an abandoned
    /// execution does not leave a stray process behind.
    pub async fn run(&self) -> anyhow::Result<()> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{} -c`", self.shell))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| anyhow::anyhow!("command timed out after {limit:?}"))??,
            None => child.wait_with_output().await?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(command = %self.command, stdout = %stdout.trim(), "command output");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
            match output.status.code() {
                Some(code) => bail!("command exited with code {code}: {stderr}"),
                None => bail!("command terminated by signal: {stderr}"),
            }
        }
        Ok(())
    }

    pub fn into_action(self) -> Action {
        let command = Arc::new(self);
        Arc::new(move || -> ActionFuture {
            let command = Arc::clone(&command);
            Box::pin(async move { command.run().await })
        })
    }
}
