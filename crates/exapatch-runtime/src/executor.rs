use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use exapatch_core::error::{ErrorCode, patch_error};
use tokio::process::Command;
use tracing::debug;

/// Exit code reported when a remote command exceeds its time limit.
pub const COMMAND_TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code ssh uses for connection failures.
const SSH_CONNECT_FAILURE_EXIT_CODE: i32 = 255;

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == COMMAND_TIMEOUT_EXIT_CODE
    }

    /// Last non-empty stdout line, trimmed.
    pub fn last_line(&self) -> Option<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
    }
}

/// Run a command, copy a file, or check a path on a named host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, host: &str, cmd: &str) -> Result<CommandOutput>;

    async fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()>;

    async fn exists(&self, host: &str, path: &str) -> Result<bool> {
        let out = self
            .run(host, &format!("test -e {} && echo yes || echo no", path))
            .await?;
        Ok(out.stdout.trim() == "yes")
    }
}

/// Run a command and return stdout, failing on a non-zero exit.
pub async fn run_stdout(exec: &dyn RemoteExecutor, host: &str, cmd: &str) -> Result<String> {
    let out = exec.run(host, cmd).await?;
    if !out.success() {
        anyhow::bail!(
            "Command failed on {} (exit {}): {}: {}",
            host,
            out.exit_code,
            cmd,
            out.stderr.trim()
        );
    }
    Ok(out.stdout)
}

/// Write `content` to `path` on `host` through a quoted heredoc.
pub async fn write_file(
    exec: &dyn RemoteExecutor,
    host: &str,
    path: &str,
    content: &str,
) -> Result<()> {
    let script = format!("cat > {} << 'EXAEOF'\n{}\nEXAEOF", path, content);
    run_stdout(exec, host, &script)
        .await
        .with_context(|| format!("Failed to write {} on {}", path, host))?;
    Ok(())
}

/// Single-quote a value for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// `RemoteExecutor` over the system `ssh`/`scp` binaries.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    user: String,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            user: user.into(),
            timeout,
        }
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.user, host)
    }

    fn ssh_options() -> [&'static str; 6] {
        [
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            "ConnectTimeout=30",
        ]
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &str, cmd: &str) -> Result<CommandOutput> {
        debug!(host, cmd, "Running remote command");
        let child = Command::new("ssh")
            .args(Self::ssh_options())
            .arg(self.destination(host))
            .arg(format!("bash -c {}", shell_quote(cmd)))
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(res) => res.with_context(|| format!("Failed to run ssh to {}", host))?,
            Err(_) => {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: format!("command timed out after {}s", self.timeout.as_secs()),
                    exit_code: COMMAND_TIMEOUT_EXIT_CODE,
                });
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == SSH_CONNECT_FAILURE_EXIT_CODE {
            return Err(patch_error(
                ErrorCode::ConnectFailed,
                format!(
                    "Unable to connect to {}: {}",
                    host,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code,
        })
    }

    async fn copy(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        debug!(host, local = %local.display(), remote, "Copying file");
        let status = Command::new("scp")
            .args(Self::ssh_options())
            .arg("-q")
            .arg(local)
            .arg(format!("{}:{}", self.destination(host), remote))
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to run scp to {}", host))?;

        if !status.success() {
            anyhow::bail!(
                "scp of {} to {}:{} failed (exit {})",
                local.display(),
                host,
                remote,
                status.code().unwrap_or(-1)
            );
        }
        Ok(())
    }
}
