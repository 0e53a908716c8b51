use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::CommandSpec;
use crate::errors::truncate_tail;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl StepOutput {
    pub fn succeeded(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
            duration: Duration::ZERO,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
            duration: Duration::ZERO,
        }
    }

    /// Diagnostic text for a failed step: stderr tail, falling back to stdout.
    pub fn failure_message(&self, max_chars: usize) -> String {
        let output = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        if self.timed_out {
            let reason = format!("timed out after {}s", self.duration.as_secs());
            if output.trim().is_empty() {
                return reason;
            }
            return format!("{}: {}", reason, truncate_tail(output, max_chars));
        }
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        format!("exit {}: {}", code, truncate_tail(output, max_chars))
    }
}

/// Abstraction over external command execution for testability.
/// Real implementation: `ProcessRunner`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `cmd` in `cwd`. A non-zero exit or a timeout is reported through
    /// `StepOutput`; `Err` means the command could not be started at all.
    async fn run(&self, cwd: &Path, cmd: &CommandSpec) -> Result<StepOutput>;
}

/// Runs commands as child processes in their own process group.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cwd: &Path, cmd: &CommandSpec) -> Result<StepOutput> {
        let started = Instant::now();
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", cmd.program))?;

        let pid = child.id();
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            capture(child.stdout.take(), stdout.clone()),
            capture(child.stderr.take(), stderr.clone()),
        ];

        let waited = timeout(cmd.timeout(), child.wait()).await;
        let status = match waited {
            Ok(status) => Some(status.with_context(|| format!("Failed to wait for '{}'", cmd.program))?),
            Err(_) => {
                // kill_on_drop only reaches the direct child
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };

        // A surviving grandchild may hold a pipe open.
        for mut reader in readers {
            if timeout(READER_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }

        Ok(match status {
            Some(status) => StepOutput {
                success: status.success(),
                exit_code: status.code(),
                stdout: lossy(&stdout),
                stderr: lossy(&stderr),
                timed_out: false,
                duration: started.elapsed(),
            },
            None => StepOutput {
                success: false,
                exit_code: None,
                stdout: lossy(&stdout),
                stderr: lossy(&stderr),
                timed_out: true,
                duration: cmd.timeout(),
            },
        })
    }
}

const READER_GRACE: Duration = Duration::from_secs(2);

/// Copy a child pipe into `buf` as it arrives, so output written before a
/// timeout is kept.
fn capture<R>(pipe: Option<R>, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = buf.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn lossy(buf: &Mutex<Vec<u8>>) -> String {
    buf.lock()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default()
}

/// SIGKILL a process group led by `pid`. Errors (group already gone) are ignored.
pub(crate) fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
    }
}
