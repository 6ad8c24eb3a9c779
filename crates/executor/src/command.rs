//! Subprocess execution with a deadline and bounded output.
//!
//! The child runs in its own process group so a timeout can kill everything
//! it spawned (`sh -c` pipelines included), not just the immediate child.

use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};
use warden_core::CommandPlan;

use crate::error::ExecError;

/// Environment variables passed through to children. Everything else,
/// including the vault passphrase and API tokens, is withheld.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TZ", "TERM"];

const CHUNK_SIZE: usize = 64 * 1024;

/// Result of a completed subprocess.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal.
    pub exit_code: Option<i32>,
    /// Either stream exceeded the output cap.
    pub truncated: bool,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a plan to completion or until `timeout` expires.
pub async fn run_plan(
    plan: &CommandPlan,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<CommandOutput, ExecError> {
    let mut cmd = match plan {
        CommandPlan::Direct { program, args } => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
        CommandPlan::Shell { line } => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(line);
            cmd
        }
    };

    cmd.env_clear();
    for key in PASSTHROUGH_ENV {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    // Kill child on drop so a cancelled caller cannot leave it running.
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(program = %plan.program(), shell = plan.uses_shell(), "Spawning command");
    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::from_io(e, &format!("spawn '{}'", plan.program())))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::Failed("failed to capture stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::Failed("failed to capture stderr".into()))?;

    let outcome = tokio::time::timeout(timeout, async {
        tokio::join!(
            read_capped(stdout, max_output_bytes),
            read_capped(stderr, max_output_bytes),
            child.wait()
        )
    })
    .await;

    match outcome {
        Ok(((stdout_buf, stdout_over), (stderr_buf, stderr_over), status)) => {
            let status = status.map_err(|e| ExecError::Failed(format!("wait: {e}")))?;
            let output = CommandOutput {
                stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
                stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
                exit_code: status.code(),
                truncated: stdout_over || stderr_over,
                duration_ms: started.elapsed().as_millis() as u64,
            };
            if !output.success() {
                debug!(program = %plan.program(), exit_code = ?output.exit_code, "Command exited non-zero");
            }
            Ok(output)
        }
        Err(_) => {
            warn!(program = %plan.program(), timeout_secs = timeout.as_secs(), "Command timed out; killing process group");
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(ExecError::Timeout {
                secs: timeout.as_secs(),
            })
        }
    }
}

/// Read a stream to EOF keeping at most `limit` bytes. The rest is drained
/// so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut exceeded = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                if n > room {
                    exceeded = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, exceeded)
}

#[cfg(unix)]
#[allow(clippy::cast_possible_wrap)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!(pid, error = %e, "Failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}
