//! Execution channel - transport to one running sandbox instance.
//!
//! A channel runs commands and moves file bytes in and out of the guest.
//! No policy lives here: retries, serialization and warm-pool decisions are
//! all manager-level concerns layered on top of raw transport failures.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::SandboxError;

/// Outcome of one command execution inside a guest.
///
/// A guest-enforced timeout yields `timed_out = true` with exit code -1;
/// this is deliberately distinct from both an error and a non-zero exit.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: f64,
}

/// Bidirectional command/data channel to one running isolated environment.
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// Run a command, capturing stdout/stderr/exit code. Exceeding `timeout`
    /// terminates the in-guest process and reports a timed-out result.
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecResult, SandboxError>;

    /// Byte-exact copy into the guest at `remote_path`.
    async fn put(&self, bytes: &[u8], remote_path: &str) -> Result<(), SandboxError>;

    /// Byte-exact copy out of the guest.
    async fn get(&self, remote_path: &str) -> Result<Vec<u8>, SandboxError>;
}

/// Spawn a child process and wait for it with a hard deadline.
///
/// On timeout the child is killed before returning, so no orphaned process
/// outlives the call. Partial output captured before the kill is preserved.
pub(crate) async fn run_child_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<ExecResult, SandboxError> {
    let start = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::Execution(format!("failed to spawn process: {e}")))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Execution("stdout pipe missing".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandboxError::Execution("stderr pipe missing".to_string()))?;

    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();

    let waited = tokio::time::timeout(timeout, async {
        let (out_res, err_res, status) = tokio::join!(
            stdout.read_to_end(&mut out_buf),
            stderr.read_to_end(&mut err_buf),
            child.wait(),
        );
        out_res?;
        err_res?;
        status
    })
    .await;

    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

    match waited {
        Ok(Ok(status)) => Ok(ExecResult {
            stdout: String::from_utf8_lossy(&out_buf).into_owned(),
            stderr: String::from_utf8_lossy(&err_buf).into_owned(),
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
            duration_ms,
        }),
        Ok(Err(e)) => Err(SandboxError::Execution(format!("process wait failed: {e}"))),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(ExecResult {
                stdout: String::from_utf8_lossy(&out_buf).into_owned(),
                stderr: String::from_utf8_lossy(&err_buf).into_owned(),
                exit_code: -1,
                timed_out: true,
                duration_ms,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");

        let result = run_child_with_timeout(&mut cmd, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn kills_process_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 10");

        let start = Instant::now();
        let result = run_child_with_timeout(&mut cmd, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
