//! Spawned-process helpers.
//!
//! Every external executable the harness runs (ssh, test runners, post-execution
//! scripts) is reduced to an [`ExternalProcessResult`]. Classification code only
//! ever sees that value, never a live process.

use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Captured result of one external process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExternalProcessResult {
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExternalProcessResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawn `command`, capture stdout and stderr separately, and wait at most
/// `timeout` for it to exit.
///
/// On timeout the child is terminated with [`terminate_child`] and the
/// result is flagged `timed_out`; whatever output arrived before that is kept.
pub async fn run_captured(
    mut command: Command,
    timeout: Duration,
    grace: Duration,
) -> std::io::Result<ExternalProcessResult> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout_task = tokio::spawn(read_to_string(child.stdout.take()));
    let stderr_task = tokio::spawn(read_to_string(child.stderr.take()));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!(
                pid = child.id(),
                timeout_sec = timeout.as_secs_f64(),
                "process exceeded its timeout, terminating"
            );
            terminate_child(&mut child, grace).await;
            (None, true)
        }
    };

    // A grandchild can keep the pipes open after the direct child is gone.
    let drain = if timed_out { grace } else { timeout };
    let stdout = tokio::time::timeout(drain, stdout_task)
        .await
        .ok()
        .and_then(|joined| joined.ok())
        .unwrap_or_default();
    let stderr = tokio::time::timeout(drain, stderr_task)
        .await
        .ok()
        .and_then(|joined| joined.ok())
        .unwrap_or_default();

    Ok(ExternalProcessResult {
        exit_code,
        stdout,
        stderr,
        timed_out,
    })
}

async fn read_to_string<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!(error = %e, "error reading child output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Gracefully terminate a child process.
///
/// Sends SIGTERM, waits up to `grace`, then SIGKILLs. Calling this on a child
/// that already exited is a no-op.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(exit_code = status.code(), "child already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "could not poll child status before termination");
        }
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "child exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for child after SIGTERM");
        }
        Err(_) => {
            warn!("child did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL child");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let result = run_captured(
            sh("echo out; echo err 1>&2; exit 3"),
            Duration::from_secs(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(!result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_success_requires_zero_exit() {
        let result = run_captured(sh("true"), Duration::from_secs(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_timeout_terminates_child() {
        let started = Instant::now();
        let result = run_captured(
            sh("echo started; exec sleep 30"),
            Duration::from_millis(300),
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(result.stdout.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_io_error() {
        let cmd = Command::new("/nonexistent/binary/for/pricing-e2e");
        let result = run_captured(cmd, Duration::from_secs(1), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_terminate_escalates_when_sigterm_is_ignored() {
        use std::os::unix::process::ExitStatusExt;
        use tokio::io::AsyncBufReadExt;

        let mut child = sh("trap '' TERM; echo ready; exec sleep 30")
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut lines = tokio::io::BufReader::new(child.stdout.take().unwrap()).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("ready"));

        let grace = Duration::from_millis(300);
        let started = Instant::now();
        terminate_child(&mut child, grace).await;
        let elapsed = started.elapsed();

        let status = child.try_wait().unwrap().expect("child was reaped");
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert!(elapsed >= grace, "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_terminate_stops_cooperative_child_with_sigterm() {
        use std::os::unix::process::ExitStatusExt;

        let mut child = sh("exec sleep 30").kill_on_drop(true).spawn().unwrap();
        terminate_child(&mut child, Duration::from_secs(5)).await;
        let status = child.try_wait().unwrap().expect("child was reaped");
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_terminate_already_exited_child() {
        let mut child = sh("exit 0").kill_on_drop(true).spawn().unwrap();
        child.wait().await.unwrap();
        terminate_child(&mut child, Duration::from_millis(100)).await;
    }
}
