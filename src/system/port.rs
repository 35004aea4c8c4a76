//! Local TCP port guard.
//!
//! The tunnel's local port is an OS-level shared resource. Before a forward is
//! started, any process already listening on it is killed; after the forward is
//! spawned, the port is polled until it accepts connections.
//!
//! This is not a lock. Two harness processes racing for the same port can still
//! kill each other's forwards; callers must hold a run lease.

use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("listener lookup tool '{tool}' is not available")]
    LookupUnavailable { tool: String },

    #[error("listener lookup failed: {0}")]
    LookupFailed(#[source] std::io::Error),
}

/// Clears and probes loopback ports.
#[derive(Debug, Clone)]
pub struct PortGuard {
    poll_interval: Duration,
    release_grace: Duration,
    lsof_path: String,
}

impl Default for PortGuard {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(1))
    }
}

impl PortGuard {
    pub fn new(poll_interval: Duration, release_grace: Duration) -> Self {
        Self {
            poll_interval,
            release_grace,
            lsof_path: "lsof".to_string(),
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(config.poll_interval(), config.release_grace())
    }

    /// Use a specific `lsof` binary instead of the one on `PATH`.
    pub fn with_lsof(mut self, path: impl Into<String>) -> Self {
        self.lsof_path = path.into();
        self
    }

    /// Process ids listening on `port`, excluding this process.
    pub async fn listening_pids(&self, port: u16) -> Result<Vec<u32>, PortError> {
        let output = Command::new(&self.lsof_path)
            .arg("-t")
            .arg(format!("-iTCP:{}", port))
            .arg("-sTCP:LISTEN")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PortError::LookupUnavailable {
                        tool: self.lsof_path.clone(),
                    }
                } else {
                    PortError::LookupFailed(e)
                }
            })?;

        // lsof exits 1 when nothing matches.
        let own_pid = std::process::id();
        Ok(parse_pids(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect())
    }

    /// Kill whatever is listening on `port` and give the OS time to release it.
    ///
    /// Never fails: a missing lookup tool or an empty port is logged and
    /// treated as nothing to do. Returns the pids that were signalled.
    pub async fn ensure_free(&self, port: u16) -> Vec<u32> {
        let pids = match self.listening_pids(port).await {
            Ok(pids) => pids,
            Err(e) => {
                warn!(port, error = %e, "could not look up listeners, assuming port is free");
                return Vec::new();
            }
        };

        if pids.is_empty() {
            debug!(port, "port is free");
            return pids;
        }

        for pid in &pids {
            info!(port, pid, "killing process holding port");
            kill_pid(*pid);
        }
        tokio::time::sleep(self.release_grace).await;
        pids
    }

    /// Poll `127.0.0.1:port` until a connection succeeds or `timeout` elapses.
    pub async fn wait_for_open(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_open(port).await {
                debug!(port, "port accepted a connection");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(port, timeout_sec = timeout.as_secs_f64(), "port never opened");
                return false;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Single connect attempt against `127.0.0.1:port`.
    pub async fn is_open(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.poll_interval, TcpStream::connect(("127.0.0.1", port))).await,
            Ok(Ok(_))
        )
    }
}

fn parse_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

fn kill_pid(pid: u32) {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            warn!(
                pid,
                error = %std::io::Error::last_os_error(),
                "failed to SIGKILL port holder"
            );
        }
    }
    #[cfg(not(unix))]
    {
        warn!(pid, "killing port holders is only supported on unix");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_guard() -> PortGuard {
        PortGuard::new(Duration::from_millis(50), Duration::from_millis(50))
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_parse_pids() {
        assert_eq!(parse_pids("123\n456\n123\n"), vec![123, 456]);
        assert_eq!(parse_pids(""), Vec::<u32>::new());
        assert_eq!(parse_pids("garbage\n  77 \n"), vec![77]);
    }

    #[tokio::test]
    async fn test_wait_for_open_on_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(fast_guard().wait_for_open(port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_wait_for_open_times_out_with_false() {
        let port = unused_port().await;
        let started = Instant::now();
        let open = fast_guard()
            .wait_for_open(port, Duration::from_millis(300))
            .await;
        assert!(!open);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_for_open_sees_late_listener() {
        let port = unused_port().await;
        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(listener);
        });
        assert!(fast_guard().wait_for_open(port, Duration::from_secs(3)).await);
        opener.abort();
    }

    #[tokio::test]
    async fn test_ensure_free_without_lookup_tool_is_noop() {
        let guard = fast_guard().with_lsof("/nonexistent/lsof-for-tests");
        let port = unused_port().await;
        assert!(guard.ensure_free(port).await.is_empty());
        assert!(matches!(
            guard.listening_pids(port).await,
            Err(PortError::LookupUnavailable { .. })
        ));
    }

    fn tool_available(program: &str, arg: &str) -> bool {
        std::process::Command::new(program)
            .arg(arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ensure_free_kills_foreign_listener_and_releases_port() {
        use std::os::unix::process::ExitStatusExt;
        use tokio::io::AsyncBufReadExt;

        if !tool_available("lsof", "-v") || !tool_available("python3", "--version") {
            eprintln!("lsof or python3 not installed, skipping");
            return;
        }

        let port = unused_port().await;
        let listener = format!(
            "import socket, time\n\
             s = socket.socket()\n\
             s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
             s.bind(('127.0.0.1', {port}))\n\
             s.listen()\n\
             print('listening', flush=True)\n\
             time.sleep(30)\n"
        );
        let mut child = Command::new("python3")
            .arg("-c")
            .arg(&listener)
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut lines = tokio::io::BufReader::new(child.stdout.take().unwrap()).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("listening"));
        let holder = child.id().unwrap();

        let guard = fast_guard();
        assert_eq!(guard.listening_pids(port).await.unwrap(), vec![holder]);

        let killed = guard.ensure_free(port).await;
        assert_eq!(killed, vec![holder]);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert!(!guard.is_open(port).await);
        assert!(guard.listening_pids(port).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_free_never_kills_own_process() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let killed = fast_guard().ensure_free(port).await;
        assert!(killed.is_empty());
        assert!(fast_guard().is_open(port).await);
    }
}
