//! SSH local-forward tunnel supervision.
//!
//! A [`TunnelHandle`] owns one `ssh -N -L` child process and the local port it
//! forwards. Dropping a handle kills the child and releases the port claim, so a
//! tunnel can never outlive the scope that opened it; [`TunnelHandle::close`]
//! is the graceful path.

use std::collections::HashSet;
use std::future::Future;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::system::{terminate_child, PortGuard};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel on local port {port} was not established: {diagnostics}")]
    EstablishmentFailed { port: u16, diagnostics: String },

    #[error("local port {0} is already owned by a live tunnel")]
    PortBusy(u16),

    #[error("failed to spawn tunnel process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Lifecycle of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Starting,
    Ready,
    Terminating,
    Closed,
    Failed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

type PortRegistry = Arc<Mutex<HashSet<u16>>>;

/// Claim on a local port inside one manager. Released on drop.
#[derive(Debug)]
struct PortClaim {
    port: u16,
    registry: PortRegistry,
}

impl PortClaim {
    fn acquire(registry: &PortRegistry, port: u16) -> Result<Self, TunnelError> {
        let mut owned = registry.lock().unwrap_or_else(|e| e.into_inner());
        if !owned.insert(port) {
            return Err(TunnelError::PortBusy(port));
        }
        Ok(Self {
            port,
            registry: Arc::clone(registry),
        })
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        let mut owned = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        owned.remove(&self.port);
    }
}

/// A live local forward.
#[derive(Debug)]
pub struct TunnelHandle {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    child: Child,
    state: TunnelState,
    terminate_grace: Duration,
    _claim: PortClaim,
}

impl TunnelHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the forwarding process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the forward: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// Safe when the process has already exited.
    pub async fn close(mut self) -> TunnelState {
        self.transition(TunnelState::Terminating);
        terminate_child(&mut self.child, self.terminate_grace).await;
        self.transition(TunnelState::Closed);
        info!(
            local_port = self.local_port,
            remote_host = %self.remote_host,
            "tunnel closed"
        );
        self.state
    }

    fn transition(&mut self, next: TunnelState) {
        debug!(
            local_port = self.local_port,
            from = %self.state,
            to = %next,
            "tunnel state change"
        );
        self.state = next;
    }
}

/// Opens and supervises local-forward tunnels.
#[derive(Debug, Clone)]
pub struct TunnelManager {
    ssh_program: String,
    ssh_prefix_args: Vec<String>,
    forward_host: String,
    ready_timeout: Duration,
    terminate_grace: Duration,
    guard: PortGuard,
    owned: PortRegistry,
}

impl TunnelManager {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            ssh_program: config.ssh_binary.clone(),
            ssh_prefix_args: Vec::new(),
            forward_host: config.forward_host.clone(),
            ready_timeout: config.ready_timeout(),
            terminate_grace: config.terminate_grace(),
            guard: PortGuard::from_config(config),
            owned: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Replace the ssh executable, placing `prefix_args` before the forward arguments.
    pub fn with_ssh_command(mut self, program: impl Into<String>, prefix_args: Vec<String>) -> Self {
        self.ssh_program = program.into();
        self.ssh_prefix_args = prefix_args;
        self
    }

    pub fn with_port_guard(mut self, guard: PortGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Local ports currently owned by live handles from this manager.
    pub fn owned_ports(&self) -> Vec<u16> {
        let owned = self.owned.lock().unwrap_or_else(|e| e.into_inner());
        let mut ports: Vec<u16> = owned.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Start `ssh -N -L local_port:<forward_host>:remote_port remote_host` and
    /// wait for the local port to accept connections.
    pub async fn open(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle, TunnelError> {
        let claim = PortClaim::acquire(&self.owned, local_port)?;
        debug!(local_port, from = %TunnelState::Idle, to = %TunnelState::Starting, "tunnel state change");

        let cleared = self.guard.ensure_free(local_port).await;
        if !cleared.is_empty() {
            info!(local_port, pids = ?cleared, "cleared stale listeners before opening tunnel");
        }

        let forward = format!("{}:{}:{}", local_port, self.forward_host, remote_port);
        info!(local_port, remote_host, remote_port, "opening tunnel");

        let mut child = Command::new(&self.ssh_program)
            .args(&self.ssh_prefix_args)
            .arg("-N")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-L")
            .arg(&forward)
            .arg(remote_host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TunnelError::Spawn)?;
        let stderr = child.stderr.take();

        let exited_early = tokio::select! {
            status = child.wait() => Some(status),
            ready = self.guard.wait_for_open(local_port, self.ready_timeout) => {
                if ready {
                    None
                } else {
                    terminate_child(&mut child, self.terminate_grace).await;
                    let diagnostics = collect_stderr(stderr, self.terminate_grace).await;
                    return Err(self.failed(local_port, format!(
                        "port did not open within {:.1}s{}",
                        self.ready_timeout.as_secs_f64(),
                        with_detail(&diagnostics),
                    )));
                }
            }
        };

        if let Some(status) = exited_early {
            let diagnostics = collect_stderr(stderr, self.terminate_grace).await;
            let code = status.ok().and_then(|s| s.code());
            return Err(self.failed(
                local_port,
                format!("tunnel process exited with code {:?}{}", code, with_detail(&diagnostics)),
            ));
        }

        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(local_port, stderr));
        }

        info!(local_port, remote_host, remote_port, pid = child.id(), "tunnel ready");
        let mut handle = TunnelHandle {
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            child,
            state: TunnelState::Starting,
            terminate_grace: self.terminate_grace,
            _claim: claim,
        };
        handle.transition(TunnelState::Ready);
        Ok(handle)
    }

    /// Run `f` with an open tunnel and close it afterwards, whatever `f` returns.
    ///
    /// If `f` panics the handle is dropped, which kills the child and releases
    /// the port claim.
    pub async fn with_tunnel<F, Fut, T>(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        f: F,
    ) -> Result<T, TunnelError>
    where
        F: FnOnce(u16) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.open(local_port, remote_host, remote_port).await?;
        let output = f(handle.local_port()).await;
        handle.close().await;
        Ok(output)
    }

    fn failed(&self, port: u16, diagnostics: String) -> TunnelError {
        warn!(
            local_port = port,
            from = %TunnelState::Starting,
            to = %TunnelState::Failed,
            diagnostics = %diagnostics,
            "tunnel establishment failed"
        );
        TunnelError::EstablishmentFailed { port, diagnostics }
    }
}

fn with_detail(diagnostics: &str) -> String {
    if diagnostics.is_empty() {
        String::new()
    } else {
        format!(": {}", diagnostics)
    }
}

async fn collect_stderr(stderr: Option<ChildStderr>, limit: Duration) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(limit, stderr.read_to_end(&mut buf)).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

async fn drain_stderr(local_port: u16, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(local_port, line = %line, "tunnel stderr");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn manager_with_script(script: &str, ready_timeout: Duration) -> TunnelManager {
        let config = TunnelConfig {
            ready_timeout_secs: 1,
            poll_interval_ms: 50,
            terminate_grace_ms: 200,
            release_grace_ms: 10,
            ..TunnelConfig::default()
        };
        let mut manager = TunnelManager::new(&config).with_ssh_command(
            "/bin/sh",
            vec!["-c".to_string(), script.to_string(), "fake-ssh".to_string()],
        );
        manager.ready_timeout = ready_timeout;
        manager
    }

    #[tokio::test]
    async fn test_open_reports_early_exit_with_diagnostics() {
        let manager = manager_with_script(
            "echo 'bind [127.0.0.1]:6001: Address already in use' >&2; exit 255",
            Duration::from_secs(5),
        );
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let err = manager.open(port, "simw01", 5432).await.unwrap_err();
        match err {
            TunnelError::EstablishmentFailed { port: p, diagnostics } => {
                assert_eq!(p, port);
                assert!(diagnostics.contains("Address already in use"), "{diagnostics}");
                assert!(diagnostics.contains("255"), "{diagnostics}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.owned_ports().is_empty());
    }

    #[tokio::test]
    async fn test_open_times_out_when_port_never_binds() {
        let manager = manager_with_script("exec sleep 30", Duration::from_millis(300));
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let err = manager.open(port, "simw01", 5432).await.unwrap_err();
        assert!(matches!(err, TunnelError::EstablishmentFailed { .. }));
        assert!(err.to_string().contains("did not open"));
        assert!(manager.owned_ports().is_empty());
    }

    #[tokio::test]
    async fn test_ready_handle_owns_port_until_closed() {
        // Our own listener stands in for the forward; the port guard never kills this process.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager_with_script("exec sleep 30", Duration::from_secs(2));

        let mut handle = manager.open(port, "simw01", 5432).await.unwrap();
        assert_eq!(handle.state(), TunnelState::Ready);
        assert_eq!(handle.local_port(), port);
        assert_eq!(handle.remote_host(), "simw01");
        assert!(handle.is_alive());
        assert_eq!(manager.owned_ports(), vec![port]);

        let second = manager.open(port, "simw01", 5432).await;
        assert!(matches!(second, Err(TunnelError::PortBusy(p)) if p == port));

        assert_eq!(handle.close().await, TunnelState::Closed);
        assert!(manager.owned_ports().is_empty());
    }

    #[tokio::test]
    async fn test_close_after_process_exited() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager_with_script("sleep 0.2", Duration::from_secs(2));

        let mut handle = manager.open(port, "simw01", 5432).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!handle.is_alive());
        assert_eq!(handle.close().await, TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_with_tunnel_always_releases() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = manager_with_script("exec sleep 30", Duration::from_secs(2));

        let seen = manager
            .with_tunnel(port, "simw01", 5432, |local| async move { local })
            .await
            .unwrap();
        assert_eq!(seen, port);
        assert!(manager.owned_ports().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = TunnelConfig {
            ssh_binary: "/nonexistent/ssh-for-tests".to_string(),
            release_grace_ms: 10,
            ..TunnelConfig::default()
        };
        let manager = TunnelManager::new(&config);
        let err = manager.open(1, "simw01", 5432).await.unwrap_err();
        assert!(matches!(err, TunnelError::Spawn(_)));
        assert!(manager.owned_ports().is_empty());
    }
}
