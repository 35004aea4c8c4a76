//! Remote command execution over ssh.
//!
//! Remote workflows are triggered by running curl on a host inside the target
//! environment. The output carries a `HTTP_STATUS:<code>` marker line after the
//! response body, and is checked in layers: transport, marker, status, JSON body,
//! business fields. The first failing layer decides the error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ExpectKind, RemoteConfig, TriggerConfig};
use crate::system::process::{run_captured, ExternalProcessResult};

/// Marker printed by curl's `-w` option in front of the status code.
pub const STATUS_MARKER: &str = "HTTP_STATUS:";

/// Exit code ssh uses for its own failures, as opposed to the remote command's.
pub const SSH_FAILURE_EXIT: i32 = 255;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote invocation did not complete: {0}")]
    TransportFailure(String),

    #[error("response is incomplete: no HTTP_STATUS marker or no HTTP response received")]
    MalformedResponse,

    #[error("remote service rejected the request with status {0}")]
    RemoteRejected(u16),

    #[error("response body is not valid JSON: {0}")]
    InvalidPayload(String),

    #[error("business response is incomplete: {0}")]
    IncompleteBusinessResponse(String),
}

/// How far into the response the checks go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseExpectation {
    /// Transport, marker and 2xx status.
    StatusOnly,
    /// Everything in `StatusOnly` plus a JSON body with a usable `responseList`.
    BusinessPayload,
}

impl From<ExpectKind> for ResponseExpectation {
    fn from(kind: ExpectKind) -> Self {
        match kind {
            ExpectKind::Status => Self::StatusOnly,
            ExpectKind::Business => Self::BusinessPayload,
        }
    }
}

/// Parsed outcome of a successful remote invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteCommandResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub http_status: Option<u16>,
    pub body: Option<Value>,
}

/// Carries one command to a host and back.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn execute(&self, host: &str, command: &str) -> std::io::Result<ExternalProcessResult>;
}

/// Runs commands through the system `ssh` client in batch mode.
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_program: String,
    prefix_args: Vec<String>,
    connect_timeout_secs: u64,
    timeout: Duration,
}

impl SshTransport {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            ssh_program: config.ssh_binary.clone(),
            prefix_args: Vec::new(),
            connect_timeout_secs: config.connect_timeout_secs,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Replace the ssh executable, placing `prefix_args` before the ssh options.
    pub fn with_ssh_command(mut self, program: impl Into<String>, prefix_args: Vec<String>) -> Self {
        self.ssh_program = program.into();
        self.prefix_args = prefix_args;
        self
    }
}

#[async_trait]
impl CommandTransport for SshTransport {
    async fn execute(&self, host: &str, command: &str) -> std::io::Result<ExternalProcessResult> {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.args(&self.prefix_args)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg(host)
            .arg(command);
        debug!(host, command, "running remote command");
        run_captured(cmd, self.timeout, Duration::from_secs(2)).await
    }
}

/// Executes remote commands with bounded retries on incomplete responses.
#[derive(Clone)]
pub struct RemoteCommandRunner {
    transport: Arc<dyn CommandTransport>,
    default_retries: u32,
    default_interval: Duration,
}

impl std::fmt::Debug for RemoteCommandRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommandRunner")
            .field("default_retries", &self.default_retries)
            .field("default_interval", &self.default_interval)
            .finish_non_exhaustive()
    }
}

impl RemoteCommandRunner {
    pub fn new(config: &RemoteConfig) -> Self {
        Self::with_transport(
            Arc::new(SshTransport::new(config)),
            config.retries,
            Duration::from_secs(config.retry_interval_secs),
        )
    }

    pub fn with_transport(
        transport: Arc<dyn CommandTransport>,
        default_retries: u32,
        default_interval: Duration,
    ) -> Self {
        Self {
            transport,
            default_retries,
            default_interval,
        }
    }

    /// Run `command` on `host`, making at most `attempts` attempts.
    ///
    /// Only [`RemoteError::MalformedResponse`] is retried, after sleeping
    /// `interval`. Every other failure is returned immediately.
    pub async fn run(
        &self,
        host: &str,
        command: &str,
        expectation: ResponseExpectation,
        attempts: u32,
        interval: Duration,
    ) -> Result<RemoteCommandResult, RemoteError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match self.transport.execute(host, command).await {
                Ok(result) => parse_response(&result, expectation),
                Err(e) => Err(RemoteError::TransportFailure(e.to_string())),
            };

            match outcome {
                Err(RemoteError::MalformedResponse) if attempt < attempts => {
                    warn!(
                        host,
                        attempt,
                        attempts,
                        retry_in_sec = interval.as_secs_f64(),
                        "incomplete response from remote command, retrying"
                    );
                    tokio::time::sleep(interval).await;
                    attempt += 1;
                }
                Ok(result) => {
                    info!(host, attempt, http_status = result.http_status, "remote command succeeded");
                    return Ok(result);
                }
                Err(e) => {
                    warn!(host, attempt, error = %e, "remote command failed");
                    return Err(e);
                }
            }
        }
    }

    /// Fire a configured trigger on `host` using the trigger's retry settings,
    /// falling back to the runner defaults.
    pub async fn trigger(
        &self,
        host: &str,
        trigger: &TriggerConfig,
    ) -> Result<RemoteCommandResult, RemoteError> {
        let command = curl_command(trigger)?;
        let attempts = trigger.retries.unwrap_or(self.default_retries);
        let interval = trigger
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_interval);
        info!(trigger = %trigger.name, host, url = %trigger.url, "firing remote trigger");
        self.run(host, &command, trigger.expect.into(), attempts, interval)
            .await
    }
}

/// Build the curl invocation for `trigger`, shell-quoted for the remote shell.
pub fn curl_command(trigger: &TriggerConfig) -> Result<String, RemoteError> {
    let mut parts: Vec<String> = vec![
        "curl".to_string(),
        "-s".to_string(),
        "-X".to_string(),
        quote(&trigger.method),
    ];

    if let Some(body) = &trigger.body {
        let json = serde_json::to_string(body)
            .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
        parts.push("-H".to_string());
        parts.push(quote("Content-Type: application/json"));
        parts.push("-d".to_string());
        parts.push(quote(&json));
    }

    parts.push(quote(&trigger.url));
    parts.push("-w".to_string());
    parts.push(quote(&format!("\\n{}%{{http_code}}", STATUS_MARKER)));
    Ok(parts.join(" "))
}

fn quote(s: &str) -> String {
    shell_escape::escape(s.into()).into_owned()
}

/// Check a captured remote invocation against `expectation`.
///
/// Pure: no I/O, so every layer can be tested from literal output.
pub fn parse_response(
    result: &ExternalProcessResult,
    expectation: ResponseExpectation,
) -> Result<RemoteCommandResult, RemoteError> {
    if result.timed_out {
        return Err(RemoteError::TransportFailure(
            "remote command timed out".to_string(),
        ));
    }

    let marker = split_status(&result.stdout);

    // curl prints code 000 when nothing answered, e.g. a service still warming
    // up. That is an incomplete response whatever curl's exit code is.
    if matches!(marker, Some((_, 0))) && result.exit_code != Some(SSH_FAILURE_EXIT) {
        debug!(exit_code = ?result.exit_code, "remote service sent no HTTP response");
        return Err(RemoteError::MalformedResponse);
    }

    if result.exit_code != Some(0) {
        let detail = result.stderr.trim();
        return Err(RemoteError::TransportFailure(format!(
            "exit code {:?}{}",
            result.exit_code,
            if detail.is_empty() {
                String::new()
            } else {
                format!(": {}", detail)
            }
        )));
    }

    let (body_text, status) = marker.ok_or(RemoteError::MalformedResponse)?;
    if !(200..=299).contains(&status) {
        return Err(RemoteError::RemoteRejected(status));
    }

    let body = match expectation {
        ResponseExpectation::StatusOnly => serde_json::from_str(body_text).ok(),
        ResponseExpectation::BusinessPayload => {
            let value: Value = serde_json::from_str(body_text)
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
            check_business_response(&value)?;
            Some(value)
        }
    };

    Ok(RemoteCommandResult {
        exit_code: result.exit_code,
        stdout: result.stdout.clone(),
        stderr: result.stderr.clone(),
        http_status: Some(status),
        body,
    })
}

/// Split output into the body before the last status marker and the parsed code.
fn split_status(stdout: &str) -> Option<(&str, u16)> {
    let idx = stdout.rfind(STATUS_MARKER)?;
    let code = stdout[idx + STATUS_MARKER.len()..]
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some((stdout[..idx].trim(), code))
}

/// The first `responseList` item must carry no error and both identifiers.
fn check_business_response(value: &Value) -> Result<(), RemoteError> {
    let list = value
        .get("responseList")
        .and_then(Value::as_array)
        .ok_or_else(|| RemoteError::IncompleteBusinessResponse("missing responseList".to_string()))?;
    let first = list
        .first()
        .ok_or_else(|| RemoteError::IncompleteBusinessResponse("responseList is empty".to_string()))?;

    if let Some(error) = first.get("error").filter(|e| !e.is_null()) {
        let message = error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(RemoteError::IncompleteBusinessResponse(format!(
            "first item reports error: {}",
            message
        )));
    }

    for field in ["businessId", "businessStepId"] {
        if first.get(field).map_or(true, Value::is_null) {
            return Err(RemoteError::IncompleteBusinessResponse(format!(
                "first item has no {}",
                field
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn ok_output(stdout: &str) -> ExternalProcessResult {
        ExternalProcessResult {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    struct ScriptedTransport {
        responses: Mutex<VecDeque<std::io::Result<ExternalProcessResult>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<std::io::Result<ExternalProcessResult>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CommandTransport for ScriptedTransport {
        async fn execute(&self, _host: &str, _command: &str) -> std::io::Result<ExternalProcessResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ok_output("")))
        }
    }

    #[test]
    fn test_business_error_item_is_failure() {
        let out = ok_output("{\"responseList\":[{\"error\":\"x\"}]}\nHTTP_STATUS:200");
        let err = parse_response(&out, ResponseExpectation::BusinessPayload).unwrap_err();
        assert!(matches!(err, RemoteError::IncompleteBusinessResponse(_)));
        assert!(err.to_string().contains("x"));
    }

    #[test]
    fn test_business_ids_without_error_is_success() {
        let out = ok_output(
            "{\"responseList\":[{\"businessId\":\"1\",\"businessStepId\":\"2\"}]}\nHTTP_STATUS:200",
        );
        let result = parse_response(&out, ResponseExpectation::BusinessPayload).unwrap();
        assert_eq!(result.http_status, Some(200));
        let body = result.body.unwrap();
        assert_eq!(body["responseList"][0]["businessId"], "1");
    }

    #[test]
    fn test_business_requires_both_identifiers() {
        let out = ok_output("{\"responseList\":[{\"businessId\":\"1\"}]}\nHTTP_STATUS:201");
        let err = parse_response(&out, ResponseExpectation::BusinessPayload).unwrap_err();
        assert!(err.to_string().contains("businessStepId"));

        let out = ok_output("{\"responseList\":[]}\nHTTP_STATUS:200");
        assert!(matches!(
            parse_response(&out, ResponseExpectation::BusinessPayload),
            Err(RemoteError::IncompleteBusinessResponse(_))
        ));
    }

    #[test]
    fn test_null_error_field_is_ignored() {
        let out = ok_output(
            "{\"responseList\":[{\"error\":null,\"businessId\":7,\"businessStepId\":8}]}\nHTTP_STATUS:200",
        );
        assert!(parse_response(&out, ResponseExpectation::BusinessPayload).is_ok());
    }

    #[test]
    fn test_layers_fail_in_order() {
        let transport = ExternalProcessResult {
            exit_code: Some(255),
            stderr: "ssh: connect to host dev-spriced port 22: Connection refused".to_string(),
            ..ok_output("")
        };
        let err = parse_response(&transport, ResponseExpectation::StatusOnly).unwrap_err();
        assert!(matches!(err, RemoteError::TransportFailure(_)));
        assert!(err.to_string().contains("Connection refused"));

        let malformed = ok_output("{\"responseList\":[]}");
        assert!(matches!(
            parse_response(&malformed, ResponseExpectation::BusinessPayload),
            Err(RemoteError::MalformedResponse)
        ));

        let rejected = ok_output("oops\nHTTP_STATUS:500");
        assert!(matches!(
            parse_response(&rejected, ResponseExpectation::BusinessPayload),
            Err(RemoteError::RemoteRejected(500))
        ));

        let invalid = ok_output("<html>nope</html>\nHTTP_STATUS:200");
        assert!(matches!(
            parse_response(&invalid, ResponseExpectation::BusinessPayload),
            Err(RemoteError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_status_only_ignores_body_shape() {
        let out = ok_output("workflow started\nHTTP_STATUS:200");
        let result = parse_response(&out, ResponseExpectation::StatusOnly).unwrap();
        assert_eq!(result.http_status, Some(200));
        assert!(result.body.is_none());
    }

    #[test]
    fn test_timed_out_is_transport_failure() {
        let out = ExternalProcessResult {
            exit_code: None,
            timed_out: true,
            ..ok_output("")
        };
        assert!(matches!(
            parse_response(&out, ResponseExpectation::StatusOnly),
            Err(RemoteError::TransportFailure(_))
        ));
    }

    #[test]
    fn test_curl_command_quotes_body_and_marker() {
        let trigger = TriggerConfig {
            name: "outbound".to_string(),
            url: "http://localhost:8880/platform/api/v1/tml".to_string(),
            method: "POST".to_string(),
            body: Some(serde_json::json!({"entity": "it's", "n": 1})),
            expect: ExpectKind::Business,
            retries: None,
            interval_secs: None,
        };
        let cmd = curl_command(&trigger).unwrap();
        assert!(cmd.starts_with("curl -s -X POST -H 'Content-Type: application/json' -d "));
        assert!(cmd.contains("it'\\''s"), "{cmd}");
        assert!(cmd.ends_with("-w '\\nHTTP_STATUS:%{http_code}'"), "{cmd}");
    }

    #[tokio::test]
    async fn test_retries_only_malformed_responses() {
        let transport = ScriptedTransport::new(vec![
            Ok(ok_output("warming up")),
            Ok(ok_output("still warming up")),
            Ok(ok_output("done\nHTTP_STATUS:200")),
        ]);
        let runner = RemoteCommandRunner::with_transport(transport.clone(), 5, Duration::ZERO);
        let result = runner
            .run("dev-spriced", "curl ...", ResponseExpectation::StatusOnly, 5, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(result.http_status, Some(200));
        assert_eq!(transport.calls(), 3);
    }

    #[test]
    fn test_no_http_response_is_incomplete() {
        let refused = ExternalProcessResult {
            exit_code: Some(7),
            ..ok_output("\nHTTP_STATUS:000")
        };
        assert!(matches!(
            parse_response(&refused, ResponseExpectation::StatusOnly),
            Err(RemoteError::MalformedResponse)
        ));
        assert!(matches!(
            parse_response(&ok_output("\nHTTP_STATUS:000"), ResponseExpectation::BusinessPayload),
            Err(RemoteError::MalformedResponse)
        ));

        let ssh_down = ExternalProcessResult {
            exit_code: Some(255),
            stderr: "ssh: Could not resolve hostname dev-spriced".to_string(),
            ..ok_output("HTTP_STATUS:000")
        };
        assert!(matches!(
            parse_response(&ssh_down, ResponseExpectation::StatusOnly),
            Err(RemoteError::TransportFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_warming_service_is_retried_until_it_answers() {
        let connection_refused = ExternalProcessResult {
            exit_code: Some(7),
            ..ok_output("\nHTTP_STATUS:000")
        };
        let transport = ScriptedTransport::new(vec![
            Ok(connection_refused.clone()),
            Ok(ok_output("\nHTTP_STATUS:000")),
            Ok(ok_output(
                "{\"responseList\":[{\"businessId\":\"9\",\"businessStepId\":\"3\"}]}\nHTTP_STATUS:200",
            )),
        ]);
        let runner = RemoteCommandRunner::with_transport(transport.clone(), 5, Duration::ZERO);
        let result = runner
            .run(
                "dev-spriced",
                "curl ...",
                ResponseExpectation::BusinessPayload,
                5,
                Duration::from_millis(1),
            )
            .await
            .unwrap();
        assert_eq!(result.http_status, Some(200));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_definitive_failure_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            Ok(ok_output("boom\nHTTP_STATUS:503")),
            Ok(ok_output("ok\nHTTP_STATUS:200")),
        ]);
        let runner = RemoteCommandRunner::with_transport(transport.clone(), 5, Duration::ZERO);
        let err = runner
            .run("dev-spriced", "curl ...", ResponseExpectation::StatusOnly, 5, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::RemoteRejected(503)));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let transport = ScriptedTransport::new(vec![
            Ok(ok_output("a")),
            Ok(ok_output("b")),
            Ok(ok_output("c")),
        ]);
        let runner = RemoteCommandRunner::with_transport(transport.clone(), 5, Duration::ZERO);
        let err = runner
            .run("dev-spriced", "curl ...", ResponseExpectation::StatusOnly, 2, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::MalformedResponse));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_transport_io_error() {
        let transport = ScriptedTransport::new(vec![Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "ssh not found",
        ))]);
        let runner = RemoteCommandRunner::with_transport(transport, 5, Duration::ZERO);
        let err = runner
            .run("dev-spriced", "true", ResponseExpectation::StatusOnly, 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::TransportFailure(_)));
    }

    #[tokio::test]
    async fn test_trigger_uses_override_retries() {
        let transport = ScriptedTransport::new(vec![Ok(ok_output("x")), Ok(ok_output("y"))]);
        let runner = RemoteCommandRunner::with_transport(transport.clone(), 5, Duration::ZERO);
        let trigger = TriggerConfig {
            name: "approval".to_string(),
            url: "http://localhost:8085/scheduler/approval2/start".to_string(),
            method: "GET".to_string(),
            body: None,
            expect: ExpectKind::Status,
            retries: Some(1),
            interval_secs: Some(0),
        };
        assert!(runner.trigger("qa-spriced", &trigger).await.is_err());
        assert_eq!(transport.calls(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ssh_transport_passes_batch_options() {
        let config = RemoteConfig {
            connect_timeout_secs: 7,
            timeout_secs: 10,
            ..RemoteConfig::default()
        };
        let transport = SshTransport::new(&config).with_ssh_command(
            "/bin/sh",
            vec!["-c".to_string(), "echo \"$@\"".to_string(), "fake-ssh".to_string()],
        );
        let result = transport.execute("qa-spriced", "uptime").await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(
            result.stdout.trim(),
            "-o BatchMode=yes -o ConnectTimeout=7 qa-spriced uptime"
        );
    }
}
