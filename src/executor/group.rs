//! Sequential execution of a group of browser test files.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::logfile;
use super::{EnvironmentName, ExecError, ExtraEnv, TestOutcome, ENV_BASE_URL, ENV_TEST_ENV_NAME};
use crate::classify::TestStatus;
use crate::config::{HarnessConfig, RunnerConfig};
use crate::system::{terminate_child, ExternalProcessResult};

/// Placeholder in runner arguments replaced by the test file path.
pub const TEST_PLACEHOLDER: &str = "{test}";

/// Runs test files one at a time and writes their logs.
#[derive(Debug, Clone)]
pub struct TestExecutor {
    runner: RunnerConfig,
    project_root: PathBuf,
    tests_dir: PathBuf,
    logs_root: PathBuf,
    terminate_grace: Duration,
}

impl TestExecutor {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            runner: config.runner.clone(),
            project_root: config.paths.project_root.clone(),
            tests_dir: config.paths.tests_dir(),
            logs_root: config.paths.logs_dir(),
            terminate_grace: config.runner.terminate_grace(),
        }
    }

    pub fn project_log_dir(&self, project: &str) -> PathBuf {
        self.logs_root.join(project)
    }

    /// Run `test_files` in order against `target_url`.
    ///
    /// An empty list returns immediately without touching the filesystem.
    /// Files that do not exist are skipped; every other file yields exactly one
    /// outcome and one log, even when the runner cannot be started or times out.
    pub async fn run_group(
        &self,
        test_files: &[String],
        project: &str,
        target_url: &str,
    ) -> Result<Vec<TestOutcome>, ExecError> {
        self.run_group_with_env(test_files, project, target_url, &[]).await
    }

    /// [`run_group`](Self::run_group) with `extra_env` set on every test process.
    pub async fn run_group_with_env(
        &self,
        test_files: &[String],
        project: &str,
        target_url: &str,
        extra_env: ExtraEnv<'_>,
    ) -> Result<Vec<TestOutcome>, ExecError> {
        if test_files.is_empty() {
            info!(project, "no test files configured, nothing to run");
            return Ok(Vec::new());
        }

        let log_dir = self.project_log_dir(project);
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|source| ExecError::LogDir {
                path: log_dir.clone(),
                source,
            })?;

        let env_name = EnvironmentName::from_url(target_url);
        let mut outcomes = Vec::with_capacity(test_files.len());
        let mut combined = String::new();

        for test_file in test_files {
            let test_path = self.tests_dir.join(test_file);
            if !test_path.exists() {
                error!(project, test_file = %test_file, path = %test_path.display(), "test file not found, skipping");
                continue;
            }

            info!(project, test_file = %test_file, env = %env_name, "running test");
            let (status, output) = match self.spawn_and_stream(&test_path, target_url, env_name, extra_env).await {
                Ok(result) => (self.classify(&result), render_output(&result, self.runner.timeout())),
                Err(e) => {
                    error!(test_file = %test_file, error = %e, "failed to start test runner");
                    (
                        TestStatus::Fail,
                        format!("Error: failed to start test runner '{}': {}\n", self.runner.program, e),
                    )
                }
            };
            info!(project, test_file = %test_file, status = %status, "test finished");

            let log_name = logfile::test_log_name(test_file);
            let log_path = log_dir.join(&log_name);
            write_log(
                &log_path,
                &logfile::test_log_contents(test_file, status, target_url, &output),
            )
            .await?;
            combined.push_str(&logfile::combined_entry(test_file, status, &output));

            outcomes.push(TestOutcome {
                test_id: test_file.clone(),
                status,
                output,
                log_path,
                log_ref: logfile::log_ref(project, &log_name),
            });
        }

        let combined_path = log_dir.join(logfile::combined_log_name(project));
        write_log(&combined_path, &combined).await?;

        Ok(outcomes)
    }

    /// PASS when the pass marker occurs anywhere in the output, ignoring case.
    /// The exit code is not consulted; a timeout is always FAIL.
    pub fn classify(&self, result: &ExternalProcessResult) -> TestStatus {
        if result.timed_out {
            return TestStatus::Fail;
        }
        classify_test_output(&result.stdout, &self.runner.pass_marker)
    }

    fn command_for(
        &self,
        test_path: &Path,
        target_url: &str,
        env_name: EnvironmentName,
        extra_env: ExtraEnv<'_>,
    ) -> Command {
        let test_arg = test_path.to_string_lossy();
        let mut cmd = Command::new(&self.runner.program);
        cmd.args(
            self.runner
                .args
                .iter()
                .map(|arg| arg.replace(TEST_PLACEHOLDER, &test_arg)),
        )
        .current_dir(&self.project_root)
        .env(ENV_BASE_URL, target_url)
        .env(ENV_TEST_ENV_NAME, env_name.as_str())
        .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())));
        cmd
    }

    /// Spawn the runner and merge stdout and stderr in arrival order.
    async fn spawn_and_stream(
        &self,
        test_path: &Path,
        target_url: &str,
        env_name: EnvironmentName,
        extra_env: ExtraEnv<'_>,
    ) -> std::io::Result<ExternalProcessResult> {
        let mut cmd = self.command_for(test_path, target_url, env_name, extra_env);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let deadline = Instant::now() + self.runner.timeout();
        let mut echo = self.runner.echo_output.then(tokio::io::stdout);
        let mut merged = String::new();
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(chunk)) => {
                    if let Some(out) = echo.as_mut() {
                        let _ = out.write_all(chunk.as_bytes()).await;
                        let _ = out.flush().await;
                    }
                    merged.push_str(&chunk);
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let exit_code = if timed_out {
            None
        } else {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(status) => status?.code(),
                Err(_) => {
                    timed_out = true;
                    None
                }
            }
        };

        if timed_out {
            warn!(
                test = %test_path.display(),
                timeout_sec = self.runner.timeout_secs,
                "test exceeded its timeout, terminating"
            );
            terminate_child(&mut child, self.terminate_grace).await;
            while let Ok(chunk) = rx.try_recv() {
                merged.push_str(&chunk);
            }
        }

        Ok(ExternalProcessResult {
            exit_code,
            stdout: merged,
            stderr: String::new(),
            timed_out,
        })
    }
}

/// Case-insensitive substring check for the pass marker.
pub fn classify_test_output(output: &str, pass_marker: &str) -> TestStatus {
    if output.to_lowercase().contains(&pass_marker.to_lowercase()) {
        TestStatus::Pass
    } else {
        TestStatus::Fail
    }
}

fn render_output(result: &ExternalProcessResult, timeout: Duration) -> String {
    if result.timed_out {
        format!(
            "{}\nTest timeout: runner did not finish within {}s\n",
            result.stdout,
            timeout.as_secs()
        )
    } else {
        result.stdout.clone()
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
        }
    }
}

async fn write_log(path: &Path, contents: &str) -> Result<(), ExecError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| ExecError::WriteLog {
            path: path.to_path_buf(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
