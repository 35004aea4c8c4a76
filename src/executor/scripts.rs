//! Post-execution scripts.
//!
//! Scripts run after the browser tests with the same environment contract. A
//! script fails if its exit code is non-zero or if its output mentions `FAIL`
//! or `Error:`; either signal alone is enough and neither overrides the other.

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::{error, info, warn};

use super::logfile;
use super::{EnvironmentName, ExecError, ExtraEnv, TestOutcome, ENV_BASE_URL, ENV_TEST_ENV_NAME};
use crate::classify::TestStatus;
use crate::config::HarnessConfig;
use crate::system::process::{run_captured, ExternalProcessResult};

/// Case-sensitive keywords that fail a script regardless of its exit code.
pub const SCRIPT_FAILURE_KEYWORDS: [&str; 2] = ["FAIL", "Error:"];

const STDERR_SEPARATOR: &str = "\n--- STDERR ---\n";

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: String,
    project_root: PathBuf,
    logs_root: PathBuf,
    timeout: Duration,
    terminate_grace: Duration,
}

impl ScriptRunner {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            interpreter: config.scripts.interpreter.clone(),
            project_root: config.paths.project_root.clone(),
            logs_root: config.paths.logs_dir(),
            timeout: config.scripts.timeout(),
            terminate_grace: config.scripts.terminate_grace(),
        }
    }

    /// Run `scripts` in order. Missing scripts are skipped with a warning.
    pub async fn run_all(
        &self,
        scripts: &[String],
        project: &str,
        target_url: &str,
    ) -> Result<Vec<TestOutcome>, ExecError> {
        self.run_all_with_env(scripts, project, target_url, &[]).await
    }

    /// [`run_all`](Self::run_all) with `extra_env` set on every script.
    pub async fn run_all_with_env(
        &self,
        scripts: &[String],
        project: &str,
        target_url: &str,
        extra_env: ExtraEnv<'_>,
    ) -> Result<Vec<TestOutcome>, ExecError> {
        if scripts.is_empty() {
            return Ok(Vec::new());
        }

        let log_dir = self.logs_root.join(project);
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|source| ExecError::LogDir {
                path: log_dir.clone(),
                source,
            })?;

        let env_name = EnvironmentName::from_url(target_url);
        let mut outcomes = Vec::with_capacity(scripts.len());

        for script in scripts {
            let script_path = self.project_root.join(script);
            if !script_path.exists() {
                warn!(project, script = %script, "post-execution script not found, skipping");
                continue;
            }

            info!(project, script = %script, env = %env_name, "running post-execution script");
            let mut cmd = Command::new(&self.interpreter);
            cmd.arg(&script_path)
                .current_dir(&self.project_root)
                .env(ENV_BASE_URL, target_url)
                .env(ENV_TEST_ENV_NAME, env_name.as_str())
                .env("PYTHONIOENCODING", "utf-8")
                .envs(extra_env.iter().map(|(k, v)| (*k, v.as_str())));

            let (status, output) = match run_captured(cmd, self.timeout, self.terminate_grace).await {
                Ok(result) => (classify_script(&result), script_output(&result, self.timeout)),
                Err(e) => {
                    error!(script = %script, error = %e, "failed to start script");
                    (
                        TestStatus::Fail,
                        format!("Error: failed to start '{}': {}\n", self.interpreter, e),
                    )
                }
            };
            info!(project, script = %script, status = %status, "script finished");

            let log_name = logfile::script_log_name(script);
            let log_path = log_dir.join(&log_name);
            tokio::fs::write(
                &log_path,
                logfile::script_log_contents(script, status, target_url, &output),
            )
            .await
            .map_err(|source| ExecError::WriteLog {
                path: log_path.clone(),
                source,
            })?;

            outcomes.push(TestOutcome {
                test_id: script.clone(),
                status,
                output,
                log_path,
                log_ref: logfile::log_ref(project, &log_name),
            });
        }

        Ok(outcomes)
    }
}

/// FAIL when the script did not exit 0, or when stdout or stderr carries a
/// failure keyword.
pub fn classify_script(result: &ExternalProcessResult) -> TestStatus {
    if !result.success() {
        return TestStatus::Fail;
    }
    let mentions_failure = SCRIPT_FAILURE_KEYWORDS
        .iter()
        .any(|kw| result.stdout.contains(kw) || result.stderr.contains(kw));
    if mentions_failure {
        TestStatus::Fail
    } else {
        TestStatus::Pass
    }
}

fn script_output(result: &ExternalProcessResult, timeout: Duration) -> String {
    let mut output = result.stdout.clone();
    if !result.stderr.is_empty() {
        output.push_str(STDERR_SEPARATOR);
        output.push_str(&result.stderr);
    }
    if result.timed_out {
        output.push_str(&format!(
            "\nTest timeout: script did not finish within {}s\n",
            timeout.as_secs()
        ));
    }
    output
}
