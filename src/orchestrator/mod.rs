//! One orchestration run: purge logs, clear history, run tests and scripts,
//! classify, persist.
//!
//! Runs are serialized by a lease held for the whole run. The log directory,
//! the history table and the tunnel port are single-writer resources, so a
//! second caller waits instead of interleaving with the first.
//!
//! A flow is a run that holds the database tunnel open while its checks, its
//! remote trigger and its follow-up tests execute. Each step leaves a log, so
//! the classifier stays the single source of the run's status.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::classify::{ClassifiedTest, OutcomeClassifier, ProjectClassification, TestStatus};
use crate::config::{ConfigError, FlowConfig, HarnessConfig, ResolvedEnvironment, TriggerConfig};
use crate::executor::{logfile, ExecError, ScriptRunner, TestExecutor, ENV_DB_PORT};
use crate::remote::{RemoteCommandResult, RemoteCommandRunner, RemoteError, TunnelManager};
use crate::storage::{self, FailedTest, HistoryError, HistoryStore, NewExecution};

/// Result of [`Orchestrator::execute`]. Always produced, even when the run
/// could not complete; `error` then says why.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub project_status: TestStatus,
    pub tests: Vec<ClassifiedTest>,
    pub platform: String,
    pub execution_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    fn aborted(platform: String, error: &anyhow::Error) -> Self {
        Self {
            project_status: TestStatus::Fail,
            tests: Vec::new(),
            platform,
            execution_id: None,
            error: Some(format!("{:#}", error)),
        }
    }

    pub fn failed_tests(&self) -> impl Iterator<Item = &ClassifiedTest> {
        self.tests.iter().filter(|t| !t.status.is_pass())
    }
}

/// Result of [`Orchestrator::execute_flow`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowReport {
    pub flow: String,
    #[serde(flatten)]
    pub run: RunReport,
    /// Local port of the tunnel, when it came up.
    pub tunnel_port: Option<u16>,
    /// Parsed trigger response, when the trigger succeeded.
    pub trigger: Option<RemoteCommandResult>,
    /// Follow-up tests did not run because an earlier step failed.
    pub tests_skipped: bool,
    /// `tunnel: ...` or `trigger: ...` for the step that stopped the flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
}

#[derive(Debug, Default)]
struct FlowProgress {
    tunnel_port: Option<u16>,
    trigger: Option<RemoteCommandResult>,
    tests_ran: bool,
    failed_step: Option<String>,
}

/// What happened while the tunnel was open.
struct TunnelSteps {
    port: u16,
    trigger: Result<RemoteCommandResult, RemoteError>,
    tests_ran: bool,
}

/// Label shown for an environment key: `cdbu_dev` -> `CDBU DEV`.
pub fn platform_label(env_key: &str) -> String {
    env_key.to_uppercase().replace('_', " ")
}

pub struct Orchestrator {
    config: Arc<HarnessConfig>,
    executor: TestExecutor,
    scripts: ScriptRunner,
    classifier: OutcomeClassifier,
    history: HistoryStore,
    tunnels: TunnelManager,
    remote: RemoteCommandRunner,
    lease: Mutex<()>,
}

impl Orchestrator {
    pub fn new(config: Arc<HarnessConfig>, history: HistoryStore) -> Self {
        Self {
            executor: TestExecutor::new(&config),
            scripts: ScriptRunner::new(&config),
            classifier: OutcomeClassifier::standard(config.paths.logs_dir()),
            history,
            tunnels: TunnelManager::new(&config.tunnel),
            remote: RemoteCommandRunner::new(&config.remote),
            config,
            lease: Mutex::new(()),
        }
    }

    /// Open the history database named in the config and build an orchestrator.
    ///
    /// Fails when the database cannot be opened or initialized.
    pub fn open(config: Arc<HarnessConfig>) -> Result<Self> {
        let db_path = config.paths.database();
        info!(db_path = %db_path.display(), "initializing execution history");
        let pool = storage::open_pool(&db_path)?;
        let history = HistoryStore::new(pool);
        history
            .initialize()
            .context("failed to initialize execution history")?;
        Ok(Self::new(config, history))
    }

    /// Replace the tunnel manager and remote runner used by flows.
    pub fn with_remote(mut self, tunnels: TunnelManager, remote: RemoteCommandRunner) -> Self {
        self.tunnels = tunnels;
        self.remote = remote;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn classifier(&self) -> &OutcomeClassifier {
        &self.classifier
    }

    /// Delete all history once no run is in progress.
    pub async fn clear_history(&self) -> Result<usize, HistoryError> {
        let _lease = self.lease.lock().await;
        self.history.clear()
    }

    /// Run a configured project. `env_key` defaults to the project's environment.
    pub async fn execute_project(
        &self,
        project_key: &str,
        env_key: Option<&str>,
    ) -> Result<RunReport, ConfigError> {
        let project = self.config.project(project_key)?.clone();
        let env_key = env_key.unwrap_or(&project.environment);
        Ok(self
            .execute(&project.name, &project.test_files, env_key)
            .await)
    }

    /// Run `test_files` for `project_name` against the environment `env_key`.
    pub async fn execute(&self, project_name: &str, test_files: &[String], env_key: &str) -> RunReport {
        let _lease = self.lease.lock().await;
        let platform = platform_label(env_key);
        info!(project = project_name, env = env_key, tests = test_files.len(), "starting execution");

        match self.run_and_classify(project_name, test_files, env_key).await {
            Ok(classification) => self.record(project_name, platform, classification),
            Err(e) => {
                error!(project = project_name, error = %format!("{:#}", e), "execution aborted");
                RunReport::aborted(platform, &e)
            }
        }
    }

    /// Run a configured flow. `env_key` overrides the flow's environment, which
    /// defaults to its project's.
    ///
    /// The tunnel is closed on every path. When it cannot be opened, nothing
    /// else runs; when the trigger fails, the follow-up tests are skipped.
    pub async fn execute_flow(
        &self,
        flow_name: &str,
        env_key: Option<&str>,
    ) -> Result<FlowReport, ConfigError> {
        let flow = self.config.flow(flow_name)?.clone();
        let project = self.config.project(&flow.project)?.clone();
        let trigger = self.config.trigger(&flow.trigger)?.clone();
        let env_key = env_key
            .or(flow.environment.as_deref())
            .unwrap_or(&project.environment)
            .to_string();

        let _lease = self.lease.lock().await;
        let platform = platform_label(&env_key);
        info!(flow = %flow.name, project = %project.name, env = %env_key, "starting flow");

        let mut progress = FlowProgress::default();
        let run = match self
            .run_flow(&flow, &project.name, &trigger, &env_key, &mut progress)
            .await
        {
            Ok(classification) => self.record(&project.name, platform, classification),
            Err(e) => {
                error!(flow = %flow.name, error = %format!("{:#}", e), "flow aborted");
                RunReport::aborted(platform, &e)
            }
        };

        Ok(FlowReport {
            flow: flow.name,
            run,
            tunnel_port: progress.tunnel_port,
            trigger: progress.trigger,
            tests_skipped: !progress.tests_ran,
            failed_step: progress.failed_step,
        })
    }

    /// Purge the project's logs, clear history and resolve the environment.
    async fn prepare(&self, project_name: &str, env_key: &str) -> Result<ResolvedEnvironment> {
        let log_dir = self.executor.project_log_dir(project_name);
        let removed = purge_logs(&log_dir)
            .await
            .with_context(|| format!("failed to purge logs in {}", log_dir.display()))?;
        info!(project = project_name, removed, "purged previous logs");

        self.history
            .clear()
            .context("failed to clear execution history")?;

        let env = self.config.resolve_environment(env_key)?;
        if env.fell_back {
            warn!(requested = env_key, using = %env.key, "running against fallback environment");
        }
        Ok(env)
    }

    /// Persist a classified run and build its report.
    fn record(
        &self,
        project_name: &str,
        platform: String,
        classification: ProjectClassification,
    ) -> RunReport {
        let passed = classification.passed() as u32;
        let failed = classification.failed() as u32;
        let failed_tests: Vec<FailedTest> = classification
            .tests
            .iter()
            .filter(|t| !t.status.is_pass())
            .map(|t| FailedTest {
                file: t.file.clone(),
                log_file: t.log_file.clone(),
            })
            .collect();

        let record = NewExecution {
            project_name: project_name.to_string(),
            platform: platform.clone(),
            total: passed + failed,
            passed,
            failed,
            failed_tests,
        };

        let (execution_id, error) = match self.history.record(&record) {
            Ok(id) => (Some(id), None),
            Err(e) => {
                error!(project = project_name, error = %e, "failed to persist execution");
                (None, Some(format!("failed to persist execution: {}", e)))
            }
        };

        info!(
            project = project_name,
            status = %classification.project_status,
            passed,
            failed,
            execution_id,
            "execution finished"
        );

        RunReport {
            project_status: classification.project_status,
            tests: classification.tests,
            platform,
            execution_id,
            error,
        }
    }

    async fn run_and_classify(
        &self,
        project_name: &str,
        test_files: &[String],
        env_key: &str,
    ) -> Result<ProjectClassification> {
        let url = self.prepare(project_name, env_key).await?.settings.url;

        let outcomes = self
            .executor
            .run_group(test_files, project_name, &url)
            .await
            .context("test execution failed")?;
        info!(project = project_name, ran = outcomes.len(), "test group complete");

        let script_outcomes = self
            .scripts
            .run_all(&self.config.scripts.post_execution, project_name, &url)
            .await
            .context("post-execution scripts failed")?;
        if !script_outcomes.is_empty() {
            info!(project = project_name, ran = script_outcomes.len(), "post-execution scripts complete");
        }

        self.classifier
            .classify_project(project_name)
            .context("log classification failed")
    }

    async fn run_flow(
        &self,
        flow: &FlowConfig,
        project_name: &str,
        trigger: &TriggerConfig,
        env_key: &str,
        progress: &mut FlowProgress,
    ) -> Result<ProjectClassification> {
        let env = self.prepare(project_name, env_key).await?;
        let tunnel_host = env
            .settings
            .tunnel_host
            .clone()
            .with_context(|| format!("environment '{}' has no tunnel_host", env.key))?;
        let ssh_host = env
            .settings
            .ssh_host
            .clone()
            .with_context(|| format!("environment '{}' has no ssh_host", env.key))?;
        let url = env.settings.url;

        let log_dir = self.executor.project_log_dir(project_name);
        tokio::fs::create_dir_all(&log_dir)
            .await
            .with_context(|| format!("failed to create {}", log_dir.display()))?;

        let tunnel = &self.config.tunnel;
        let opened = self
            .tunnels
            .with_tunnel(tunnel.local_port, &tunnel_host, tunnel.remote_port, |port| {
                self.tunnel_steps(flow, project_name, trigger, &ssh_host, &url, port)
            })
            .await;

        match opened {
            Err(e) => {
                error!(flow = %flow.name, error = %e, "tunnel failed, skipping the rest of the flow");
                write_step_log(
                    &log_dir,
                    &logfile::step_log_name("tunnel", &tunnel_host),
                    &format!("tunnel {}:{}", tunnel_host, tunnel.remote_port),
                    TestStatus::Fail,
                    &url,
                    &format!("Error: {}\n", e),
                )
                .await?;
                progress.failed_step = Some(format!("tunnel: {}", e));
            }
            Ok(steps) => {
                let steps = steps.context("flow step failed")?;
                progress.tunnel_port = Some(steps.port);
                progress.tests_ran = steps.tests_ran;
                let log_name = logfile::step_log_name("trigger", &trigger.name);
                let label = format!("trigger {}", trigger.name);
                match steps.trigger {
                    Ok(result) => {
                        let status_line = match result.http_status {
                            Some(code) => format!("HTTP status {}\n", code),
                            None => "HTTP status unknown\n".to_string(),
                        };
                        write_step_log(&log_dir, &log_name, &label, TestStatus::Pass, &url, &status_line)
                            .await?;
                        progress.trigger = Some(result);
                    }
                    Err(e) => {
                        write_step_log(
                            &log_dir,
                            &log_name,
                            &label,
                            TestStatus::Fail,
                            &url,
                            &format!("Error: {}\n", e),
                        )
                        .await?;
                        progress.failed_step = Some(format!("trigger: {}", e));
                    }
                }
            }
        }

        self.classifier
            .classify_project(project_name)
            .context("log classification failed")
    }

    /// Checks, trigger and follow-up tests, run while the tunnel on `port` is open.
    async fn tunnel_steps(
        &self,
        flow: &FlowConfig,
        project_name: &str,
        trigger: &TriggerConfig,
        ssh_host: &str,
        url: &str,
        port: u16,
    ) -> Result<TunnelSteps, ExecError> {
        let db_env = [(ENV_DB_PORT, port.to_string())];

        let checks = self
            .scripts
            .run_all_with_env(&flow.checks, project_name, url, &db_env)
            .await?;
        info!(flow = %flow.name, ran = checks.len(), port, "flow checks complete");

        let fired = self.remote.trigger(ssh_host, trigger).await;
        let tests_ran = match &fired {
            Ok(_) => {
                let outcomes = self
                    .executor
                    .run_group_with_env(&flow.test_files, project_name, url, &db_env)
                    .await?;
                info!(flow = %flow.name, ran = outcomes.len(), "follow-up tests complete");
                true
            }
            Err(e) => {
                warn!(flow = %flow.name, error = %e, "trigger failed, skipping follow-up tests");
                false
            }
        };

        Ok(TunnelSteps {
            port,
            trigger: fired,
            tests_ran,
        })
    }
}

async fn write_step_log(
    log_dir: &Path,
    log_name: &str,
    label: &str,
    status: TestStatus,
    url: &str,
    output: &str,
) -> Result<()> {
    let path = log_dir.join(log_name);
    tokio::fs::write(&path, logfile::script_log_contents(label, status, url, output))
        .await
        .with_context(|| format!("failed to write log {}", path.display()))
}

/// Remove every file in `dir`. A missing directory is not an error.
async fn purge_logs(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_platform_label() {
        assert_eq!(platform_label("cdbu_dev"), "CDBU DEV");
        assert_eq!(platform_label("nrp_dev"), "NRP DEV");
        assert_eq!(platform_label("mars"), "MARS");
    }

    #[test]
    fn test_flow_report_flattens_run_fields() {
        let report = FlowReport {
            flow: "outbound".to_string(),
            run: RunReport {
                project_status: TestStatus::Fail,
                tests: Vec::new(),
                platform: "CDBU DEV".to_string(),
                execution_id: Some(3),
                error: None,
            },
            tunnel_port: Some(6001),
            trigger: None,
            tests_skipped: true,
            failed_step: Some("trigger: remote service rejected the request".to_string()),
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["flow"], "outbound");
        assert_eq!(value["projectStatus"], "FAIL");
        assert_eq!(value["executionId"], 3);
        assert_eq!(value["tunnelPort"], 6001);
        assert_eq!(value["testsSkipped"], true);
        assert!(value["failedStep"].as_str().unwrap().starts_with("trigger:"));
        assert!(value.get("run").is_none());
        assert!(value.get("error").is_none());
    }

    #[tokio::test]
    async fn test_purge_removes_files_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.log"), "x").unwrap();
        std::fs::write(dir.path().join("b_combined.log"), "y").unwrap();
        std::fs::create_dir(dir.path().join("keep")).unwrap();

        assert_eq!(purge_logs(dir.path()).await.unwrap(), 2);
        assert!(!dir.path().join("a.log").exists());
        assert!(dir.path().join("keep").is_dir());
    }

    #[tokio::test]
    async fn test_purge_missing_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        assert_eq!(purge_logs(&dir.path().join("absent")).await.unwrap(), 0);
    }

    #[test]
    fn test_aborted_report_serializes_error() {
        let report = RunReport::aborted("CDBU DEV".to_string(), &anyhow::anyhow!("disk full"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["projectStatus"], "FAIL");
        assert_eq!(json["platform"], "CDBU DEV");
        assert!(json["executionId"].is_null());
        assert_eq!(json["error"], "disk full");
        assert_eq!(json["tests"].as_array().unwrap().len(), 0);
    }
}
