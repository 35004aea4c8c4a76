//! TOML configuration for the pricing e2e harness.
//!
//! A single [`HarnessConfig`] is built at process entry and handed to every
//! component. Nothing below reads environment variables or globals on its own;
//! the only ambient lookup is `PRICING_E2E_CONFIG` in [`HarnessConfig::load_or_default`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "PRICING_E2E_CONFIG";

/// Config file looked up in the working directory when no override is set.
pub const DEFAULT_CONFIG_FILE: &str = "pricing-e2e.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no environments configured")]
    NoEnvironments,

    #[error("default environment '{0}' is not defined in [environments]")]
    UnknownDefaultEnvironment(String),

    #[error("project '{project}' references unknown environment '{environment}'")]
    UnknownProjectEnvironment { project: String, environment: String },

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("runner program must not be empty")]
    EmptyRunnerProgram,

    #[error("unknown project '{0}'")]
    UnknownProject(String),

    #[error("unknown trigger '{0}'")]
    UnknownTrigger(String),

    #[error("unknown flow '{0}'")]
    UnknownFlow(String),

    #[error("flow '{flow}' references unknown {kind} '{name}'")]
    UnknownFlowReference {
        flow: String,
        kind: &'static str,
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for one harness process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Key in `environments` used when a requested key is unknown.
    pub default_environment: String,
    pub paths: PathsConfig,
    pub runner: RunnerConfig,
    pub scripts: ScriptsConfig,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    pub projects: BTreeMap<String, ProjectConfig>,
    pub tunnel: TunnelConfig,
    pub remote: RemoteConfig,
    pub triggers: Vec<TriggerConfig>,
    pub flows: Vec<FlowConfig>,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            default_environment: "cdbu_dev".to_string(),
            paths: PathsConfig::default(),
            runner: RunnerConfig::default(),
            scripts: ScriptsConfig::default(),
            environments: default_environments(),
            projects: default_projects(),
            tunnel: TunnelConfig::default(),
            remote: RemoteConfig::default(),
            triggers: default_triggers(),
            flows: Vec::new(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded harness configuration");
        Ok(config)
    }

    /// Load configuration from, in order:
    /// 1. The path in `PRICING_E2E_CONFIG`.
    /// 2. `./pricing-e2e.toml`.
    /// 3. Compiled-in defaults.
    ///
    /// A file that is named or present but cannot be loaded is an error; the
    /// defaults are only used when there is no file at all.
    pub fn load_or_default() -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
        Self::load_first(env_path.as_deref(), Path::new(DEFAULT_CONFIG_FILE))
    }

    fn load_first(explicit: Option<&Path>, local: &Path) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path)
                .with_context(|| format!("{} names an unusable config file", CONFIG_ENV_VAR));
        }
        if local.exists() {
            return Self::load(local);
        }
        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environments.is_empty() {
            return Err(ConfigError::NoEnvironments);
        }
        if !self.environments.contains_key(&self.default_environment) {
            return Err(ConfigError::UnknownDefaultEnvironment(
                self.default_environment.clone(),
            ));
        }
        for (key, project) in &self.projects {
            if !self.environments.contains_key(&project.environment) {
                return Err(ConfigError::UnknownProjectEnvironment {
                    project: key.clone(),
                    environment: project.environment.clone(),
                });
            }
        }
        if self.runner.program.trim().is_empty() {
            return Err(ConfigError::EmptyRunnerProgram);
        }
        if self.tunnel.ready_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("tunnel.ready_timeout_secs"));
        }
        if self.tunnel.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("tunnel.poll_interval_ms"));
        }
        if self.remote.timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("remote.timeout_secs"));
        }
        if self.server.history_limit == 0 {
            return Err(ConfigError::ZeroValue("server.history_limit"));
        }
        for flow in &self.flows {
            if !self.projects.contains_key(&flow.project) {
                return Err(flow.unknown("project", &flow.project));
            }
            if !self.triggers.iter().any(|t| t.name == flow.trigger) {
                return Err(flow.unknown("trigger", &flow.trigger));
            }
            if let Some(env) = &flow.environment {
                if !self.environments.contains_key(env) {
                    return Err(flow.unknown("environment", env));
                }
            }
        }
        Ok(())
    }

    /// Resolve an environment key to its settings.
    ///
    /// Unknown keys fall back to `default_environment` with a warning; this
    /// never fails once [`validate`](Self::validate) has passed.
    pub fn resolve_environment(&self, key: &str) -> Result<ResolvedEnvironment, ConfigError> {
        if let Some(env) = self.environments.get(key) {
            return Ok(ResolvedEnvironment {
                key: key.to_string(),
                settings: env.clone(),
                fell_back: false,
            });
        }

        let fallback = self
            .environments
            .get(&self.default_environment)
            .ok_or_else(|| ConfigError::UnknownDefaultEnvironment(self.default_environment.clone()))?;
        warn!(
            requested = key,
            fallback = %self.default_environment,
            "unknown environment key, falling back to default"
        );
        Ok(ResolvedEnvironment {
            key: self.default_environment.clone(),
            settings: fallback.clone(),
            fell_back: true,
        })
    }

    pub fn project(&self, key: &str) -> Result<&ProjectConfig, ConfigError> {
        self.projects
            .get(key)
            .ok_or_else(|| ConfigError::UnknownProject(key.to_string()))
    }

    pub fn trigger(&self, name: &str) -> Result<&TriggerConfig, ConfigError> {
        self.triggers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ConfigError::UnknownTrigger(name.to_string()))
    }

    pub fn flow(&self, name: &str) -> Result<&FlowConfig, ConfigError> {
        self.flows
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| ConfigError::UnknownFlow(name.to_string()))
    }
}

/// Outcome of [`HarnessConfig::resolve_environment`].
#[derive(Debug, Clone)]
pub struct ResolvedEnvironment {
    /// The key actually used (differs from the request after a fallback).
    pub key: String,
    pub settings: EnvironmentConfig,
    pub fell_back: bool,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Filesystem layout. Unset entries are derived from `project_root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub project_root: PathBuf,
    pub logs_dir: Option<PathBuf>,
    pub tests_dir: Option<PathBuf>,
    pub database: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            logs_dir: None,
            tests_dir: None,
            database: None,
        }
    }
}

impl PathsConfig {
    pub fn logs_dir(&self) -> PathBuf {
        self.resolve(self.logs_dir.as_deref(), "logs")
    }

    pub fn tests_dir(&self) -> PathBuf {
        self.resolve(self.tests_dir.as_deref(), "tests")
    }

    pub fn database(&self) -> PathBuf {
        self.resolve(self.database.as_deref(), "test_history.db")
    }

    fn resolve(&self, explicit: Option<&Path>, default_name: &str) -> PathBuf {
        match explicit {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.project_root.join(p),
            None => self.project_root.join(default_name),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner / scripts
// ---------------------------------------------------------------------------

/// How one external browser test is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Executable, e.g. `node`.
    pub program: String,
    /// Argument template; `{test}` is replaced by the resolved test path.
    pub args: Vec<String>,
    /// Case-insensitive substring whose presence in the output means PASS.
    pub pass_marker: String,
    pub timeout_secs: u64,
    /// Echo child output to our stdout as it streams in.
    pub echo_output: bool,
    /// SIGTERM to SIGKILL grace for a runner that overran its timeout.
    pub terminate_grace_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "node".to_string(),
            args: vec![
                "node_modules/@playwright/test/cli.js".to_string(),
                "test".to_string(),
                "{test}".to_string(),
                "--headed".to_string(),
                "--reporter=line".to_string(),
            ],
            pass_marker: "passed".to_string(),
            timeout_secs: 1800,
            echo_output: true,
            terminate_grace_ms: 5000,
        }
    }
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Post-execution scripts run after the browser tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    pub interpreter: String,
    /// Script paths relative to the project root, run in order.
    pub post_execution: Vec<String>,
    pub timeout_secs: u64,
    pub terminate_grace_ms: u64,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            post_execution: Vec::new(),
            timeout_secs: 600,
            terminate_grace_ms: 5000,
        }
    }
}

impl ScriptsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// Environments / projects
// ---------------------------------------------------------------------------

/// One deployment of the pricing application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Base URL handed to test processes as `BASE_URL`.
    pub url: String,
    /// Host used for remote workflow triggers.
    #[serde(default)]
    pub ssh_host: Option<String>,
    /// Host used for database tunnels.
    #[serde(default)]
    pub tunnel_host: Option<String>,
}

fn default_environments() -> BTreeMap<String, EnvironmentConfig> {
    let mut map = BTreeMap::new();
    map.insert(
        "cdbu_dev".to_string(),
        EnvironmentConfig {
            url: "https://dev-spriced-cdbu.alpha.simadvisory.com/".to_string(),
            ssh_host: Some("dev-spriced".to_string()),
            tunnel_host: Some("simw01".to_string()),
        },
    );
    map.insert(
        "cdbu_qa".to_string(),
        EnvironmentConfig {
            url: "https://qa-spriced-cdbu.alpha.simadvisory.com/".to_string(),
            ssh_host: Some("qa-spriced".to_string()),
            tunnel_host: Some("qa-spriced".to_string()),
        },
    );
    map.insert(
        "nrp_dev".to_string(),
        EnvironmentConfig {
            url: "https://dev-spriced-nrp.alpha.simadvisory.com/".to_string(),
            ssh_host: Some("dev-spriced".to_string()),
            tunnel_host: Some("simw01".to_string()),
        },
    );
    map
}

/// A named suite of browser tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Display name, also the log directory name and the persisted project name.
    pub name: String,
    #[serde(default)]
    pub test_files: Vec<String>,
    /// Environment key used when a run does not name one.
    pub environment: String,
}

fn default_projects() -> BTreeMap<String, ProjectConfig> {
    let mut map = BTreeMap::new();
    map.insert(
        "china".to_string(),
        ProjectConfig {
            name: "China Project".to_string(),
            test_files: vec!["dbpoll.spec.js".to_string()],
            environment: "cdbu_dev".to_string(),
        },
    );
    map.insert(
        "nrp".to_string(),
        ProjectConfig {
            name: "NRP Project".to_string(),
            test_files: Vec::new(),
            environment: "nrp_dev".to_string(),
        },
    );
    map.insert(
        "psbu".to_string(),
        ProjectConfig {
            name: "PSBU Project".to_string(),
            test_files: Vec::new(),
            environment: "cdbu_dev".to_string(),
        },
    );
    map
}

// ---------------------------------------------------------------------------
// Tunnel / remote
// ---------------------------------------------------------------------------

/// Local-forward tunnel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub ssh_binary: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// Destination host as seen from the ssh server.
    pub forward_host: String,
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL when closing.
    pub terminate_grace_ms: u64,
    /// Time allowed for a killed blocker to release the port.
    pub release_grace_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            local_port: 6001,
            remote_port: 5432,
            forward_host: "127.0.0.1".to_string(),
            ready_timeout_secs: 10,
            poll_interval_ms: 500,
            terminate_grace_ms: 2000,
            release_grace_ms: 1000,
        }
    }
}

impl TunnelConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_millis(self.release_grace_ms)
    }
}

/// Remote command execution over ssh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub ssh_binary: String,
    /// Upper bound for a single attempt, including connection setup.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub retries: u32,
    pub retry_interval_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            timeout_secs: 120,
            connect_timeout_secs: 10,
            retries: 5,
            retry_interval_secs: 5,
        }
    }
}

/// What a trigger's output must contain to count as success.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpectKind {
    /// Only the HTTP status is checked.
    Status,
    /// Status plus a JSON business response with a usable `responseList`.
    Business,
}

/// A named backend workflow invoked with curl on the environment's ssh host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    /// URL as reachable from the remote host.
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Opaque JSON request body.
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_expect")]
    pub expect: ExpectKind,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_expect() -> ExpectKind {
    ExpectKind::Status
}

fn default_triggers() -> Vec<TriggerConfig> {
    vec![
        TriggerConfig {
            name: "sales-workflow".to_string(),
            url: "http://localhost:5087/workflow/runWorkflow/Sales%20Workflow".to_string(),
            method: "POST".to_string(),
            body: None,
            expect: ExpectKind::Status,
            retries: None,
            interval_secs: None,
        },
        TriggerConfig {
            name: "approval-scheduler".to_string(),
            url: "http://localhost:8085/scheduler/approval2/start".to_string(),
            method: "GET".to_string(),
            body: None,
            expect: ExpectKind::Status,
            retries: None,
            interval_secs: None,
        },
    ]
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// A database-backed check: open the tunnel, run `checks` against it, fire
/// `trigger`, then run `test_files` if the trigger succeeded. The tunnel stays
/// open until the last step finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    pub name: String,
    /// Project key; the flow's logs and history record use its name.
    pub project: String,
    /// Environment key; defaults to the project's.
    #[serde(default)]
    pub environment: Option<String>,
    /// Trigger name from `[[triggers]]`.
    pub trigger: String,
    /// Scripts run over the tunnel before the trigger fires.
    #[serde(default)]
    pub checks: Vec<String>,
    /// Browser tests run after a successful trigger.
    #[serde(default)]
    pub test_files: Vec<String>,
}

impl FlowConfig {
    fn unknown(&self, kind: &'static str, name: &str) -> ConfigError {
        ConfigError::UnknownFlowReference {
            flow: self.name.clone(),
            kind,
            name: name.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server / logging
// ---------------------------------------------------------------------------

/// Dashboard API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Rows returned by the history endpoint when no limit is given.
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
