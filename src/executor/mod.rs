//! External test and script execution.
//!
//! Test files and post-execution scripts are opaque executables. They receive the
//! target through environment variables and leave a log file per invocation in
//! the project's log directory; the classifier reads those logs afterwards.

pub mod group;
pub mod logfile;
pub mod scripts;

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::classify::TestStatus;

pub use group::TestExecutor;
pub use scripts::{classify_script, ScriptRunner};

/// Base URL of the target deployment.
pub const ENV_BASE_URL: &str = "BASE_URL";
/// `QA` or `DEV`, derived from the base URL.
pub const ENV_TEST_ENV_NAME: &str = "TEST_ENV_NAME";
/// Local port of the database tunnel, set for processes run inside a flow.
pub const ENV_DB_PORT: &str = "DB_PORT";

/// Extra environment variables for one group of processes.
pub type ExtraEnv<'a> = &'a [(&'a str, String)];

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to prepare log directory {}: {source}", path.display())]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write log {}: {source}", path.display())]
    WriteLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Environment name handed to test processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvironmentName {
    Qa,
    Dev,
}

impl EnvironmentName {
    /// `QA` when the URL contains `qa` in any case, `DEV` otherwise.
    pub fn from_url(url: &str) -> Self {
        if url.to_lowercase().contains("qa") {
            Self::Qa
        } else {
            Self::Dev
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qa => "QA",
            Self::Dev => "DEV",
        }
    }
}

impl std::fmt::Display for EnvironmentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one test or script invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestOutcome {
    pub test_id: String,
    pub status: TestStatus,
    #[serde(skip)]
    pub output: String,
    pub log_path: PathBuf,
    /// Path under which the dashboard serves the log.
    pub log_ref: String,
}
