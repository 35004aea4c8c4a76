//! Log-based outcome classification.
//!
//! A log is FAIL when any rule matches its content, PASS otherwise. Rules are
//! an explicit ordered list so the set can be inspected, extended and tested on
//! its own; order only affects which rule gets reported, never the verdict.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::logfile;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("invalid classification rule {rule:?}: {source}")]
    InvalidRule {
        rule: ClassificationRule,
        #[source]
        source: regex::Error,
    },

    #[error("failed to list log directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Verdict for one test, script or project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One failure-indicating pattern. Matching ignores case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationRule {
    /// A standalone word: `FAIL` matches `FAIL` and `fail:` but not `FAILED`.
    Token(String),
    /// A literal substring anywhere in the text.
    Marker(String),
}

impl ClassificationRule {
    fn pattern(&self) -> String {
        match self {
            Self::Token(word) => format!(r"(?i)\b{}\b", regex::escape(word)),
            Self::Marker(text) => format!("(?i){}", regex::escape(text)),
        }
    }
}

/// Built-in failure rules, in reporting order.
pub fn standard_rules() -> Vec<ClassificationRule> {
    vec![
        ClassificationRule::Token("FAIL".to_string()),
        ClassificationRule::Marker("Error:".to_string()),
        ClassificationRule::Marker("Test timeout".to_string()),
        ClassificationRule::Marker("AssertionError".to_string()),
        ClassificationRule::Marker("Traceback".to_string()),
    ]
}

/// Classification of one log file in a project directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedTest {
    pub file: String,
    pub status: TestStatus,
    pub log_file: String,
}

/// Aggregate over a project's log directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectClassification {
    pub project_status: TestStatus,
    pub tests: Vec<ClassifiedTest>,
}

impl ProjectClassification {
    pub fn passed(&self) -> usize {
        self.tests.iter().filter(|t| t.status.is_pass()).count()
    }

    pub fn failed(&self) -> usize {
        self.tests.len() - self.passed()
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: ClassificationRule,
    regex: Regex,
}

/// Classifies logs under `<logs_root>/<project>/`.
#[derive(Debug, Clone)]
pub struct OutcomeClassifier {
    logs_root: PathBuf,
    rules: Vec<CompiledRule>,
}

impl OutcomeClassifier {
    pub fn new(
        logs_root: impl Into<PathBuf>,
        rules: Vec<ClassificationRule>,
    ) -> Result<Self, ClassifyError> {
        let rules = rules
            .into_iter()
            .map(|rule| match Regex::new(&rule.pattern()) {
                Ok(regex) => Ok(CompiledRule { rule, regex }),
                Err(source) => Err(ClassifyError::InvalidRule { rule, source }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            logs_root: logs_root.into(),
            rules,
        })
    }

    /// Classifier with [`standard_rules`].
    pub fn standard(logs_root: impl Into<PathBuf>) -> Self {
        Self::new(logs_root, standard_rules()).expect("built-in classification rules are valid")
    }

    pub fn rules(&self) -> impl Iterator<Item = &ClassificationRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    /// First rule, in list order, that matches `text`.
    pub fn first_failure(&self, text: &str) -> Option<&ClassificationRule> {
        self.rules
            .iter()
            .find(|c| c.regex.is_match(text))
            .map(|c| &c.rule)
    }

    pub fn classify_text(&self, text: &str) -> TestStatus {
        if self.first_failure(text).is_some() {
            TestStatus::Fail
        } else {
            TestStatus::Pass
        }
    }

    /// FAIL when the file is absent or unreadable.
    pub fn classify_log_file(&self, path: &Path) -> TestStatus {
        match std::fs::read(path) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                let verdict = self.first_failure(&content);
                if let Some(rule) = verdict {
                    debug!(path = %path.display(), rule = ?rule, "failure rule matched");
                }
                if verdict.is_some() {
                    TestStatus::Fail
                } else {
                    TestStatus::Pass
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "log file unreadable, classifying as FAIL");
                TestStatus::Fail
            }
        }
    }

    /// Classify every non-combined `.log` file in the project's log directory,
    /// in file-name order.
    ///
    /// A missing directory is FAIL with no tests. An existing directory with no
    /// logs is PASS with no tests.
    pub fn classify_project(&self, project: &str) -> Result<ProjectClassification, ClassifyError> {
        let dir = self.logs_root.join(project);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(project, path = %dir.display(), "no log directory found");
                return Ok(ProjectClassification {
                    project_status: TestStatus::Fail,
                    tests: Vec::new(),
                });
            }
            Err(source) => return Err(ClassifyError::ReadDir { path: dir, source }),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".log") && !logfile::is_combined(name))
            .collect();
        names.sort();

        let tests: Vec<ClassifiedTest> = names
            .into_iter()
            .map(|name| {
                let path = dir.join(&name);
                let status = self.classify_log_file(&path);
                ClassifiedTest {
                    file: display_name(&path).unwrap_or_else(|| name.clone()),
                    status,
                    log_file: logfile::log_ref(project, &name),
                }
            })
            .collect();

        let project_status = if tests.iter().all(|t| t.status.is_pass()) {
            TestStatus::Pass
        } else {
            TestStatus::Fail
        };
        info!(project, status = %project_status, tests = tests.len(), "project classified");

        Ok(ProjectClassification {
            project_status,
            tests,
        })
    }
}

/// Test name from the log header, if the log has one.
fn display_name(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let content = String::from_utf8_lossy(&bytes);
    logfile::parse_header_name(&content).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
