//! Log file naming and layout.
//!
//! Every log starts with `--- <file> [<STATUS>] ---` followed by
//! `--- ENV: <url> ---` and then the raw captured output. The combined log
//! concatenates per-file blocks in execution order.

use std::path::Path;

use crate::classify::TestStatus;

const HEADER_PREFIX: &str = "--- ";
const HEADER_SUFFIX: &str = " ---";

/// Log file name for a browser test, e.g. `dbpoll.spec.js` -> `dbpoll.log`.
pub fn test_log_name(test_file: &str) -> String {
    let flat = test_file.replace(['/', '\\'], "_");
    let stem = flat
        .strip_suffix(".spec.js")
        .or_else(|| flat.strip_suffix(".spec.ts"))
        .unwrap_or(&flat);
    format!("{}.log", stem)
}

/// Log file name for a script, e.g. `tests/db_validation.py` -> `db_validation.log`.
pub fn script_log_name(script: &str) -> String {
    let base = Path::new(script)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.to_string());
    match base.strip_suffix(".py") {
        Some(stem) => format!("{}.log", stem),
        None => format!("{}.log", base),
    }
}

/// Log file name for a flow step such as a trigger, e.g. `trigger_outbound.log`.
pub fn step_log_name(kind: &str, name: &str) -> String {
    format!("{}_{}.log", kind, name.replace(['/', '\\', ' '], "_"))
}

pub fn combined_log_name(project: &str) -> String {
    format!("{}_combined.log", project)
}

/// Combined logs are excluded from classification.
pub fn is_combined(file_name: &str) -> bool {
    file_name.to_lowercase().contains("combined")
}

/// Dashboard path for a log file.
pub fn log_ref(project: &str, log_file_name: &str) -> String {
    format!("/logs/{}/{}", project, log_file_name)
}

pub fn header_line(file: &str, status: TestStatus) -> String {
    format!("{}{} [{}]{}", HEADER_PREFIX, file, status, HEADER_SUFFIX)
}

pub fn test_log_contents(file: &str, status: TestStatus, url: &str, output: &str) -> String {
    format!(
        "{}\n--- ENV: {} ---\n\n{}",
        header_line(file, status),
        url,
        output
    )
}

pub fn script_log_contents(script: &str, status: TestStatus, url: &str, output: &str) -> String {
    format!(
        "{}\n--- ENV: {} ---\n{}",
        header_line(script, status),
        url,
        output
    )
}

pub fn combined_entry(file: &str, status: TestStatus, output: &str) -> String {
    format!("\n{}\n{}\n", header_line(file, status), output)
}

/// File name recorded in the first header line of a log.
pub fn parse_header_name(content: &str) -> Option<&str> {
    let line = content.lines().next()?;
    let inner = line.strip_prefix(HEADER_PREFIX)?.strip_suffix(HEADER_SUFFIX)?;
    let bracket = inner.rfind(" [")?;
    inner.ends_with(']').then(|| &inner[..bracket])
}
