//! Execution history: one immutable row per orchestration run.

use chrono::{Local, SecondsFormat, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::{schema, Pool};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("inconsistent counts: passed {passed} + failed {failed} != total {total}")]
    InconsistentCounts { total: u32, passed: u32, failed: u32 },

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to (de)serialize failed test list: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A failed test as stored in `failed_tests_json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTest {
    pub file: String,
    pub log_file: String,
}

/// Input to [`HistoryStore::record`].
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub project_name: String,
    pub platform: String,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub failed_tests: Vec<FailedTest>,
}

/// A persisted run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: i64,
    pub project_name: String,
    pub execution_date: String,
    pub execution_time: String,
    pub platform: String,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub failed_list: Vec<FailedTest>,
    pub created_at: String,
}

/// Dashboard view of an [`ExecutionRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub name: String,
    pub date: String,
    /// `HH:MM`
    pub time: String,
    pub platform: String,
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
    pub failed_tests: Vec<FailedTest>,
}

impl From<&ExecutionRecord> for HistoryEntry {
    fn from(r: &ExecutionRecord) -> Self {
        Self {
            id: format!("proj_{}", r.id),
            name: r.project_name.clone(),
            date: r.execution_date.clone(),
            time: r.execution_time.chars().take(5).collect(),
            platform: r.platform.clone(),
            total_tests: r.total_tests,
            passed: r.passed_tests,
            failed: r.failed_tests,
            failed_tests: r.failed_list.clone(),
        }
    }
}

/// Totals across all stored runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_executions: u64,
    pub total_tests: u64,
    pub total_passed: u64,
    pub total_failed: u64,
}

/// Owns the `test_executions` table.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: Pool,
}

impl HistoryStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Ensure the table exists. Safe to call repeatedly.
    pub fn initialize(&self) -> Result<(), HistoryError> {
        let conn = self.pool.get()?;
        schema::migrate(&conn)?;
        Ok(())
    }

    /// Delete every record, reset the id sequence and reclaim space.
    pub fn clear(&self) -> Result<usize, HistoryError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM test_executions", [])?;
        tx.execute(
            "DELETE FROM sqlite_sequence WHERE name = 'test_executions'",
            [],
        )?;
        tx.commit()?;
        conn.execute_batch("VACUUM")?;
        info!(deleted, "execution history cleared");
        Ok(deleted)
    }

    /// Insert one record and return its id.
    pub fn record(&self, new: &NewExecution) -> Result<i64, HistoryError> {
        if new.passed.checked_add(new.failed) != Some(new.total) {
            return Err(HistoryError::InconsistentCounts {
                total: new.total,
                passed: new.passed,
                failed: new.failed,
            });
        }

        let failed_json = serde_json::to_string(&new.failed_tests)?;
        let local = Local::now();
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO test_executions
             (project_name, execution_date, execution_time, platform,
              total_tests, passed_tests, failed_tests, failed_tests_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                new.project_name,
                local.format("%Y-%m-%d").to_string(),
                local.format("%H:%M:%S").to_string(),
                new.platform,
                new.total,
                new.passed,
                new.failed,
                failed_json,
                created_at,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, project = %new.project_name, "execution recorded");
        Ok(id)
    }

    /// Most recent records first. Records created in the same millisecond keep
    /// insertion order.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, HistoryError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_name, execution_date, execution_time, platform,
                    total_tests, passed_tests, failed_tests, failed_tests_json, created_at
             FROM test_executions
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], |row| {
            Ok((
                ExecutionRecord {
                    id: row.get(0)?,
                    project_name: row.get(1)?,
                    execution_date: row.get(2)?,
                    execution_time: row.get(3)?,
                    platform: row.get(4)?,
                    total_tests: row.get(5)?,
                    passed_tests: row.get(6)?,
                    failed_tests: row.get(7)?,
                    failed_list: Vec::new(),
                    created_at: row.get(9)?,
                },
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (mut record, failed_json) = row?;
            record.failed_list = serde_json::from_str(&failed_json)?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn aggregate_stats(&self) -> Result<ExecutionStats, HistoryError> {
        let conn = self.pool.get()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(total_tests), 0),
                    COALESCE(SUM(passed_tests), 0),
                    COALESCE(SUM(failed_tests), 0)
             FROM test_executions",
            [],
            |row| {
                Ok(ExecutionStats {
                    total_executions: row.get::<_, i64>(0)? as u64,
                    total_tests: row.get::<_, i64>(1)? as u64,
                    total_passed: row.get::<_, i64>(2)? as u64,
                    total_failed: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use tempfile::TempDir;

    fn store() -> (TempDir, HistoryStore) {
        let dir = TempDir::new().unwrap();
        let pool = open_pool(&dir.path().join("history.db")).unwrap();
        let store = HistoryStore::new(pool);
        store.initialize().unwrap();
        (dir, store)
    }

    fn run(project: &str, total: u32, passed: u32, failed: u32) -> NewExecution {
        NewExecution {
            project_name: project.to_string(),
            platform: "CDBU DEV".to_string(),
            total,
            passed,
            failed,
            failed_tests: (0..failed)
                .map(|i| FailedTest {
                    file: format!("t{}.spec.js", i),
                    log_file: format!("/logs/{}/t{}.log", project, i),
                })
                .collect(),
        }
    }

    #[test]
    fn test_record_and_list() {
        let (_dir, store) = store();
        let id = store.record(&run("China Project", 3, 2, 1)).unwrap();
        assert_eq!(id, 1);

        let records = store.list_recent(10).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.project_name, "China Project");
        assert_eq!(r.platform, "CDBU DEV");
        assert_eq!(r.passed_tests + r.failed_tests, r.total_tests);
        assert_eq!(r.failed_list.len(), 1);
        assert_eq!(r.failed_list[0].log_file, "/logs/China Project/t0.log");
        assert_eq!(r.execution_time.len(), 8);
    }

    #[test]
    fn test_inconsistent_counts_rejected() {
        let (_dir, store) = store();
        let err = store.record(&run("China Project", 5, 2, 1)).unwrap_err();
        assert!(matches!(err, HistoryError::InconsistentCounts { total: 5, .. }));
        assert!(store.list_recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_sequential_ids_increase_and_order_is_newest_first() {
        let (_dir, store) = store();
        let first = store.record(&run("A", 1, 1, 0)).unwrap();
        let second = store.record(&run("B", 1, 0, 1)).unwrap();
        let third = store.record(&run("C", 2, 2, 0)).unwrap();
        assert!(first < second && second < third);

        let names: Vec<String> = store
            .list_recent(10)
            .unwrap()
            .into_iter()
            .map(|r| r.project_name)
            .collect();
        assert_eq!(names, vec!["C", "B", "A"]);

        assert_eq!(store.list_recent(2).unwrap().len(), 2);
    }

    #[test]
    fn test_clear_empties_and_resets_ids() {
        let (_dir, store) = store();
        store.record(&run("A", 1, 1, 0)).unwrap();
        store.record(&run("B", 1, 1, 0)).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        for limit in [0, 1, 100] {
            assert!(store.list_recent(limit).unwrap().is_empty());
        }
        assert_eq!(store.record(&run("C", 1, 1, 0)).unwrap(), 1);
    }

    #[test]
    fn test_clear_on_empty_store() {
        let (_dir, store) = store();
        assert_eq!(store.clear().unwrap(), 0);
    }

    #[test]
    fn test_aggregate_stats() {
        let (_dir, store) = store();
        assert_eq!(store.aggregate_stats().unwrap(), ExecutionStats::default());

        store.record(&run("A", 3, 2, 1)).unwrap();
        store.record(&run("B", 4, 4, 0)).unwrap();
        let stats = store.aggregate_stats().unwrap();
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.total_tests, 7);
        assert_eq!(stats.total_passed, 6);
        assert_eq!(stats.total_failed, 1);
    }

    #[test]
    fn test_history_entry_mapping() {
        let record = ExecutionRecord {
            id: 42,
            project_name: "NRP Project".to_string(),
            execution_date: "2026-10-16".to_string(),
            execution_time: "14:03:59".to_string(),
            platform: "NRP DEV".to_string(),
            total_tests: 1,
            passed_tests: 0,
            failed_tests: 1,
            failed_list: vec![FailedTest {
                file: "a.spec.js".to_string(),
                log_file: "/logs/NRP Project/a.log".to_string(),
            }],
            created_at: "2026-10-16T12:03:59.120Z".to_string(),
        };
        let entry = HistoryEntry::from(&record);
        assert_eq!(entry.id, "proj_42");
        assert_eq!(entry.time, "14:03");

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["totalTests"], 1);
        assert_eq!(json["failedTests"][0]["logFile"], "/logs/NRP Project/a.log");
    }
}
