//! Database schema and migrations.

use rusqlite::Connection;

/// Create the history table if it does not exist. Idempotent.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS test_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_name TEXT NOT NULL,
            execution_date TEXT NOT NULL,
            execution_time TEXT NOT NULL,
            platform TEXT NOT NULL,
            total_tests INTEGER NOT NULL,
            passed_tests INTEGER NOT NULL,
            failed_tests INTEGER NOT NULL,
            failed_tests_json TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            CHECK (passed_tests + failed_tests = total_tests)
        );

        CREATE INDEX IF NOT EXISTS idx_test_executions_created ON test_executions(created_at);",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'test_executions'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_count_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let result = conn.execute(
            "INSERT INTO test_executions
             (project_name, execution_date, execution_time, platform, total_tests, passed_tests, failed_tests, created_at)
             VALUES ('p', '2026-01-01', '10:00:00', 'CDBU DEV', 3, 1, 1, '2026-01-01T10:00:00.000Z')",
            [],
        );
        assert!(result.is_err());
    }
}
