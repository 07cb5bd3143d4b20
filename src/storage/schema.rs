//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS issues (
            id TEXT PRIMARY KEY,
            issue_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            source TEXT NOT NULL,
            resource_id TEXT,
            disposition TEXT NOT NULL,
            focus_group_id TEXT,
            issue_json TEXT NOT NULL,
            detected_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS focus_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            state_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fix_attempts (
            id TEXT PRIMARY KEY,
            focus_group_id TEXT NOT NULL,
            fix_description TEXT NOT NULL,
            result TEXT NOT NULL,
            failure_reason TEXT,
            attempt_json TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            concluded_at TEXT
        );

        CREATE TABLE IF NOT EXISTS transitions (
            id INTEGER PRIMARY KEY,
            from_phase TEXT NOT NULL,
            to_phase TEXT NOT NULL,
            reason TEXT NOT NULL,
            focus_group_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_issues_detected ON issues(detected_at);
        CREATE INDEX IF NOT EXISTS idx_issues_group ON issues(focus_group_id);
        CREATE INDEX IF NOT EXISTS idx_fix_attempts_submitted ON fix_attempts(submitted_at);
        CREATE INDEX IF NOT EXISTS idx_transitions_created ON transitions(created_at);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        for table in ["issues", "focus_state", "fix_attempts", "transitions"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "table {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
