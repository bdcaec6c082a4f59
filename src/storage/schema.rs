//! Database schema and migrations.

use rusqlite::Connection;

use crate::errors::Result;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS schedule_jobs (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            definition_json TEXT NOT NULL,
            actions_json TEXT NOT NULL,
            admin_state TEXT NOT NULL,
            auto_trigger_missed INTEGER NOT NULL DEFAULT 0,
            labels_json TEXT NOT NULL DEFAULT '[]',
            created INTEGER NOT NULL,
            modified INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS action_records (
            id TEXT PRIMARY KEY,
            job_name TEXT NOT NULL,
            action_id TEXT NOT NULL,
            action_json TEXT NOT NULL,
            status TEXT NOT NULL,
            scheduled_at INTEGER NOT NULL,
            created INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_name ON schedule_jobs(name);
        CREATE INDEX IF NOT EXISTS idx_records_created ON action_records(created);
        CREATE INDEX IF NOT EXISTS idx_records_job ON action_records(job_name);
        CREATE INDEX IF NOT EXISTS idx_records_status ON action_records(status);
        CREATE INDEX IF NOT EXISTS idx_records_latest
            ON action_records(job_name, action_id, created);",
    )?;

    Ok(())
}
