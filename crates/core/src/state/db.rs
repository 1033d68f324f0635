//! # Venture Database
//!
//! Single SQLite database backing the durable job store, the per-job event
//! log and saved reports. Lives at `.venture/venture.db` by default.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Shared handle to the database
#[derive(Clone)]
pub struct VentureDb {
    conn: Arc<Mutex<Connection>>,
}

impl VentureDb {
    /// Open or create the database at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open venture database")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, `--ephemeral`)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Get a shared connection for use by other modules
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - jobs, event log, reports
    fn migrate_v1(conn: &Connection) -> Result<()> {
        // Jobs (full record as JSON, hot columns for queries)
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                revision INTEGER NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            [],
        )?;

        // Per-job event log
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS job_events (
                job_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (job_id, sequence)
            )
            "#,
            [],
        )?;

        // Aggregated reports handed over after finalization
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                job_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                saved_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_completed ON jobs(completed_at)",
            [],
        )?;

        tracing::info!("VentureDb initialized with schema version {}", SCHEMA_VERSION);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(db: &VentureDb) -> Vec<String> {
        let conn = db.connection();
        let conn = conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        names
    }

    #[test]
    fn test_open_creates_tables() {
        let db = VentureDb::open_in_memory().unwrap();
        let tables = tables(&db);

        assert!(tables.contains(&"jobs".to_string()));
        assert!(tables.contains(&"job_events".to_string()));
        assert!(tables.contains(&"reports".to_string()));
    }

    #[test]
    fn test_schema_version_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".venture/venture.db");

        // Open twice - should not fail on second open
        drop(VentureDb::open_at(&path).unwrap());
        let db = VentureDb::open_at(&path).unwrap();

        let conn = db.connection();
        let conn = conn.lock().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
