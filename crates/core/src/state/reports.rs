//! Idea storage: the collaborator that receives each job's final report.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

use super::db::VentureDb;
use crate::pipeline::aggregate::AggregatedReport;

/// Receives the aggregated report once a job is finalized
#[async_trait]
pub trait IdeaStorage: Send + Sync {
    async fn save(&self, job_id: &str, report: &AggregatedReport) -> Result<()>;
}

/// Reports persisted to the `reports` table
pub struct SqliteIdeaStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIdeaStorage {
    pub fn new(db: &VentureDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    pub fn load(&self, job_id: &str) -> Result<Option<AggregatedReport>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM reports WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).context("Failed to parse stored report"))
            .transpose()
    }
}

#[async_trait]
impl IdeaStorage for SqliteIdeaStorage {
    async fn save(&self, job_id: &str, report: &AggregatedReport) -> Result<()> {
        let data = serde_json::to_string(report).context("Failed to serialize report")?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        conn.execute(
            r#"
            INSERT INTO reports (job_id, data, saved_at)
            VALUES (?1, ?2, datetime('now'))
            ON CONFLICT(job_id) DO UPDATE SET
                data = ?2,
                saved_at = datetime('now')
            "#,
            params![job_id, data],
        )?;
        tracing::debug!(job_id, "report saved");
        Ok(())
    }
}

/// Keeps saved reports in memory
#[derive(Default)]
pub struct MemoryIdeaStorage {
    saved: Mutex<Vec<(String, AggregatedReport)>>,
}

impl MemoryIdeaStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every save received, in order
    pub fn saved(&self) -> Vec<(String, AggregatedReport)> {
        self.saved.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl IdeaStorage for MemoryIdeaStorage {
    async fn save(&self, job_id: &str, report: &AggregatedReport) -> Result<()> {
        self.saved
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .push((job_id.to_string(), report.clone()));
        Ok(())
    }
}
