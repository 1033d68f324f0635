//! # Durable Job Store
//!
//! Write-through persistence behind the job registry. Every update carries
//! the revision the writer expects to replace; a mismatch is reported as
//! [`StoreError::Conflict`] and never silently overwritten.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::db::VentureDb;
use super::job::Job;
use crate::error::StoreError;
use crate::pipeline::events::JobEvent;

/// Persistence for jobs and their event logs
pub trait JobStore: Send + Sync {
    /// Insert a new job; fails if the id is taken
    fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Replace a job whose stored revision is `expected_revision`
    fn update(&self, job: &Job, expected_revision: u64) -> Result<(), StoreError>;

    fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Jobs left Pending or Running
    fn unfinished(&self) -> Result<Vec<Job>, StoreError>;

    /// Delete terminal jobs completed before `cutoff`, returning their ids
    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError>;

    fn append_event(&self, event: &JobEvent) -> Result<(), StoreError>;

    fn events(&self, job_id: &str) -> Result<Vec<JobEvent>, StoreError>;
}

// =========================================================================
// In-memory store
// =========================================================================

/// Store kept entirely in process memory
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
    events: Mutex<HashMap<String, Vec<JobEvent>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().map_err(|_| StoreError::Poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn update(&self, job: &Job, expected_revision: u64) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().map_err(|_| StoreError::Poisoned)?;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::Missing(job.id.clone()))?;
        if stored.revision != expected_revision {
            return Err(StoreError::Conflict {
                job_id: job.id.clone(),
                expected: expected_revision,
                found: stored.revision,
            });
        }
        *stored = job.clone();
        Ok(())
    }

    fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(jobs.get(job_id).cloned())
    }

    fn unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(jobs.values().filter(|j| !j.is_terminal()).cloned().collect())
    }

    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut jobs = self.jobs.lock().map_err(|_| StoreError::Poisoned)?;
        let expired: Vec<String> = jobs
            .values()
            .filter(|j| j.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id.clone())
            .collect();

        let mut events = self.events.lock().map_err(|_| StoreError::Poisoned)?;
        for id in &expired {
            jobs.remove(id);
            events.remove(id);
        }
        Ok(expired)
    }

    fn append_event(&self, event: &JobEvent) -> Result<(), StoreError> {
        let mut events = self.events.lock().map_err(|_| StoreError::Poisoned)?;
        events
            .entry(event.job_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn events(&self, job_id: &str) -> Result<Vec<JobEvent>, StoreError> {
        let events = self.events.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(events.get(job_id).cloned().unwrap_or_default())
    }
}

// =========================================================================
// SQLite store
// =========================================================================

/// Store backed by the `jobs` and `job_events` tables
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

/// Fixed-width UTC timestamps so text comparison orders them
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteJobStore {
    pub fn new(db: &VentureDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    fn decode_jobs(conn: &Connection, sql: &str) -> Result<Vec<Job>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(serde_json::from_str(&row?)?);
        }
        Ok(jobs)
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO jobs (id, status, revision, data, created_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                job.id,
                job.status.as_str(),
                job.revision as i64,
                serde_json::to_string(job)?,
                timestamp(job.created_at),
                job.completed_at.map(timestamp),
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(job.id.clone()));
        }
        Ok(())
    }

    fn update(&self, job: &Job, expected_revision: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let updated = conn.execute(
            r#"
            UPDATE jobs SET status = ?2, revision = ?3, data = ?4, completed_at = ?5
            WHERE id = ?1 AND revision = ?6
            "#,
            params![
                job.id,
                job.status.as_str(),
                job.revision as i64,
                serde_json::to_string(job)?,
                job.completed_at.map(timestamp),
                expected_revision as i64,
            ],
        )?;
        if updated == 1 {
            return Ok(());
        }

        let found: Option<i64> = conn
            .query_row(
                "SELECT revision FROM jobs WHERE id = ?1",
                params![job.id],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            Some(found) => Err(StoreError::Conflict {
                job_id: job.id.clone(),
                expected: expected_revision,
                found: found as u64,
            }),
            None => Err(StoreError::Missing(job.id.clone())),
        }
    }

    fn load(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    fn unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Self::decode_jobs(
            &conn,
            "SELECT data FROM jobs WHERE status IN ('pending', 'running') ORDER BY created_at",
        )
    }

    fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;

        let expired: Vec<String> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM jobs
                WHERE status IN ('completed', 'failed')
                  AND completed_at IS NOT NULL AND completed_at < ?1
                "#,
            )?;
            let rows = stmt.query_map(params![timestamp(cutoff)], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        for id in &expired {
            tx.execute("DELETE FROM job_events WHERE job_id = ?1", params![id])?;
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(expired)
    }

    fn append_event(&self, event: &JobEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT OR REPLACE INTO job_events (job_id, sequence, data) VALUES (?1, ?2, ?3)",
            params![
                event.job_id,
                event.sequence as i64,
                serde_json::to_string(event)?
            ],
        )?;
        Ok(())
    }

    fn events(&self, job_id: &str) -> Result<Vec<JobEvent>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt =
            conn.prepare("SELECT data FROM job_events WHERE job_id = ?1 ORDER BY sequence")?;
        let rows = stmt.query_map(params![job_id], |row| row.get::<_, String>(0))?;

        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        Ok(events)
    }
}
