//! Stage-transition events pushed to live subscribers and kept in each job's
//! event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobFailure;
use crate::stages::StageName;
use crate::state::{Job, JobStatus};

/// Payloads serializing to this many bytes or more are truncated in events
pub const EXCERPT_LIMIT: usize = 2048;

/// Kind of transition an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Progressed,
    Completed,
    Failed,
}

/// A job or stage transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    /// Position in the job's event log, assigned on append
    #[serde(default)]
    pub sequence: u64,
    /// `None` for job-scoped events
    pub stage_name: Option<StageName>,
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl JobEvent {
    fn new(job_id: &str, stage_name: Option<StageName>, kind: EventKind, message: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            sequence: 0,
            stage_name,
            kind,
            message,
            timestamp: Utc::now(),
            payload: None,
        }
    }

    pub fn job_started(job_id: &str) -> Self {
        Self::new(job_id, None, EventKind::Started, "Validation started".to_string())
    }

    pub fn stage_started(job_id: &str, stage: StageName) -> Self {
        Self::new(job_id, Some(stage), EventKind::Started, stage.label().to_string())
    }

    pub fn stage_progressed(job_id: &str, stage: StageName, message: impl Into<String>) -> Self {
        Self::new(job_id, Some(stage), EventKind::Progressed, message.into())
    }

    pub fn stage_completed(job_id: &str, stage: StageName, payload: &Value) -> Self {
        let mut event = Self::new(
            job_id,
            Some(stage),
            EventKind::Completed,
            format!("{} complete", stage),
        );
        event.payload = Some(excerpt(payload));
        event
    }

    pub fn stage_failed(job_id: &str, stage: StageName, message: impl Into<String>) -> Self {
        Self::new(job_id, Some(stage), EventKind::Failed, message.into())
    }

    pub fn job_completed(job_id: &str) -> Self {
        Self::new(job_id, None, EventKind::Completed, "Validation complete".to_string())
    }

    pub fn job_failed(job_id: &str, failure: &JobFailure) -> Self {
        Self::new(job_id, None, EventKind::Failed, failure.to_string())
    }

    /// Hint sent to a subscriber that fell behind the live channel. Carries
    /// the stage of the last event that subscriber saw so ordering holds.
    pub fn resync(job_id: &str, last_stage: Option<StageName>, missed: u64) -> Self {
        Self::new(
            job_id,
            last_stage,
            EventKind::Progressed,
            format!("Missed {} events; refresh the job snapshot", missed),
        )
    }

    /// Terminal event reconstructed from a finished job
    pub fn terminal_from(job: &Job) -> Option<Self> {
        let mut event = match job.status {
            JobStatus::Completed => Self::job_completed(&job.id),
            JobStatus::Failed => match &job.terminal_error {
                Some(failure) => Self::job_failed(&job.id, failure),
                None => Self::new(&job.id, None, EventKind::Failed, "Validation failed".to_string()),
            },
            JobStatus::Pending | JobStatus::Running => return None,
        };
        if let Some(at) = job.completed_at {
            event.timestamp = at;
        }
        Some(event)
    }

    /// The single job-scoped Completed or Failed event
    pub fn is_terminal(&self) -> bool {
        self.stage_name.is_none() && matches!(self.kind, EventKind::Completed | EventKind::Failed)
    }

    /// Ordering key: job start first, stages by ordinal, terminal last
    pub fn ordinal(&self) -> u16 {
        match self.stage_name {
            Some(stage) => 1 + stage.ordinal() as u16,
            None if self.is_terminal() => u16::MAX,
            None => 0,
        }
    }
}

/// The payload itself when small, else a truncated text preview
pub fn excerpt(payload: &Value) -> Value {
    let text = payload.to_string();
    if text.len() < EXCERPT_LIMIT {
        return payload.clone();
    }
    let mut preview: String = text.chars().take(EXCERPT_LIMIT).collect();
    preview.push_str("...");
    Value::String(preview)
}
