//! # Job Record
//!
//! The canonical record of one validation job and the transitions allowed on
//! it. Transitions are pure; the registry serializes them per job and bumps
//! the revision.
//!
//! ```text
//! Pending ──▶ Running ──┬──▶ Completed
//!                       └──▶ Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{JobFailure, RegistryError};
use crate::stages::StageName;

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Position in the lifecycle; never decreases for a job
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed => 2,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage left behind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StagePayload {
    /// Validated stage output
    Data(Value),
    /// Stand-in for a failed stage
    Placeholder { reason: String },
}

impl StagePayload {
    pub fn data(&self) -> Option<&Value> {
        match self {
            StagePayload::Data(value) => Some(value),
            StagePayload::Placeholder { .. } => None,
        }
    }
}

/// Result of one stage attempt sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    pub payload: StagePayload,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Inference calls issued
    #[serde(default)]
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl StageResult {
    pub fn success(payload: Value, attempts: u32) -> Self {
        Self {
            payload: StagePayload::Data(payload),
            succeeded: true,
            error: None,
            attempts,
            timestamp: Utc::now(),
        }
    }

    /// A failed stage, recorded with a placeholder payload
    pub fn failure(error: impl Into<String>, attempts: u32) -> Self {
        let error = error.into();
        Self {
            payload: StagePayload::Placeholder {
                reason: error.clone(),
            },
            succeeded: false,
            error: Some(error),
            attempts,
            timestamp: Utc::now(),
        }
    }
}

/// How a job ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}

/// A validation job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub idea_text: String,
    /// Output of `normalize_idea`, once it succeeds
    #[serde(default)]
    pub normalized_idea: Option<Value>,
    pub status: JobStatus,
    /// 0 to 100, never decreasing
    pub progress: u8,
    #[serde(default)]
    pub current_stage: Option<StageName>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terminal_error: Option<JobFailure>,
    /// Per-stage results in pipeline order
    #[serde(default)]
    pub stage_results: BTreeMap<StageName, StageResult>,
    /// Incremented on every committed write
    #[serde(default)]
    pub revision: u64,
}

impl Job {
    pub fn new(id: impl Into<String>, idea_text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            idea_text: idea_text.into(),
            normalized_idea: None,
            status: JobStatus::Pending,
            progress: 0,
            current_stage: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            terminal_error: None,
            stage_results: BTreeMap::new(),
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn reject(&self, to: JobStatus) -> RegistryError {
        RegistryError::InvalidTransition {
            job_id: self.id.clone(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Enter `stage`, moving Pending to Running
    pub fn start_stage(&mut self, stage: StageName) -> Result<(), RegistryError> {
        if self.is_terminal() {
            return Err(self.reject(JobStatus::Running));
        }
        self.status = JobStatus::Running;
        self.current_stage = Some(stage);
        Ok(())
    }

    /// Merge a stage result and recompute progress
    pub fn apply_stage_result(
        &mut self,
        stage: StageName,
        result: StageResult,
    ) -> Result<(), RegistryError> {
        if self.is_terminal() {
            return Err(self.reject(JobStatus::Running));
        }
        self.status = JobStatus::Running;
        self.current_stage = Some(stage);

        if stage == StageName::NormalizeIdea && result.succeeded {
            self.normalized_idea = result.payload.data().cloned();
        }
        self.stage_results.insert(stage, result);

        let attempted = self.stage_results.len() * 100 / StageName::ALL.len();
        self.progress = self.progress.max(attempted.min(100) as u8);
        Ok(())
    }

    /// Enter a terminal status. A Pending job that never started a stage
    /// (restart recovery, an early job timeout) goes straight to it.
    pub fn finalize(&mut self, outcome: JobOutcome) -> Result<(), RegistryError> {
        let to = outcome.status();
        if self.is_terminal() {
            return Err(self.reject(to));
        }

        self.status = to;
        self.current_stage = None;
        self.completed_at = Some(Utc::now());
        match outcome {
            JobOutcome::Completed => self.progress = 100,
            JobOutcome::Failed(failure) => self.terminal_error = Some(failure),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_tracks_attempted_stages() {
        let mut job = Job::new("j1", "idea");
        job.start_stage(StageName::NormalizeIdea).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, 0);

        job.apply_stage_result(StageName::NormalizeIdea, StageResult::success(json!({"title": "T"}), 1))
            .unwrap();
        assert_eq!(job.progress, 14);
        assert_eq!(job.normalized_idea, Some(json!({"title": "T"})));

        job.apply_stage_result(StageName::MarketResearch, StageResult::failure("timed out", 3))
            .unwrap();
        assert_eq!(job.progress, 28);

        // Re-applying a stage never lowers progress
        job.apply_stage_result(StageName::MarketResearch, StageResult::failure("again", 1))
            .unwrap();
        assert_eq!(job.progress, 28);

        job.finalize(JobOutcome::Completed).unwrap();
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
        assert_eq!(job.current_stage, None);
    }

    #[test]
    fn test_terminal_jobs_reject_transitions() {
        let mut job = Job::new("j2", "idea");
        job.finalize(JobOutcome::Failed(JobFailure::JobTimeout { after_secs: 5 }))
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        assert!(matches!(
            job.finalize(JobOutcome::Completed),
            Err(RegistryError::InvalidTransition { .. })
        ));
        assert!(job.start_stage(StageName::Report).is_err());
        assert!(job
            .apply_stage_result(StageName::Report, StageResult::success(json!({}), 1))
            .is_err());
    }

    #[test]
    fn test_failed_normalization_leaves_idea_empty() {
        let mut job = Job::new("j3", "idea");
        job.apply_stage_result(StageName::NormalizeIdea, StageResult::failure("bad", 2))
            .unwrap();
        assert!(job.normalized_idea.is_none());
        assert!(matches!(
            job.stage_results[&StageName::NormalizeIdea].payload,
            StagePayload::Placeholder { .. }
        ));
    }

    #[test]
    fn test_status_ranks_are_monotone() {
        assert!(JobStatus::Pending.rank() < JobStatus::Running.rank());
        assert!(JobStatus::Running.rank() < JobStatus::Completed.rank());
        assert_eq!(JobStatus::Completed.rank(), JobStatus::Failed.rank());
    }

    #[test]
    fn test_job_round_trips_through_json() {
        let mut job = Job::new("j4", "idea");
        job.apply_stage_result(StageName::NormalizeIdea, StageResult::success(json!({"a": 1}), 1))
            .unwrap();
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"stageResults\""));
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_pending_job_finalizes_directly() {
        let mut job = Job::new("j1", "idea");
        job.finalize(JobOutcome::Failed(JobFailure::Interrupted)).unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert!(job.current_stage.is_none());
        assert_eq!(job.progress, 0);
        assert!(job.finalize(JobOutcome::Completed).is_err());
    }
}
