//! # Result Aggregator
//!
//! Pure merge of whatever stage results a job holds into the fixed report
//! shape consumed by clients and by idea storage. Same job in, same bytes
//! out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stages::StageName;
use crate::state::{Job, JobStatus, StagePayload};

/// Why a section has no data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Unavailable {
    /// The stage ran and failed
    StageFailed { message: String },
    /// The job failed before the stage ran
    Skipped,
}

/// One report section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Section {
    Ready(Value),
    Pending,
    Unavailable(Unavailable),
}

impl Section {
    pub fn is_ready(&self) -> bool {
        matches!(self, Section::Ready(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Section::Unavailable(_))
    }
}

/// Canonical report, one field per stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedReport {
    pub normalized_idea: Section,
    pub market_research: Section,
    pub market_sizing: Section,
    pub competition: Section,
    pub feasibility: Section,
    pub strategy: Section,
    pub report: Section,
}

impl AggregatedReport {
    pub fn section(&self, stage: StageName) -> &Section {
        match stage {
            StageName::NormalizeIdea => &self.normalized_idea,
            StageName::MarketResearch => &self.market_research,
            StageName::MarketSizing => &self.market_sizing,
            StageName::Competition => &self.competition,
            StageName::Feasibility => &self.feasibility,
            StageName::Strategy => &self.strategy,
            StageName::Report => &self.report,
        }
    }

    pub fn ready_count(&self) -> usize {
        StageName::ALL
            .iter()
            .filter(|stage| self.section(**stage).is_ready())
            .count()
    }
}

fn section_for(job: &Job, stage: StageName) -> Section {
    match job.stage_results.get(&stage) {
        Some(result) if result.succeeded => match &result.payload {
            StagePayload::Data(value) => Section::Ready(value.clone()),
            StagePayload::Placeholder { reason } => Section::Unavailable(Unavailable::StageFailed {
                message: reason.clone(),
            }),
        },
        Some(result) => {
            let message = match (&result.error, &result.payload) {
                (Some(error), _) => error.clone(),
                (None, StagePayload::Placeholder { reason }) => reason.clone(),
                (None, StagePayload::Data(_)) => "stage failed".to_string(),
            };
            Section::Unavailable(Unavailable::StageFailed { message })
        }
        None if job.status == JobStatus::Failed => Section::Unavailable(Unavailable::Skipped),
        None => Section::Pending,
    }
}

/// Merge a job's stage results into the report shape
pub fn aggregate(job: &Job) -> AggregatedReport {
    AggregatedReport {
        normalized_idea: section_for(job, StageName::NormalizeIdea),
        market_research: section_for(job, StageName::MarketResearch),
        market_sizing: section_for(job, StageName::MarketSizing),
        competition: section_for(job, StageName::Competition),
        feasibility: section_for(job, StageName::Feasibility),
        strategy: section_for(job, StageName::Strategy),
        report: section_for(job, StageName::Report),
    }
}

/// Pollable view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_stage: Option<StageName>,
    pub results: AggregatedReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn of(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            current_stage: job.current_stage,
            results: aggregate(job),
            error: job.terminal_error.as_ref().map(|e| e.to_string()),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobFailure;
    use crate::state::{JobOutcome, StageResult};
    use serde_json::json;

    fn partial_job() -> Job {
        let mut job = Job::new("job", "idea");
        job.apply_stage_result(StageName::NormalizeIdea, StageResult::success(json!({"title": "T"}), 1))
            .unwrap();
        job.apply_stage_result(StageName::MarketResearch, StageResult::failure("timed out", 3))
            .unwrap();
        job
    }

    #[test]
    fn test_sections_reflect_results() {
        let report = aggregate(&partial_job());
        assert_eq!(report.normalized_idea, Section::Ready(json!({"title": "T"})));
        assert_eq!(
            report.market_research,
            Section::Unavailable(Unavailable::StageFailed {
                message: "timed out".to_string()
            })
        );
        assert_eq!(report.market_sizing, Section::Pending);
        assert_eq!(report.ready_count(), 1);
    }

    #[test]
    fn test_failed_job_marks_missing_stages_skipped() {
        let mut job = partial_job();
        job.finalize(JobOutcome::Failed(JobFailure::JobTimeout { after_secs: 1 }))
            .unwrap();
        let report = aggregate(&job);
        assert_eq!(report.strategy, Section::Unavailable(Unavailable::Skipped));
        assert!(report.normalized_idea.is_ready());
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(aggregate(&partial_job())).unwrap();
        assert_eq!(json["normalizedIdea"]["status"], "ready");
        assert_eq!(json["normalizedIdea"]["data"]["title"], "T");
        assert_eq!(json["marketResearch"]["status"], "unavailable");
        assert_eq!(json["marketResearch"]["data"]["reason"], "stage_failed");
        assert_eq!(json["marketSizing"], json!({"status": "pending"}));
    }

    #[test]
    fn test_aggregate_is_deterministic() {
        let job = partial_job();
        let copy: Job = serde_json::from_str(&serde_json::to_string(&job).unwrap()).unwrap();

        let first = serde_json::to_string(&aggregate(&job)).unwrap();
        let second = serde_json::to_string(&aggregate(&copy)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_snapshot_carries_error() {
        let mut job = partial_job();
        job.finalize(JobOutcome::Failed(JobFailure::CriticalStageFailure {
            stage: StageName::NormalizeIdea,
            message: "bad".into(),
        }))
        .unwrap();
        let snapshot = serde_json::to_value(JobSnapshot::of(&job)).unwrap();
        assert_eq!(snapshot["jobId"], "job");
        assert_eq!(snapshot["status"], "failed");
        assert_eq!(snapshot["error"], "normalize_idea could not be completed: bad");
        assert!(snapshot["currentStage"].is_null());
    }
}
