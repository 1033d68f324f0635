//! # Analysis Stages
//!
//! The fixed catalog of analysis stages a job runs through.
//!
//! ## Stage Graph
//!
//! ```text
//! normalize_idea ─┬─▶ market_research ─┬─▶ market_sizing ─┐
//!                 │                    └─▶ competition ───┼─▶ strategy ─▶ report
//!                 └─▶ feasibility ────────────────────────┘
//! ```
//!
//! Only `normalize_idea` is critical: without a normalized idea nothing
//! downstream has anything to analyze.

pub mod outputs;
pub mod prompts;
pub mod task;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::VentureConfig;
use outputs::{
    CompetitionScan, FeasibilityAssessment, FinalReport, NormalizedIdea, OutputSchema,
    StrategyRecommendation,
};

pub use task::{
    DependencyInput, NoopObserver, RetryPolicy, StageInput, StageObserver, StageRun, StageTask,
};

/// Name of a pipeline stage. Declaration order is pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    NormalizeIdea,
    MarketResearch,
    MarketSizing,
    Competition,
    Feasibility,
    Strategy,
    Report,
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        StageName::NormalizeIdea,
        StageName::MarketResearch,
        StageName::MarketSizing,
        StageName::Competition,
        StageName::Feasibility,
        StageName::Strategy,
        StageName::Report,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::NormalizeIdea => "normalize_idea",
            StageName::MarketResearch => "market_research",
            StageName::MarketSizing => "market_sizing",
            StageName::Competition => "competition",
            StageName::Feasibility => "feasibility",
            StageName::Strategy => "strategy",
            StageName::Report => "report",
        }
    }

    pub fn parse(name: &str) -> Option<StageName> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Position in the pipeline (0-based)
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    /// Human-readable label used in event messages
    pub fn label(&self) -> &'static str {
        match self {
            StageName::NormalizeIdea => "Normalizing idea",
            StageName::MarketResearch => "Researching market",
            StageName::MarketSizing => "Sizing market",
            StageName::Competition => "Scanning competitors",
            StageName::Feasibility => "Evaluating feasibility",
            StageName::Strategy => "Recommending strategy",
            StageName::Report => "Compiling report",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage failure means for the job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Failure fails the job and halts the pipeline
    Critical,
    /// Failure is replaced with a placeholder and the pipeline continues
    BestEffort,
}

/// Static description of one stage
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: StageName,
    /// Stages whose output this stage consumes
    pub depends_on: Vec<StageName>,
    pub criticality: Criticality,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Provider retries after the first attempt
    pub retry_budget: u32,
    pub output: OutputSchema,
    /// Model override for this stage
    pub model: Option<String>,
}

impl StageSpec {
    pub fn ordinal(&self) -> u8 {
        self.name.ordinal()
    }

    pub fn is_critical(&self) -> bool {
        self.criticality == Criticality::Critical
    }
}

/// Per-stage tuning overrides from config
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
}

/// Build the stage catalog with timeouts and budgets from config
pub fn catalog(config: &VentureConfig) -> Vec<StageSpec> {
    use StageName::*;

    let definitions: [(StageName, &[StageName], Criticality, OutputSchema); 7] = [
        (
            NormalizeIdea,
            &[],
            Criticality::Critical,
            OutputSchema::of::<NormalizedIdea>(),
        ),
        (
            MarketResearch,
            &[NormalizeIdea],
            Criticality::BestEffort,
            OutputSchema::of::<outputs::MarketResearch>(),
        ),
        (
            MarketSizing,
            &[NormalizeIdea, MarketResearch],
            Criticality::BestEffort,
            OutputSchema::of::<outputs::MarketSizing>(),
        ),
        (
            Competition,
            &[NormalizeIdea, MarketResearch],
            Criticality::BestEffort,
            OutputSchema::of::<CompetitionScan>(),
        ),
        (
            Feasibility,
            &[NormalizeIdea],
            Criticality::BestEffort,
            OutputSchema::of::<FeasibilityAssessment>(),
        ),
        (
            Strategy,
            &[NormalizeIdea, MarketSizing, Competition, Feasibility],
            Criticality::BestEffort,
            OutputSchema::of::<StrategyRecommendation>(),
        ),
        (
            Report,
            &[
                NormalizeIdea,
                MarketResearch,
                MarketSizing,
                Competition,
                Feasibility,
                Strategy,
            ],
            Criticality::BestEffort,
            OutputSchema::of::<FinalReport>(),
        ),
    ];

    definitions
        .into_iter()
        .map(|(name, deps, criticality, output)| {
            let tuning = config
                .stage_overrides
                .get(name.as_str())
                .cloned()
                .unwrap_or_default();
            StageSpec {
                name,
                depends_on: deps.to_vec(),
                criticality,
                timeout: Duration::from_secs(
                    tuning.timeout_secs.unwrap_or(config.stage_timeout_secs),
                ),
                retry_budget: tuning.retries.unwrap_or(config.retry_budget),
                output,
                model: config.per_stage_models.get(name.as_str()).cloned(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_ordering_matches_ordinals() {
        for (i, stage) in StageName::ALL.iter().enumerate() {
            assert_eq!(stage.ordinal() as usize, i);
            assert_eq!(StageName::parse(stage.as_str()), Some(*stage));
        }
        assert!(StageName::NormalizeIdea < StageName::Report);
    }

    #[test]
    fn test_catalog_defaults() {
        let specs = catalog(&VentureConfig::default());
        assert_eq!(specs.len(), StageName::ALL.len());

        let critical: Vec<_> = specs.iter().filter(|s| s.is_critical()).collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].name, StageName::NormalizeIdea);

        // Every dependency points backwards
        for spec in &specs {
            for dep in &spec.depends_on {
                assert!(dep < &spec.name, "{} depends on later {}", spec.name, dep);
            }
        }
    }

    #[test]
    fn test_catalog_pairs_each_stage_with_its_output_schema() {
        for spec in catalog(&VentureConfig::default()) {
            assert_eq!(spec.output.name, spec.name.as_str());
        }
    }

    #[test]
    fn test_catalog_applies_overrides() {
        let mut config = VentureConfig::default();
        config.stage_overrides.insert(
            "market_research".to_string(),
            StageOverride {
                timeout_secs: Some(5),
                retries: Some(0),
            },
        );
        config
            .per_stage_models
            .insert("report".to_string(), "gpt-4o-mini".to_string());

        let specs = catalog(&config);
        let research = &specs[StageName::MarketResearch.ordinal() as usize];
        assert_eq!(research.timeout, Duration::from_secs(5));
        assert_eq!(research.retry_budget, 0);

        let sizing = &specs[StageName::MarketSizing.ordinal() as usize];
        assert_eq!(sizing.timeout, Duration::from_secs(config.stage_timeout_secs));
        assert_eq!(specs[6].model.as_deref(), Some("gpt-4o-mini"));
    }
}
