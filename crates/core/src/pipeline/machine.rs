//! # Job State Machine
//!
//! The partial-failure policy as data, plus the execution plan that orders
//! stages into waves. Neither touches the network.
//!
//! ```text
//! Pending ──▶ Running(stage₀) ──▶ … ──▶ Running(stageₙ) ──▶ Completed
//!                    │                        │
//!                    └── critical failure ────┴──────────▶ Failed
//! ```

use std::collections::{BTreeMap, HashSet};

use crate::error::PlanError;
use crate::stages::{Criticality, StageName, StageSpec};

/// How a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed,
}

/// What the pipeline does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Abort,
}

/// Position of a job in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Pending,
    Running(StageName),
    Completed,
    Failed,
}

/// Tracks one job's walk through the stages
#[derive(Debug, Clone)]
pub struct JobMachine {
    state: MachineState,
    attempted: Vec<StageName>,
}

impl Default for JobMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl JobMachine {
    pub fn new() -> Self {
        Self {
            state: MachineState::Pending,
            attempted: Vec::new(),
        }
    }

    /// The partial-failure policy
    pub fn decide(criticality: Criticality, outcome: StageOutcome) -> Decision {
        match (criticality, outcome) {
            (_, StageOutcome::Succeeded) => Decision::Continue,
            (Criticality::BestEffort, StageOutcome::Failed) => Decision::Continue,
            (Criticality::Critical, StageOutcome::Failed) => Decision::Abort,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, MachineState::Completed | MachineState::Failed)
    }

    /// Stages recorded so far, in the order they finished
    pub fn attempted(&self) -> &[StageName] {
        &self.attempted
    }

    /// Enter a stage. Returns false once the machine is terminal.
    pub fn begin(&mut self, stage: StageName) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.state = MachineState::Running(stage);
        true
    }

    /// Record a stage's outcome and apply the policy
    pub fn record(&mut self, spec: &StageSpec, outcome: StageOutcome) -> Decision {
        if self.is_terminal() {
            return Decision::Abort;
        }
        self.attempted.push(spec.name);
        let decision = Self::decide(spec.criticality, outcome);
        if decision == Decision::Abort {
            self.state = MachineState::Failed;
        }
        decision
    }

    /// Close the walk: Completed unless a critical stage failed
    pub fn finish(&mut self) -> MachineState {
        if self.state != MachineState::Failed {
            self.state = MachineState::Completed;
        }
        self.state
    }
}

/// Stages grouped into waves that may run concurrently
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    waves: Vec<Vec<StageSpec>>,
}

impl ExecutionPlan {
    /// One stage per wave, in ordinal order
    pub fn sequential(specs: Vec<StageSpec>) -> Result<Self, PlanError> {
        let specs = Self::validate(specs)?;
        Ok(Self {
            waves: specs.into_iter().map(|spec| vec![spec]).collect(),
        })
    }

    /// Stages join the earliest wave after all their dependencies, but never
    /// an earlier wave than a lower-ordinal stage.
    pub fn parallel(specs: Vec<StageSpec>) -> Result<Self, PlanError> {
        let specs = Self::validate(specs)?;

        let mut wave_of: BTreeMap<StageName, usize> = BTreeMap::new();
        let mut waves: Vec<Vec<StageSpec>> = Vec::new();
        let mut floor = 0;

        for spec in specs {
            let after_deps = spec
                .depends_on
                .iter()
                .filter_map(|dep| wave_of.get(dep))
                .map(|wave| wave + 1)
                .max()
                .unwrap_or(0);
            let wave = after_deps.max(floor);
            floor = wave;

            wave_of.insert(spec.name, wave);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(spec);
        }

        Ok(Self { waves })
    }

    fn validate(mut specs: Vec<StageSpec>) -> Result<Vec<StageSpec>, PlanError> {
        if specs.is_empty() {
            return Err(PlanError::Empty);
        }
        specs.sort_by_key(|spec| spec.ordinal());

        let mut seen = HashSet::new();
        for spec in &specs {
            if !seen.insert(spec.name) {
                return Err(PlanError::DuplicateStage(spec.name));
            }
        }
        for spec in &specs {
            for dep in &spec.depends_on {
                if dep.ordinal() >= spec.ordinal() || !seen.contains(dep) {
                    return Err(PlanError::ForwardDependency {
                        stage: spec.name,
                        dependency: *dep,
                    });
                }
            }
        }
        Ok(specs)
    }

    pub fn waves(&self) -> &[Vec<StageSpec>] {
        &self.waves
    }

    /// Every stage in ordinal order
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.waves.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::catalog;
    use crate::VentureConfig;

    fn specs() -> Vec<StageSpec> {
        catalog(&VentureConfig::default())
    }

    fn spec(name: StageName) -> StageSpec {
        specs().into_iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn test_policy_table() {
        use Criticality::*;
        assert_eq!(JobMachine::decide(Critical, StageOutcome::Succeeded), Decision::Continue);
        assert_eq!(JobMachine::decide(BestEffort, StageOutcome::Succeeded), Decision::Continue);
        assert_eq!(JobMachine::decide(BestEffort, StageOutcome::Failed), Decision::Continue);
        assert_eq!(JobMachine::decide(Critical, StageOutcome::Failed), Decision::Abort);
    }

    #[test]
    fn test_best_effort_failures_still_complete() {
        let mut machine = JobMachine::new();
        for stage in specs() {
            assert!(machine.begin(stage.name));
            let outcome = if stage.is_critical() {
                StageOutcome::Succeeded
            } else {
                StageOutcome::Failed
            };
            assert_eq!(machine.record(&stage, outcome), Decision::Continue);
        }
        assert_eq!(machine.finish(), MachineState::Completed);
        assert_eq!(machine.attempted().len(), StageName::ALL.len());
    }

    #[test]
    fn test_critical_failure_halts() {
        let mut machine = JobMachine::new();
        let normalize = spec(StageName::NormalizeIdea);
        machine.begin(normalize.name);
        assert_eq!(machine.record(&normalize, StageOutcome::Failed), Decision::Abort);
        assert_eq!(machine.state(), MachineState::Failed);

        assert!(!machine.begin(StageName::MarketResearch));
        assert_eq!(machine.finish(), MachineState::Failed);
    }

    #[test]
    fn test_sequential_plan() {
        let plan = ExecutionPlan::sequential(specs()).unwrap();
        assert_eq!(plan.waves().len(), StageName::ALL.len());
        let order: Vec<_> = plan.stages().map(|s| s.name).collect();
        assert_eq!(order, StageName::ALL.to_vec());
    }

    #[test]
    fn test_parallel_waves_are_ordinal_monotone() {
        let plan = ExecutionPlan::parallel(specs()).unwrap();
        let waves: Vec<Vec<StageName>> = plan
            .waves()
            .iter()
            .map(|w| w.iter().map(|s| s.name).collect())
            .collect();
        assert_eq!(
            waves,
            vec![
                vec![StageName::NormalizeIdea],
                vec![StageName::MarketResearch],
                vec![
                    StageName::MarketSizing,
                    StageName::Competition,
                    StageName::Feasibility
                ],
                vec![StageName::Strategy],
                vec![StageName::Report],
            ]
        );
        assert_eq!(plan.len(), StageName::ALL.len());
    }

    #[test]
    fn test_plan_rejects_forward_dependency() {
        let mut bad = specs();
        bad[1].depends_on.push(StageName::Report);
        assert_eq!(
            ExecutionPlan::sequential(bad).unwrap_err(),
            PlanError::ForwardDependency {
                stage: StageName::MarketResearch,
                dependency: StageName::Report,
            }
        );

        let mut dup = specs();
        dup.push(spec(StageName::Strategy));
        assert_eq!(
            ExecutionPlan::parallel(dup).unwrap_err(),
            PlanError::DuplicateStage(StageName::Strategy)
        );
        assert_eq!(ExecutionPlan::sequential(Vec::new()).unwrap_err(), PlanError::Empty);
    }
}
