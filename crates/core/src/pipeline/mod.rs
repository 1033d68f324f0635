//! # Job Pipeline
//!
//! Orchestration layer: runs jobs through the stage plan and fans their
//! progress out to viewers.
//!
//! ```text
//! submit ──▶ PipelineController ──▶ StageTask ──▶ InferenceClient
//!                  │      │
//!                  │      └──▶ JobRegistry (merge) ──▶ JobSnapshot / aggregate
//!                  └──▶ EventBroadcaster ──▶ SSE / WebSocket subscribers
//! ```

pub mod aggregate;
pub mod broadcaster;
pub mod controller;
pub mod events;
pub mod machine;

pub use aggregate::{aggregate, AggregatedReport, JobSnapshot, Section, Unavailable};
pub use broadcaster::{EventBroadcaster, EventStream};
pub use controller::PipelineController;
pub use events::{EventKind, JobEvent};
pub use machine::{Decision, ExecutionPlan, JobMachine, MachineState, StageOutcome};
