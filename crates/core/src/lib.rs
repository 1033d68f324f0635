//! # Venture Core
//!
//! Job orchestration for AI business-idea validation. A submitted idea is
//! driven through a fixed sequence of analysis stages, each backed by an LLM
//! call, with per-stage failure tolerance and live progress for viewers.
//!
//! ## Architecture
//!
//! - `inference/` - Uniform LLM client, concurrency limiter, offline backend
//! - `stages/` - Stage catalog, output schemas, prompts and the stage task
//! - `state/` - Job record, registry, durable store, idea storage
//! - `pipeline/` - Controller, state machine, events, broadcaster, aggregator
//! - `models` - LLM provider configuration
//! - `config` - Runtime settings
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use venture_core::inference::CannedClient;
//! use venture_core::pipeline::{EventBroadcaster, PipelineController};
//! use venture_core::state::{JobRegistry, MemoryIdeaStorage};
//! use venture_core::VentureConfig;
//!
//! let config = VentureConfig::default();
//! let registry = Arc::new(JobRegistry::in_memory());
//! let broadcaster = Arc::new(EventBroadcaster::new(registry.clone(), config.event_buffer));
//! let controller = PipelineController::new(
//!     &config,
//!     registry,
//!     broadcaster,
//!     Arc::new(CannedClient::new()),
//!     Arc::new(MemoryIdeaStorage::new()),
//! )?;
//! let job = controller.run("On-demand dog walking", "job-1").await?;
//! ```

pub mod config;
pub mod error;
pub mod inference;
pub mod models;
pub mod pipeline;
pub mod stages;
pub mod state;

pub use config::VentureConfig;
pub use error::{
    JobFailure, PlanError, ProviderError, RegistryError, StageError, StoreError, SubmitError,
};
