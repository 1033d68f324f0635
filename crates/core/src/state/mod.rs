pub mod db;
pub mod job;
pub mod registry;
pub mod reports;
pub mod store;

pub use db::VentureDb;

pub use job::{Job, JobOutcome, JobStatus, StagePayload, StageResult};
pub use registry::JobRegistry;
pub use reports::{IdeaStorage, MemoryIdeaStorage, SqliteIdeaStorage};
pub use store::{JobStore, MemoryJobStore, SqliteJobStore};
