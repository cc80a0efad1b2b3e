//! Multi-stage generation jobs: model, registry, persistence and the orchestrator.

pub mod orchestrator;
pub mod persistence;
pub mod store;
pub mod types;

pub use orchestrator::{JobOrchestrator, JobView, JobsConfig};
pub use persistence::{MemorySnapshotStore, SledSnapshotStore, SnapshotStore};
pub use store::{JobCounts, JobStore, RestorePolicy};
pub use types::{
    AssetRef, FailureKind, GenerationJob, JobFilter, JobId, JobKind, JobPatch, JobPhase,
    JobRequest, JobStatus,
};
