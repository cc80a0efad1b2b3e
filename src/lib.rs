//! genforge: queued, multi-stage content generation
//!
//! A bounded-concurrency task queue with rate-limit-aware retries, a job registry that drives
//! each request through content and illustration stages, and an extractor that recovers
//! structured records from unreliable model output.

pub mod cli;
pub mod config;
pub mod content;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod logging;
pub mod provider;
pub mod queue;

pub use error::{ApiError, ExtractionFailure, StorageError};
pub use jobs::{JobId, JobKind, JobOrchestrator, JobStatus, JobStore};
pub use queue::{QueueConfig, TaskQueue};
