//! Error types for the genforge job pipeline.

use crate::jobs::JobId;
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt job snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("Unsupported job snapshot version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Failure to recover a structured record from generated text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionFailure {
    #[error("NoJsonFound")]
    NoJsonFound,

    #[error("MalformedJson: {0}")]
    MalformedJson(String),
}

impl ExtractionFailure {
    /// Short name of the failure kind, used as the job error message.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExtractionFailure::NoJsonFound => "NoJsonFound",
            ExtractionFailure::MalformedJson(_) => "MalformedJson",
        }
    }
}

/// Errors surfaced by the queue, job store, orchestrator and generation backends.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job is still active: {0}")]
    JobStillActive(JobId),

    #[error("Task rejected: {0}")]
    QueueRejection(String),

    #[error("Rate limited (429) after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Task timed out after {0:?}")]
    TaskTimeout(std::time::Duration),

    #[error("Job timed out: {0}")]
    JobTimeout(String),

    #[error("Asset generation failed: {0}")]
    AssetFailure(String),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionFailure),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Provider request failed: {0}")]
    ProviderRequestFailed(String),

    #[error("Provider authentication failed: {0}")]
    ProviderAuthFailed(String),

    #[error("Provider rate limit exceeded: {0}")]
    ProviderRateLimit(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ApiError {
    /// Whether this rejection carries the upstream rate-limit marker.
    ///
    /// Backends signal rate limiting either through [`ApiError::ProviderRateLimit`] or by
    /// including `429` in the rejection message.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            ApiError::ProviderRateLimit(_) => true,
            ApiError::RateLimited { .. } => true,
            other => other.to_string().contains("429"),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::StorageError(err.to_string())
    }
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}
