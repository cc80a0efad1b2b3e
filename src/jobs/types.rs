//! Job model: identifiers, kinds, the status state machine and failure classification.

use crate::content::JobContent;
use crate::error::ApiError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Time-ordered job identifier (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|e| ApiError::ConfigError(format!("Invalid job id '{}': {}", s, e)))
    }
}

/// The fixed set of things a job can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Article,
    Quiz,
    Flashcards,
    Recipe,
    Story,
}

impl JobKind {
    pub const ALL: [JobKind; 5] = [
        JobKind::Article,
        JobKind::Quiz,
        JobKind::Flashcards,
        JobKind::Recipe,
        JobKind::Story,
    ];

    /// Kinds that get an illustration after their content is generated.
    pub const ASSET_KINDS: [JobKind; 3] = [JobKind::Article, JobKind::Recipe, JobKind::Story];

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Article => "article",
            JobKind::Quiz => "quiz",
            JobKind::Flashcards => "flashcards",
            JobKind::Recipe => "recipe",
            JobKind::Story => "story",
        }
    }

    pub fn supports_asset(self) -> bool {
        Self::ASSET_KINDS.contains(&self)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| ApiError::ConfigError(format!("Unknown job kind: {}", s)))
    }
}

/// Job lifecycle.
///
/// ```text
/// pending -> generating -> content-complete -> [image-generating -> complete] | complete
/// (any non-terminal state) -> error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Generating,
    ContentComplete,
    ImageGenerating,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Generating => "generating",
            JobStatus::ContentComplete => "content-complete",
            JobStatus::ImageGenerating => "image-generating",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Generating => 1,
            JobStatus::ContentComplete => 2,
            JobStatus::ImageGenerating => 3,
            JobStatus::Complete | JobStatus::Error => 4,
        }
    }

    /// Forward-only: a settled status never changes and nothing moves backwards.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == JobStatus::Error || next.rank() >= self.rank()
    }

    pub fn phase(self) -> JobPhase {
        match self {
            JobStatus::Pending => JobPhase::Queued,
            JobStatus::Generating | JobStatus::ContentComplete | JobStatus::ImageGenerating => {
                JobPhase::Running
            }
            JobStatus::Complete | JobStatus::Error => JobPhase::Settled,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        [
            JobStatus::Pending,
            JobStatus::Generating,
            JobStatus::ContentComplete,
            JobStatus::ImageGenerating,
            JobStatus::Complete,
            JobStatus::Error,
        ]
        .into_iter()
        .find(|st| st.as_str() == wanted)
        .ok_or_else(|| ApiError::ConfigError(format!("Unknown job status: {}", s)))
    }
}

/// Coarse observability phase: waiting for a queue slot, executing, or done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Running,
    Settled,
}

/// Classification of a job failure, used for the short user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    TimedOut,
    MalformedResponse,
    Cancelled,
    Upstream,
}

impl FailureKind {
    pub fn from_error(err: &ApiError) -> Self {
        match err {
            ApiError::Extraction(_) => FailureKind::MalformedResponse,
            ApiError::TaskTimeout(_) | ApiError::JobTimeout(_) => FailureKind::TimedOut,
            ApiError::Cancelled => FailureKind::Cancelled,
            e if e.is_rate_limited() => FailureKind::RateLimited,
            _ => FailureKind::Upstream,
        }
    }

    pub fn user_message(self) -> &'static str {
        match self {
            FailureKind::RateLimited => {
                "The generator is busy right now. Please try again in a minute."
            }
            FailureKind::TimedOut => "Generation took too long and was stopped.",
            FailureKind::MalformedResponse => {
                "The generator returned a response we could not read."
            }
            FailureKind::Cancelled => "The job was cancelled.",
            FailureKind::Upstream => "Generation failed. Please try again.",
        }
    }
}

/// Reference to a generated auxiliary asset (an illustration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// What a caller asks for when submitting a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: JobKind,
    pub owner_id: String,
    pub prompt: String,
    #[serde(default)]
    pub form: BTreeMap<String, Value>,
    /// Skip the illustration stage even for asset-capable kinds.
    #[serde(default)]
    pub skip_asset: bool,
    #[serde(default)]
    pub retry_of: Option<JobId>,
}

impl JobRequest {
    pub fn new(kind: JobKind, owner_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            owner_id: owner_id.into(),
            prompt: prompt.into(),
            form: BTreeMap::new(),
            skip_asset: false,
            retry_of: None,
        }
    }

    pub fn with_form_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.form.insert(key.into(), value);
        self
    }

    pub fn without_asset(mut self) -> Self {
        self.skip_asset = true;
        self
    }
}

/// A tracked multi-stage generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub kind: JobKind,
    pub owner_id: String,
    pub prompt: String,
    #[serde(default)]
    pub form: BTreeMap<String, Value>,
    pub status: JobStatus,
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_ms: Option<u64>,
    #[serde(default)]
    pub content: Option<JobContent>,
    #[serde(default)]
    pub asset: Option<AssetRef>,
    /// Non-fatal: the illustration failed but the content was delivered.
    #[serde(default)]
    pub asset_error: Option<String>,
    /// Internal diagnostic message for failed jobs.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub skip_asset: bool,
    #[serde(default)]
    pub retry_of: Option<JobId>,
}

impl GenerationJob {
    pub fn from_request(request: JobRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind: request.kind,
            owner_id: request.owner_id,
            prompt: request.prompt,
            form: request.form,
            status: JobStatus::Pending,
            progress: 0,
            start_time: now,
            settled_at: None,
            elapsed_ms: None,
            content: None,
            asset: None,
            asset_error: None,
            error: None,
            failure: None,
            skip_asset: request.skip_asset,
            retry_of: request.retry_of,
        }
    }

    /// The request that would reproduce this job.
    pub fn to_request(&self) -> JobRequest {
        JobRequest {
            kind: self.kind,
            owner_id: self.owner_id.clone(),
            prompt: self.prompt.clone(),
            form: self.form.clone(),
            skip_asset: self.skip_asset,
            retry_of: Some(self.id),
        }
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.start_time).num_milliseconds().max(0) as u64
    }

    /// Short message safe to show to end users.
    pub fn user_message(&self) -> Option<&'static str> {
        self.failure.map(FailureKind::user_message)
    }
}

/// Partial update merged into an active job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub content: Option<JobContent>,
    pub asset_error: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus, progress: u8) -> Self {
        Self {
            status: Some(status),
            progress: Some(progress),
            ..Self::default()
        }
    }
}

/// Listing filter for dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn matches(&self, job: &GenerationJob) -> bool {
        self.kind.map_or(true, |k| job.kind == k) && self.status.map_or(true, |s| job.status == s)
    }
}
