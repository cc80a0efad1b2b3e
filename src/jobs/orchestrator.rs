//! Drives a job through its stages on top of the task queue.
//!
//! ```text
//! submit ─► pending ─► generating ─► content-complete ─┬─► image-generating ─► complete
//!                          │                │           └─► complete (no illustration)
//!                          └────────────────┴─► error
//! ```
//!
//! Content and illustration calls each go through the shared [`TaskQueue`] under the job's
//! owner, so per-owner queue positions stay meaningful. An illustration failure never fails
//! the job: it completes with content only and records `asset_error`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content::JobContent;
use crate::error::ApiError;
use crate::jobs::store::{JobStore, RestorePolicy};
use crate::jobs::types::{
    FailureKind, GenerationJob, JobId, JobPatch, JobPhase, JobRequest, JobStatus,
};
use crate::provider::{AssetRequest, ContentRequest, GenerationBackend};
use crate::queue::TaskQueue;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Job pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Active jobs older than this are failed by maintenance (seconds)
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// How long settled jobs are kept (seconds)
    #[serde(default = "default_settled_retention_secs")]
    pub settled_retention_secs: u64,
    /// Deadline for one content generation call (seconds)
    #[serde(default = "default_content_timeout_secs")]
    pub content_timeout_secs: u64,
    /// Deadline for one illustration call (seconds)
    #[serde(default = "default_asset_timeout_secs")]
    pub asset_timeout_secs: u64,
    /// Period of the maintenance loop (seconds)
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    /// Fail jobs restored as active, since nothing drives them after a restart
    #[serde(default = "default_interrupt_orphans_on_restore")]
    pub interrupt_orphans_on_restore: bool,
}

fn default_stale_after_secs() -> u64 {
    600
}

fn default_settled_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_content_timeout_secs() -> u64 {
    60
}

fn default_asset_timeout_secs() -> u64 {
    30
}

fn default_maintenance_interval_secs() -> u64 {
    60
}

fn default_interrupt_orphans_on_restore() -> bool {
    true
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            settled_retention_secs: default_settled_retention_secs(),
            content_timeout_secs: default_content_timeout_secs(),
            asset_timeout_secs: default_asset_timeout_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            interrupt_orphans_on_restore: default_interrupt_orphans_on_restore(),
        }
    }
}

impl JobsConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.content_timeout_secs == 0 || self.asset_timeout_secs == 0 {
            return Err("stage timeouts must be greater than 0".to_string());
        }
        if self.stale_after_secs <= self.content_timeout_secs {
            return Err("stale_after_secs must exceed content_timeout_secs".to_string());
        }
        if self.maintenance_interval_secs == 0 {
            return Err("maintenance_interval_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn settled_retention(&self) -> Duration {
        Duration::from_secs(self.settled_retention_secs)
    }

    pub fn content_timeout(&self) -> Duration {
        Duration::from_secs(self.content_timeout_secs)
    }

    pub fn asset_timeout(&self) -> Duration {
        Duration::from_secs(self.asset_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn restore_policy(&self) -> RestorePolicy {
        RestorePolicy {
            stale_after: self.stale_after(),
            interrupt_active: self.interrupt_orphans_on_restore,
        }
    }
}

/// A job plus where it is in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job: GenerationJob,
    pub phase: JobPhase,
    /// 1-based position of the owner's first pending task while queued, else 0.
    pub queue_position: usize,
}

type InFlight = Arc<Mutex<HashSet<JobId>>>;

/// Marks a job as executing a backend call for as long as it is held.
struct InFlightGuard {
    set: InFlight,
    id: JobId,
}

impl InFlightGuard {
    fn enter(set: &InFlight, id: JobId) -> Self {
        set.lock().insert(id);
        Self {
            set: Arc::clone(set),
            id,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Composes the queue, the job store and a generation backend.
pub struct JobOrchestrator {
    queue: TaskQueue,
    store: Arc<JobStore>,
    backend: Arc<dyn GenerationBackend>,
    config: JobsConfig,
    tokens: Mutex<HashMap<JobId, CancellationToken>>,
    in_flight: InFlight,
}

impl JobOrchestrator {
    pub fn new(
        queue: TaskQueue,
        store: Arc<JobStore>,
        backend: Arc<dyn GenerationBackend>,
        config: JobsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            store,
            backend,
            config,
            tokens: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Register a job and start driving it. Must be called inside a Tokio runtime.
    pub fn submit(self: &Arc<Self>, request: JobRequest) -> Result<JobId, ApiError> {
        if request.owner_id.trim().is_empty() {
            return Err(ApiError::QueueRejection(
                "owner_id must not be empty".to_string(),
            ));
        }

        let id = self.store.create(request);
        let token = CancellationToken::new();
        self.tokens.lock().insert(id, token.clone());
        tokio::spawn(Arc::clone(self).drive(id, token));
        Ok(id)
    }

    /// Submit a fresh copy of a settled job, linked back to it through `retry_of`.
    pub fn retry(self: &Arc<Self>, id: &JobId) -> Result<JobId, ApiError> {
        let job = self.store.by_id(id).ok_or(ApiError::JobNotFound(*id))?;
        if !job.status.is_terminal() {
            return Err(ApiError::JobStillActive(*id));
        }
        let new_id = self.submit(job.to_request())?;
        info!(job_id = %new_id, retry_of = %id, "Job resubmitted");
        Ok(new_id)
    }

    /// Stop a job's pending or running work and forget it.
    pub fn cancel(&self, id: &JobId) -> bool {
        let token = self.tokens.lock().remove(id);
        let had_token = token.is_some();
        if let Some(token) = token {
            token.cancel();
        }
        let removed = self.store.remove(id).is_some();
        if had_token || removed {
            info!(job_id = %id, "Job cancelled");
        }
        had_token || removed
    }

    /// Current view of a job. An active job whose next backend call waits in the queue reports
    /// [`JobPhase::Queued`], including a call parked there after a rate limit.
    pub fn status(&self, id: &JobId) -> Option<JobView> {
        let job = self.store.by_id(id)?;
        let (phase, queue_position) = match job.status.phase() {
            JobPhase::Settled => (JobPhase::Settled, 0),
            _ if self.in_flight.lock().contains(id) => (JobPhase::Running, 0),
            phase => match self.queue.position(&job.owner_id) {
                0 => (phase, 0),
                position => (JobPhase::Queued, position),
            },
        };
        Some(JobView {
            job,
            phase,
            queue_position,
        })
    }

    /// Poll until the job settles.
    pub async fn wait(&self, id: &JobId, timeout: Duration) -> Result<GenerationJob, ApiError> {
        let poll = async {
            loop {
                match self.store.by_id(id) {
                    None => return Err(ApiError::JobNotFound(*id)),
                    Some(job) if job.status.is_terminal() => return Ok(job),
                    Some(_) => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
                }
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ApiError::JobTimeout(format!("{} did not settle within {:?}", id, timeout)))?
    }

    /// Fail stale jobs (cancelling their work) and drop expired settled jobs.
    pub fn run_maintenance(&self) -> (Vec<JobId>, usize) {
        let stale = self.store.cleanup_stale(self.config.stale_after());
        if !stale.is_empty() {
            let mut tokens = self.tokens.lock();
            for id in &stale {
                if let Some(token) = tokens.remove(id) {
                    token.cancel();
                }
            }
        }
        let expired = self.store.cleanup_settled(self.config.settled_retention());
        debug!(stale = stale.len(), expired, "Maintenance pass");
        (stale, expired)
    }

    /// Run [`JobOrchestrator::run_maintenance`] every `interval` until the orchestrator is
    /// dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.run_maintenance();
            }
        })
    }

    async fn drive(self: Arc<Self>, id: JobId, token: CancellationToken) {
        if let Some(job) = self.store.by_id(&id) {
            self.run_stages(job, &token).await;
        }
        self.tokens.lock().remove(&id);
    }

    async fn run_stages(&self, job: GenerationJob, token: &CancellationToken) {
        let id = job.id;
        let raw = match self.generate_content(&job, token).await {
            Ok(raw) => raw,
            Err(err) => {
                self.settle_failure(&id, &err);
                return;
            }
        };

        let content = match JobContent::from_output(job.kind, &raw.text, raw.truncated) {
            Ok((content, step)) => {
                debug!(job_id = %id, ?step, truncated = raw.truncated, "Content extracted");
                content
            }
            Err(failure) => {
                warn!(job_id = %id, error = %failure, "Content could not be extracted");
                self.store
                    .fail_with(&id, FailureKind::MalformedResponse, failure.kind_name());
                return;
            }
        };

        let patch = JobPatch {
            content: Some(content.clone()),
            ..JobPatch::status(JobStatus::ContentComplete, 70)
        };
        if !self.store.update(&id, patch) {
            return;
        }

        if !job.kind.supports_asset() || job.skip_asset {
            self.store.complete(&id, content, None);
            return;
        }

        self.store
            .update(&id, JobPatch::status(JobStatus::ImageGenerating, 80));
        match self.generate_asset(&job, &content, token).await {
            Ok(asset) => {
                self.store.complete(&id, content, Some(asset));
            }
            Err(ApiError::Cancelled) => {
                self.store
                    .fail_with(&id, FailureKind::Cancelled, ApiError::Cancelled.to_string());
            }
            Err(err) => {
                let message = ApiError::AssetFailure(err.to_string()).to_string();
                warn!(job_id = %id, error = %message, "Completing without illustration");
                self.store.update(
                    &id,
                    JobPatch {
                        asset_error: Some(message),
                        ..JobPatch::default()
                    },
                );
                self.store.complete(&id, content, None);
            }
        }
    }

    async fn generate_content(
        &self,
        job: &GenerationJob,
        token: &CancellationToken,
    ) -> Result<crate::provider::RawGeneration, ApiError> {
        let store = Arc::clone(&self.store);
        let backend = Arc::clone(&self.backend);
        let in_flight = Arc::clone(&self.in_flight);
        let request = ContentRequest::for_job(job);
        let deadline = self.config.content_timeout();

        self.queue
            .add_cancellable(job.owner_id.clone(), token.clone(), move || {
                let store = Arc::clone(&store);
                let backend = Arc::clone(&backend);
                let in_flight = Arc::clone(&in_flight);
                let request = request.clone();
                async move {
                    let _running = InFlightGuard::enter(&in_flight, request.job_id);
                    store.update(&request.job_id, JobPatch::status(JobStatus::Generating, 10));
                    match tokio::time::timeout(deadline, backend.generate_content(&request)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ApiError::TaskTimeout(deadline)),
                    }
                }
            })
            .await
    }

    async fn generate_asset(
        &self,
        job: &GenerationJob,
        content: &JobContent,
        token: &CancellationToken,
    ) -> Result<crate::jobs::AssetRef, ApiError> {
        let backend = Arc::clone(&self.backend);
        let request = AssetRequest {
            job_id: job.id,
            kind: job.kind,
            prompt: content
                .image_prompt()
                .unwrap_or_else(|| content.title())
                .to_string(),
        };
        let in_flight = Arc::clone(&self.in_flight);
        let deadline = self.config.asset_timeout();

        self.queue
            .add_cancellable(job.owner_id.clone(), token.clone(), move || {
                let backend = Arc::clone(&backend);
                let in_flight = Arc::clone(&in_flight);
                let request = request.clone();
                async move {
                    let _running = InFlightGuard::enter(&in_flight, request.job_id);
                    match tokio::time::timeout(deadline, backend.generate_asset(&request)).await {
                        Ok(result) => result,
                        Err(_) => Err(ApiError::TaskTimeout(deadline)),
                    }
                }
            })
            .await
    }

    fn settle_failure(&self, id: &JobId, err: &ApiError) {
        let kind = FailureKind::from_error(err);
        if self.store.fail_with(id, kind, err.to_string()) {
            warn!(job_id = %id, failure = ?kind, error = %err, "Content stage rejected");
        }
    }
}
