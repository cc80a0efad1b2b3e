//! Job registry partitioned into active and settled jobs.
//!
//! A job lives in exactly one partition. It enters `active` on [`JobStore::create`] and moves
//! to `settled` once, on [`JobStore::complete`] or [`JobStore::fail_with`]; after that it is
//! only ever read or removed. When a [`SnapshotStore`] is attached, every mutation re-saves
//! the whole registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::content::JobContent;
use crate::error::{ApiError, StorageError};
use crate::jobs::persistence::{
    decode_snapshot, encode_snapshot, PersistedSnapshot, SnapshotStore, SNAPSHOT_VERSION,
};
use crate::jobs::types::{
    AssetRef, FailureKind, GenerationJob, JobFilter, JobId, JobKind, JobPatch, JobRequest,
    JobStatus,
};

/// Default age after which an active job is considered abandoned.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10 * 60);
/// Default retention for settled jobs.
pub const DEFAULT_SETTLED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const INTERRUPTED_MESSAGE: &str = "Interrupted: the process stopped before the job settled";

/// What to do with restored jobs that were still active when the snapshot was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestorePolicy {
    /// Active jobs older than this are failed as timed out.
    pub stale_after: Duration,
    /// Fail every remaining active job, since nothing in this process drives it.
    pub interrupt_active: bool,
}

impl Default for RestorePolicy {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            interrupt_active: true,
        }
    }
}

/// Per-status totals across both partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub generating: usize,
    pub content_complete: usize,
    pub image_generating: usize,
    pub complete: usize,
    pub error: usize,
}

impl JobCounts {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Generating => self.generating += 1,
            JobStatus::ContentComplete => self.content_complete += 1,
            JobStatus::ImageGenerating => self.image_generating += 1,
            JobStatus::Complete => self.complete += 1,
            JobStatus::Error => self.error += 1,
        }
    }

    pub fn active(&self) -> usize {
        self.pending + self.generating + self.content_complete + self.image_generating
    }

    pub fn settled(&self) -> usize {
        self.complete + self.error
    }
}

#[derive(Debug, Default)]
struct Partitions {
    active: BTreeMap<JobId, GenerationJob>,
    settled: BTreeMap<JobId, GenerationJob>,
}

impl Partitions {
    fn settle(
        &mut self,
        id: &JobId,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut GenerationJob),
    ) -> Option<&GenerationJob> {
        let mut job = self.active.remove(id)?;
        apply(&mut job);
        job.settled_at = Some(now);
        job.elapsed_ms = Some(job.age_ms(now));
        self.settled.insert(*id, job);
        self.settled.get(id)
    }

    fn fail(
        &mut self,
        id: &JobId,
        kind: FailureKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.settle(id, now, |job| {
            job.status = JobStatus::Error;
            job.failure = Some(kind);
            job.error = Some(message.to_string());
        })
        .is_some()
    }

    fn to_snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            version: SNAPSHOT_VERSION,
            active: self.active.values().cloned().collect(),
            settled: self.settled.values().cloned().collect(),
        }
    }
}

/// Thread-safe job registry. Share it behind an `Arc`.
pub struct JobStore {
    partitions: RwLock<Partitions>,
    persistence: Option<Arc<dyn SnapshotStore>>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    /// Empty, non-persistent registry.
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(Partitions::default()),
            persistence: None,
        }
    }

    /// Registry backed by `persistence`, restored from its last snapshot.
    ///
    /// A missing snapshot starts empty. A corrupt or unsupported one is logged and discarded.
    /// Only a failure to read the store at all is returned as an error.
    pub fn open(
        persistence: Arc<dyn SnapshotStore>,
        policy: RestorePolicy,
    ) -> Result<Self, StorageError> {
        let partitions = match persistence.load()? {
            None => Partitions::default(),
            Some(bytes) => match decode_snapshot(&bytes) {
                Ok(snapshot) => {
                    let mut partitions = Partitions::default();
                    for job in snapshot.settled {
                        partitions.settled.insert(job.id, job);
                    }
                    for job in snapshot.active {
                        if !partitions.settled.contains_key(&job.id) {
                            partitions.active.insert(job.id, job);
                        }
                    }
                    partitions
                }
                Err(err) => {
                    warn!(error = %err, "Discarding unreadable job snapshot, starting empty");
                    Partitions::default()
                }
            },
        };

        let store = Self {
            partitions: RwLock::new(partitions),
            persistence: Some(persistence),
        };

        let now = Utc::now();
        let stale = store.cleanup_stale_at(policy.stale_after, now);
        let mut interrupted = 0usize;
        if policy.interrupt_active {
            let mut partitions = store.partitions.write();
            let ids: Vec<JobId> = partitions.active.keys().copied().collect();
            for id in ids {
                if partitions.fail(&id, FailureKind::Upstream, INTERRUPTED_MESSAGE, now) {
                    interrupted += 1;
                }
            }
            if interrupted > 0 {
                store.persist(&partitions);
            }
        }

        let partitions = store.partitions.read();
        info!(
            active = partitions.active.len(),
            settled = partitions.settled.len(),
            stale = stale.len(),
            interrupted,
            "Job store restored"
        );
        drop(partitions);
        Ok(store)
    }

    /// Register a new pending job.
    pub fn create(&self, request: JobRequest) -> JobId {
        self.create_at(request, Utc::now())
    }

    pub fn create_at(&self, request: JobRequest, now: DateTime<Utc>) -> JobId {
        let job = GenerationJob::from_request(request, now);
        let id = job.id;
        let mut partitions = self.partitions.write();
        info!(job_id = %id, kind = %job.kind, owner_id = %job.owner_id, "Job created");
        partitions.active.insert(id, job);
        self.persist(&partitions);
        id
    }

    /// Merge `patch` into an active job. Returns false if the job is not active.
    ///
    /// Status changes only move forward and never settle the job; settling goes through
    /// [`JobStore::complete`] and [`JobStore::fail_with`].
    pub fn update(&self, id: &JobId, patch: JobPatch) -> bool {
        let mut partitions = self.partitions.write();
        let Some(job) = partitions.active.get_mut(id) else {
            debug!(job_id = %id, "Update ignored, job not active");
            return false;
        };

        if let Some(status) = patch.status {
            if !status.is_terminal() && job.status.can_transition_to(status) {
                job.status = status;
            } else if status != job.status {
                warn!(
                    job_id = %id,
                    from = %job.status,
                    to = %status,
                    "Rejected status transition"
                );
            }
        }
        if let Some(progress) = patch.progress {
            job.progress = progress.min(99).max(job.progress);
        }
        if let Some(content) = patch.content {
            job.content = Some(content);
        }
        if let Some(asset_error) = patch.asset_error {
            job.asset_error = Some(asset_error);
        }
        debug!(job_id = %id, status = %job.status, progress = job.progress, "Job updated");
        self.persist(&partitions);
        true
    }

    /// Settle an active job as complete.
    pub fn complete(&self, id: &JobId, content: JobContent, asset: Option<AssetRef>) -> bool {
        self.complete_at(id, content, asset, Utc::now())
    }

    pub fn complete_at(
        &self,
        id: &JobId,
        content: JobContent,
        asset: Option<AssetRef>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut partitions = self.partitions.write();
        let Some(job) = partitions.settle(id, now, |job| {
            job.status = JobStatus::Complete;
            job.progress = 100;
            job.content = Some(content);
            job.asset = asset;
        }) else {
            debug!(job_id = %id, "Complete ignored, job not active");
            return false;
        };
        info!(
            job_id = %id,
            kind = %job.kind,
            elapsed_ms = job.elapsed_ms.unwrap_or_default(),
            with_asset = job.asset.is_some(),
            "Job complete"
        );
        self.persist(&partitions);
        true
    }

    /// Settle an active job as failed with an unclassified upstream failure.
    pub fn fail(&self, id: &JobId, message: impl Into<String>) -> bool {
        self.fail_with(id, FailureKind::Upstream, message)
    }

    pub fn fail_with(&self, id: &JobId, kind: FailureKind, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut partitions = self.partitions.write();
        if !partitions.fail(id, kind, &message, Utc::now()) {
            debug!(job_id = %id, "Fail ignored, job not active");
            return false;
        }
        warn!(job_id = %id, failure = ?kind, error = %message, "Job failed");
        self.persist(&partitions);
        true
    }

    /// Delete a job from whichever partition holds it.
    pub fn remove(&self, id: &JobId) -> Option<GenerationJob> {
        let mut partitions = self.partitions.write();
        let removed = partitions
            .active
            .remove(id)
            .or_else(|| partitions.settled.remove(id));
        if removed.is_some() {
            debug!(job_id = %id, "Job removed");
            self.persist(&partitions);
        }
        removed
    }

    pub fn by_id(&self, id: &JobId) -> Option<GenerationJob> {
        let partitions = self.partitions.read();
        partitions
            .active
            .get(id)
            .or_else(|| partitions.settled.get(id))
            .cloned()
    }

    pub fn is_active(&self, id: &JobId) -> bool {
        self.partitions.read().active.contains_key(id)
    }

    pub fn all_active(&self) -> Vec<GenerationJob> {
        self.partitions.read().active.values().cloned().collect()
    }

    pub fn all_settled(&self) -> Vec<GenerationJob> {
        self.partitions.read().settled.values().cloned().collect()
    }

    /// Active jobs of `kind`.
    pub fn by_kind(&self, kind: JobKind) -> Vec<GenerationJob> {
        self.partitions
            .read()
            .active
            .values()
            .filter(|job| job.kind == kind)
            .cloned()
            .collect()
    }

    pub fn any_active(&self, kind: Option<JobKind>) -> bool {
        let partitions = self.partitions.read();
        match kind {
            Some(kind) => partitions.active.values().any(|job| job.kind == kind),
            None => !partitions.active.is_empty(),
        }
    }

    /// Jobs from both partitions matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<GenerationJob> {
        let partitions = self.partitions.read();
        let mut jobs: Vec<GenerationJob> = partitions
            .active
            .values()
            .chain(partitions.settled.values())
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn counts(&self) -> JobCounts {
        let partitions = self.partitions.read();
        let mut counts = JobCounts::default();
        for job in partitions.active.values().chain(partitions.settled.values()) {
            counts.record(job.status);
        }
        counts
    }

    /// Drop settled jobs that settled more than `max_age` ago. Returns how many were removed.
    pub fn cleanup_settled(&self, max_age: Duration) -> usize {
        self.cleanup_settled_at(max_age, Utc::now())
    }

    pub fn cleanup_settled_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age_ms = max_age.as_millis() as u64;
        let mut partitions = self.partitions.write();
        let before = partitions.settled.len();
        partitions.settled.retain(|_, job| {
            let settled_at = job.settled_at.unwrap_or(job.start_time);
            let age_ms = (now - settled_at).num_milliseconds().max(0) as u64;
            age_ms <= max_age_ms
        });
        let removed = before - partitions.settled.len();
        if removed > 0 {
            info!(removed, "Settled jobs cleaned up");
            self.persist(&partitions);
        }
        removed
    }

    /// Fail active jobs started more than `max_age` ago. Returns the ids that were failed.
    pub fn cleanup_stale(&self, max_age: Duration) -> Vec<JobId> {
        self.cleanup_stale_at(max_age, Utc::now())
    }

    pub fn cleanup_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<JobId> {
        let max_age_ms = max_age.as_millis() as u64;
        let message = ApiError::JobTimeout(format!(
            "no result within {}s, marked stale",
            max_age.as_secs()
        ))
        .to_string();

        let mut partitions = self.partitions.write();
        let stale: Vec<JobId> = partitions
            .active
            .values()
            .filter(|job| job.age_ms(now) > max_age_ms)
            .map(|job| job.id)
            .collect();
        for id in &stale {
            partitions.fail(id, FailureKind::TimedOut, &message, now);
            warn!(job_id = %id, "Stale job failed");
        }
        if !stale.is_empty() {
            self.persist(&partitions);
        }
        stale
    }

    fn persist(&self, partitions: &Partitions) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let result = encode_snapshot(&partitions.to_snapshot())
            .and_then(|bytes| persistence.save(&bytes));
        if let Err(err) = result {
            error!(error = %err, "Failed to save job snapshot");
        }
    }
}
