//! Task Queue
//!
//! Bounded-concurrency FIFO executor for outbound generation calls. At most
//! `concurrency_limit` tasks run at once; the rest wait in admission order. A task that
//! fails with a rate-limit rejection is put back at the *front* of the pending list and
//! retried after a bounded backoff, ahead of newer arrivals. Every other outcome settles the
//! caller's handle exactly once.

use crate::error::ApiError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Identifier of an admitted task, unique per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of tasks executing simultaneously
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// First backoff applied to a rate-limited task (milliseconds)
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound for the doubling backoff (milliseconds)
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Maximum number of front-reinsertions per task; `None` retries forever
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: Option<u32>,
}

fn default_concurrency_limit() -> usize {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_max_rate_limit_retries() -> Option<u32> {
    Some(8)
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency_limit == 0 {
            return Err("concurrency_limit must be at least 1".to_string());
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err("retry_max_delay_ms must be >= retry_base_delay_ms".to_string());
        }
        Ok(())
    }

    /// Backoff before the next run of a task that has been rate limited `attempts` times.
    fn backoff(&self, attempts: u32) -> Duration {
        if self.retry_base_delay_ms == 0 {
            return Duration::ZERO;
        }
        let shift = attempts.saturating_sub(1).min(20);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

/// Running counters, reported in snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub completed: usize,
    pub failed: usize,
    pub rate_limited: usize,
    pub cancelled: usize,
}

/// One pending entry as exposed to dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTask {
    pub task_id: TaskId,
    pub owner_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Point-in-time view of the queue; derived, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub length: usize,
    pub active_count: usize,
    pub processing: bool,
    pub concurrency_limit: usize,
    pub pending: Vec<PendingTask>,
    pub stats: QueueStats,
}

/// Outcome of a single execution of a task.
enum Attempt {
    /// The caller's handle has been settled (success or terminal error).
    Settled { ok: bool },
    /// Upstream signalled a rate limit; the handle is still open.
    RateLimited(ApiError),
    Cancelled,
    Panicked,
}

type TaskRun = Box<dyn FnMut() -> BoxFuture<'static, Attempt> + Send>;
type Rejector = Box<dyn Fn(ApiError) + Send>;

struct Task {
    id: TaskId,
    owner_id: String,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
    not_before: Option<Instant>,
    cancel: Option<CancellationToken>,
    run: TaskRun,
    reject: Rejector,
}

impl Task {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    active: usize,
    /// Instant of the earliest scheduled wake for a backing-off front task.
    wake_at: Option<Instant>,
    stats: QueueStats,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    next_id: AtomicU64,
}

/// Bounded-concurrency FIFO task queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a queue. A `concurrency_limit` of zero is raised to one.
    pub fn new(mut config: QueueConfig) -> Self {
        if config.concurrency_limit == 0 {
            warn!("concurrency_limit of 0 requested, using 1");
            config.concurrency_limit = 1;
        }
        Self {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.config.concurrency_limit
    }

    /// Admit `execute` under `owner_id` and wait for its outcome.
    pub async fn add<T, F, Fut>(&self, owner_id: impl Into<String>, execute: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        self.admit(owner_id.into(), None, execute).await
    }

    /// Like [`TaskQueue::add`], but the task is withdrawn (pending) or dropped (running)
    /// when `token` is cancelled; the caller then receives [`ApiError::Cancelled`].
    pub async fn add_cancellable<T, F, Fut>(
        &self,
        owner_id: impl Into<String>,
        token: CancellationToken,
        execute: F,
    ) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        self.admit(owner_id.into(), Some(token), execute).await
    }

    async fn admit<T, F, Fut>(
        &self,
        owner_id: String,
        cancel: Option<CancellationToken>,
        mut execute: F,
    ) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, ApiError>>();
        let handle = Arc::new(Mutex::new(Some(tx)));

        let run_handle = Arc::clone(&handle);
        let run: TaskRun = Box::new(move || {
            let fut = execute();
            let handle = Arc::clone(&run_handle);
            async move {
                match fut.await {
                    Err(err) if err.is_rate_limited() => Attempt::RateLimited(err),
                    result => {
                        let ok = result.is_ok();
                        if let Some(tx) = handle.lock().take() {
                            let _ = tx.send(result);
                        }
                        Attempt::Settled { ok }
                    }
                }
            }
            .boxed()
        });

        // The task owns every clone of `handle`; if it is dropped unsettled, `rx` errors.
        let reject: Rejector = Box::new(move |err| {
            if let Some(tx) = handle.lock().take() {
                let _ = tx.send(Err(err));
            }
        });

        let task_id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Task {
            id: task_id,
            owner_id: owner_id.clone(),
            enqueued_at: Utc::now(),
            attempts: 0,
            not_before: None,
            cancel: cancel.clone(),
            run,
            reject,
        };

        let queue_len = {
            let mut state = self.inner.state.lock();
            state.pending.push_back(task);
            state.pending.len()
        };
        debug!(%task_id, owner_id = %owner_id, queue_len, "Task enqueued");
        self.inner.drain();

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    settled = rx => settled,
                    _ = token.cancelled() => {
                        self.inner.withdraw(task_id);
                        return Err(ApiError::Cancelled);
                    }
                }
            }
            None => rx.await,
        };

        outcome.unwrap_or_else(|_| {
            Err(ApiError::QueueRejection(
                "task dropped before settling".to_string(),
            ))
        })
    }

    /// 1-based position of the first pending task owned by `owner_id`, or 0 when the owner
    /// has nothing pending (running, settled or unknown).
    pub fn position(&self, owner_id: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .pending
            .iter()
            .position(|t| t.owner_id == owner_id)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock();
        QueueSnapshot {
            length: state.pending.len(),
            active_count: state.active,
            processing: state.active > 0,
            concurrency_limit: self.inner.config.concurrency_limit,
            pending: state
                .pending
                .iter()
                .map(|t| PendingTask {
                    task_id: t.id,
                    owner_id: t.owner_id.clone(),
                    enqueued_at: t.enqueued_at,
                    attempts: t.attempts,
                })
                .collect(),
            stats: state.stats.clone(),
        }
    }
}

impl QueueInner {
    /// Start pending tasks while capacity remains.
    fn drain(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = self.state.lock();
                if state.active >= self.config.concurrency_limit {
                    return;
                }
                let Some(front) = state.pending.front() else {
                    return;
                };
                if !front.is_cancelled() {
                    if let Some(not_before) = front.not_before {
                        if not_before > Instant::now() {
                            if state.wake_at.map_or(true, |at| not_before < at) {
                                state.wake_at = Some(not_before);
                                self.schedule_wake(not_before);
                            }
                            return;
                        }
                    }
                }
                let Some(task) = state.pending.pop_front() else {
                    return;
                };
                if task.is_cancelled() {
                    state.stats.cancelled += 1;
                    drop(state);
                    (task.reject)(ApiError::Cancelled);
                    continue;
                }
                state.active += 1;
                task
            };
            self.spawn_task(task);
        }
    }

    fn schedule_wake(self: &Arc<Self>, at: Instant) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            {
                let mut state = inner.state.lock();
                if state.wake_at == Some(at) {
                    state.wake_at = None;
                }
            }
            inner.drain();
        });
    }

    fn spawn_task(self: &Arc<Self>, mut task: Task) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            task.attempts += 1;
            task.not_before = None;
            debug!(
                task_id = %task.id,
                owner_id = %task.owner_id,
                attempt = task.attempts,
                "Task started"
            );

            let started = std::panic::catch_unwind(AssertUnwindSafe(|| (task.run)()));
            let attempt = match started {
                Err(_) => Attempt::Panicked,
                Ok(fut) => {
                    let run = AssertUnwindSafe(fut).catch_unwind();
                    match task.cancel.clone() {
                        Some(token) => {
                            tokio::select! {
                                attempt = run => attempt.unwrap_or(Attempt::Panicked),
                                _ = token.cancelled() => Attempt::Cancelled,
                            }
                        }
                        None => run.await.unwrap_or(Attempt::Panicked),
                    }
                }
            };

            inner.finish(task, attempt);
        });
    }

    fn finish(self: &Arc<Self>, mut task: Task, attempt: Attempt) {
        let mut requeue = false;
        match attempt {
            Attempt::Settled { ok } => {
                let mut state = self.state.lock();
                if ok {
                    state.stats.completed += 1;
                } else {
                    state.stats.failed += 1;
                }
                drop(state);
                debug!(task_id = %task.id, owner_id = %task.owner_id, ok, "Task settled");
            }
            Attempt::Cancelled => {
                self.state.lock().stats.cancelled += 1;
                (task.reject)(ApiError::Cancelled);
                info!(task_id = %task.id, owner_id = %task.owner_id, "Running task cancelled");
            }
            Attempt::Panicked => {
                self.state.lock().stats.failed += 1;
                (task.reject)(ApiError::QueueRejection("task panicked".to_string()));
                error!(task_id = %task.id, owner_id = %task.owner_id, "Task panicked");
            }
            Attempt::RateLimited(err) => {
                let exhausted = self
                    .config
                    .max_rate_limit_retries
                    .is_some_and(|max| task.attempts > max);
                if exhausted {
                    self.state.lock().stats.failed += 1;
                    warn!(
                        task_id = %task.id,
                        owner_id = %task.owner_id,
                        attempts = task.attempts,
                        error = %err,
                        "Rate-limit retries exhausted"
                    );
                    (task.reject)(ApiError::RateLimited {
                        attempts: task.attempts,
                        message: err.to_string(),
                    });
                } else {
                    let delay = self.config.backoff(task.attempts);
                    if !delay.is_zero() {
                        task.not_before = Some(Instant::now() + delay);
                    }
                    self.state.lock().stats.rate_limited += 1;
                    warn!(
                        task_id = %task.id,
                        owner_id = %task.owner_id,
                        attempts = task.attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Task rate limited, reinserting at front"
                    );
                    requeue = true;
                }
            }
        }

        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            if requeue {
                state.pending.push_front(task);
            }
        }
        self.drain();
    }

    /// Remove a cancelled task from the pending list if it is still there.
    fn withdraw(self: &Arc<Self>, task_id: TaskId) {
        let removed = {
            let mut state = self.state.lock();
            let index = state.pending.iter().position(|t| t.id == task_id);
            let removed = index.and_then(|i| state.pending.remove(i));
            if removed.is_some() {
                state.stats.cancelled += 1;
            }
            removed
        };
        if removed.is_some() {
            debug!(%task_id, "Pending task withdrawn");
            self.drain();
        }
    }
}
