//! Integration tests for job orchestration
//!
//! Tests cover:
//! - Full lifecycle with and without the illustration stage
//! - Failure classification and verbatim rejection messages
//! - Rate-limit recovery through the queue
//! - Cancellation, stale maintenance and retry

use genforge::error::ApiError;
use genforge::jobs::{FailureKind, JobId, JobKind, JobPhase, JobRequest, JobStatus, JobsConfig};
use genforge::provider::RawGeneration;
use genforge::queue::QueueConfig;
use std::sync::Arc;
use std::time::Duration;

use super::test_utils::{fast_queue, orchestrator_with, ScriptedBackend};

const WAIT: Duration = Duration::from_secs(10);

fn request(kind: JobKind, owner: &str) -> JobRequest {
    JobRequest::new(kind, owner, "something about foxes")
}

#[tokio::test]
async fn test_illustrated_job_runs_every_stage() {
    let backend = Arc::new(ScriptedBackend::new());
    let orchestrator = orchestrator_with(backend.clone(), fast_queue(2), JobsConfig::default());

    let id = orchestrator.submit(request(JobKind::Story, "user-1")).unwrap();
    let job = orchestrator.wait(&id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.progress, 100);
    assert_eq!(job.content.as_ref().unwrap().title(), "The Fox");
    assert_eq!(
        job.asset.as_ref().map(|a| a.uri.clone()),
        Some(format!("mem://asset/{}", id))
    );
    assert!(job.asset_error.is_none());
    assert!(job.elapsed_ms.is_some());
    assert_eq!(backend.content_calls(), 1);
    assert_eq!(backend.asset_calls(), 1);

    let view = orchestrator.status(&id).unwrap();
    assert_eq!(view.phase, JobPhase::Settled);
    assert_eq!(view.queue_position, 0);
}

#[tokio::test]
async fn test_text_only_kinds_and_skip_asset_never_illustrate() {
    let backend = Arc::new(ScriptedBackend::new());
    let orchestrator = orchestrator_with(backend.clone(), fast_queue(2), JobsConfig::default());

    let quiz = orchestrator.submit(request(JobKind::Quiz, "user-1")).unwrap();
    let article = orchestrator
        .submit(request(JobKind::Article, "user-2").without_asset())
        .unwrap();

    let quiz = orchestrator.wait(&quiz, WAIT).await.unwrap();
    let article = orchestrator.wait(&article, WAIT).await.unwrap();
    assert_eq!(quiz.status, JobStatus::Complete);
    assert_eq!(article.status, JobStatus::Complete);
    assert!(quiz.asset.is_none());
    assert!(article.asset.is_none());
    assert_eq!(backend.content_calls(), 2);
    assert_eq!(backend.asset_calls(), 0);
}

#[tokio::test]
async fn test_asset_failure_completes_with_content_only() {
    let backend = Arc::new(
        ScriptedBackend::new().then_asset(Err(ApiError::ProviderError("no gpu".to_string()))),
    );
    let orchestrator = orchestrator_with(backend, fast_queue(1), JobsConfig::default());

    let id = orchestrator.submit(request(JobKind::Recipe, "user-1")).unwrap();
    let job = orchestrator.wait(&id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Complete);
    assert!(job.asset.is_none());
    assert!(job.content.is_some());
    assert_eq!(
        job.asset_error.as_deref(),
        Some("Asset generation failed: Provider error: no gpu")
    );
    assert!(job.error.is_none());
}

#[tokio::test]
async fn test_content_rejection_message_is_kept_verbatim() {
    let backend = Arc::new(ScriptedBackend::new().then_content(Err(
        ApiError::ProviderRequestFailed("upstream exploded".to_string()),
    )));
    let orchestrator = orchestrator_with(backend.clone(), fast_queue(1), JobsConfig::default());

    let id = orchestrator.submit(request(JobKind::Article, "user-1")).unwrap();
    let job = orchestrator.wait(&id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(
        job.error.as_deref(),
        Some("Provider request failed: upstream exploded")
    );
    assert_eq!(job.failure, Some(FailureKind::Upstream));
    assert_eq!(backend.asset_calls(), 0);
}

#[tokio::test]
async fn test_unreadable_output_fails_with_extraction_kind() {
    let backend = Arc::new(
        ScriptedBackend::new().then_content(Ok(RawGeneration::complete("I'd rather not."))),
    );
    let orchestrator = orchestrator_with(backend, fast_queue(1), JobsConfig::default());

    let id = orchestrator.submit(request(JobKind::Quiz, "user-1")).unwrap();
    let job = orchestrator.wait(&id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.error.as_deref(), Some("NoJsonFound"));
    assert_eq!(job.failure, Some(FailureKind::MalformedResponse));
    assert!(job.content.is_none());
}

#[tokio::test]
async fn test_truncated_output_is_repaired() {
    let backend = Arc::new(ScriptedBackend::new().then_content(Ok(RawGeneration::truncated(
        "{\"title\":\"Verbs\",\"cards\":[{\"front\":\"ser\",\"back\":\"to be\"},{\"fro",
    ))));
    let orchestrator = orchestrator_with(backend, fast_queue(1), JobsConfig::default());

    let id = orchestrator
        .submit(request(JobKind::Flashcards, "user-1"))
        .unwrap();
    let job = orchestrator.wait(&id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.content.unwrap().title(), "Verbs");
}

#[tokio::test]
async fn test_rate_limited_content_is_retried_to_completion() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .then_content(Err(ApiError::ProviderRateLimit("HTTP 429".to_string())))
            .then_content(Err(ApiError::ProviderRateLimit("HTTP 429".to_string()))),
    );
    let orchestrator = orchestrator_with(backend.clone(), fast_queue(1), JobsConfig::default());

    let id = orchestrator.submit(request(JobKind::Quiz, "user-1")).unwrap();
    let job = orchestrator.wait(&id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(backend.content_calls(), 3);
    assert_eq!(orchestrator.queue().snapshot().stats.rate_limited, 2);
}

#[tokio::test]
async fn test_exhausted_rate_limit_retries_fail_the_job() {
    let mut backend = ScriptedBackend::new();
    for _ in 0..6 {
        backend = backend.then_content(Err(ApiError::ProviderRateLimit("HTTP 429".to_string())));
    }
    let backend = Arc::new(backend);
    let orchestrator = orchestrator_with(backend.clone(), fast_queue(1), JobsConfig::default());

    let id = orchestrator.submit(request(JobKind::Quiz, "user-1")).unwrap();
    let job = orchestrator.wait(&id, WAIT).await.unwrap();

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.failure, Some(FailureKind::RateLimited));
    assert_eq!(
        job.user_message(),
        Some("The generator is busy right now. Please try again in a minute.")
    );
    assert_eq!(backend.content_calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_content_deadline_fails_the_job() {
    let backend = Arc::new(ScriptedBackend::new().with_content_delay(Duration::from_secs(30)));
    let config = JobsConfig {
        content_timeout_secs: 1,
        ..JobsConfig::default()
    };
    let orchestrator = orchestrator_with(backend, fast_queue(1), config);

    let id = orchestrator.submit(request(JobKind::Quiz, "user-1")).unwrap();
    let job = orchestrator.wait(&id, Duration::from_secs(60)).await.unwrap();

    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.failure, Some(FailureKind::TimedOut));
    assert_eq!(job.error.as_deref(), Some("Task timed out after 1s"));
}

#[tokio::test]
async fn test_waiting_jobs_report_queued_phase_and_position() {
    let backend =
        Arc::new(ScriptedBackend::new().with_content_delay(Duration::from_millis(200)));
    let orchestrator = orchestrator_with(backend, fast_queue(1), JobsConfig::default());

    let first = orchestrator.submit(request(JobKind::Quiz, "user-a")).unwrap();
    let second = orchestrator.submit(request(JobKind::Quiz, "user-b")).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let running = orchestrator.status(&first).unwrap();
    assert_eq!(running.phase, JobPhase::Running);
    assert_eq!(running.job.status, JobStatus::Generating);
    assert_eq!(running.queue_position, 0);

    let queued = orchestrator.status(&second).unwrap();
    assert_eq!(queued.phase, JobPhase::Queued);
    assert_eq!(queued.job.status, JobStatus::Pending);
    assert_eq!(queued.queue_position, 1);

    orchestrator.wait(&first, WAIT).await.unwrap();
    let done = orchestrator.wait(&second, WAIT).await.unwrap();
    assert_eq!(done.status, JobStatus::Complete);
}

#[tokio::test]
async fn test_rate_limited_job_reports_queued_while_backing_off() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .then_content(Err(ApiError::ProviderRateLimit("HTTP 429".to_string()))),
    );
    let queue = QueueConfig {
        concurrency_limit: 1,
        retry_base_delay_ms: 400,
        retry_max_delay_ms: 400,
        max_rate_limit_retries: Some(3),
    };
    let orchestrator = orchestrator_with(backend.clone(), queue, JobsConfig::default());

    let id = orchestrator.submit(request(JobKind::Quiz, "user-1")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let parked = orchestrator.status(&id).unwrap();
    assert_eq!(parked.job.status, JobStatus::Generating);
    assert_eq!(parked.phase, JobPhase::Queued);
    assert_eq!(parked.queue_position, 1);
    assert_eq!(orchestrator.queue().active_count(), 0);

    let job = orchestrator.wait(&id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(backend.content_calls(), 2);
    let view = orchestrator.status(&id).unwrap();
    assert_eq!(view.phase, JobPhase::Settled);
}

#[tokio::test]
async fn test_cancel_stops_work_and_forgets_the_job() {
    let backend = Arc::new(ScriptedBackend::new().with_content_delay(Duration::from_secs(30)));
    let orchestrator = orchestrator_with(backend.clone(), fast_queue(1), JobsConfig::default());

    let id = orchestrator.submit(request(JobKind::Story, "user-1")).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(orchestrator.queue().active_count(), 1);

    assert!(orchestrator.cancel(&id));
    assert!(orchestrator.status(&id).is_none());
    assert!(matches!(
        orchestrator.wait(&id, WAIT).await,
        Err(ApiError::JobNotFound(_))
    ));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(orchestrator.queue().active_count(), 0);
    assert_eq!(backend.content_calls(), 1);
    assert!(!orchestrator.cancel(&id));

    // The slot is free for the next job.
    let next = orchestrator.submit(request(JobKind::Quiz, "user-2")).unwrap();
    assert!(orchestrator.status(&next).is_some());
}

#[tokio::test]
async fn test_maintenance_fails_stale_jobs_and_cancels_their_work() {
    let backend = Arc::new(ScriptedBackend::new().with_content_delay(Duration::from_secs(30)));
    let config = JobsConfig {
        stale_after_secs: 0,
        ..JobsConfig::default()
    };
    let orchestrator = orchestrator_with(backend, fast_queue(1), config);

    let id = orchestrator.submit(request(JobKind::Article, "user-1")).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let (stale, expired) = orchestrator.run_maintenance();
    assert_eq!(stale, vec![id]);
    assert_eq!(expired, 0);

    let job = orchestrator.wait(&id, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Error);
    assert_eq!(job.failure, Some(FailureKind::TimedOut));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(orchestrator.queue().active_count(), 0);
    // The cancelled content stage must not overwrite the stale failure.
    assert_eq!(
        orchestrator.store().by_id(&id).unwrap().failure,
        Some(FailureKind::TimedOut)
    );
}

#[tokio::test]
async fn test_retry_resubmits_settled_jobs_only() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .then_content(Err(ApiError::ProviderError("flaky".to_string()))),
    );
    let orchestrator = orchestrator_with(backend, fast_queue(1), JobsConfig::default());

    let failed = orchestrator.submit(request(JobKind::Article, "user-1")).unwrap();
    assert!(matches!(
        orchestrator.retry(&failed),
        Err(ApiError::JobStillActive(_))
    ));
    let failed_job = orchestrator.wait(&failed, WAIT).await.unwrap();
    assert_eq!(failed_job.status, JobStatus::Error);

    let retried = orchestrator.retry(&failed).unwrap();
    assert_ne!(retried, failed);
    let job = orchestrator.wait(&retried, WAIT).await.unwrap();
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.retry_of, Some(failed));
    assert_eq!(job.prompt, failed_job.prompt);
    assert!(job.asset.is_some());

    let unknown = JobId::new();
    assert!(matches!(
        orchestrator.retry(&unknown),
        Err(ApiError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_empty_owner_is_rejected() {
    let orchestrator = orchestrator_with(
        Arc::new(ScriptedBackend::new()),
        fast_queue(1),
        JobsConfig::default(),
    );
    let result = orchestrator.submit(request(JobKind::Quiz, "  "));
    assert!(matches!(result, Err(ApiError::QueueRejection(_))));
    assert_eq!(orchestrator.store().counts().active(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_background_maintenance_runs_on_interval() {
    let orchestrator = orchestrator_with(
        Arc::new(ScriptedBackend::new()),
        fast_queue(1),
        JobsConfig::default(),
    );
    let store = Arc::clone(orchestrator.store());
    let old = store.create_at(
        request(JobKind::Recipe, "user-1"),
        chrono::Utc::now() - chrono::Duration::hours(1),
    );

    let handle = orchestrator.spawn_maintenance(Duration::from_secs(5));
    tokio::time::sleep(Duration::from_secs(6)).await;

    let job = store.by_id(&old).unwrap();
    assert_eq!(job.failure, Some(FailureKind::TimedOut));

    drop(orchestrator);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(handle.is_finished());
}
