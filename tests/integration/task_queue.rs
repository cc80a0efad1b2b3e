//! Integration tests for the bounded-concurrency task queue
//!
//! Tests cover:
//! - Concurrency ceiling
//! - FIFO admission
//! - Rate-limit front reinsertion and retry ceiling
//! - Queue positions
//! - Cancellation of pending and running tasks
//! - Panic isolation and backoff wakeups

use genforge::error::ApiError;
use genforge::queue::{QueueConfig, TaskQueue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::test_utils::fast_queue;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_never_exceeds_concurrency_limit() {
    let queue = TaskQueue::new(fast_queue(2));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks = (0..8).map(|i| {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        queue.add(format!("owner-{}", i), move || {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ApiError>(i)
            }
        })
    });

    let results = futures::future::join_all(tasks).await;
    assert_eq!(results.len(), 8);
    assert!(results.iter().all(|r| r.is_ok()));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test]
async fn test_tasks_start_in_admission_order() {
    let queue = TaskQueue::new(fast_queue(1));
    let order = Arc::new(Mutex::new(Vec::new()));

    let tasks = ["a", "b", "c", "d"].into_iter().map(|name| {
        let order = Arc::clone(&order);
        queue.add(name, move || {
            let order = Arc::clone(&order);
            async move {
                order.lock().push(name);
                Ok::<_, ApiError>(())
            }
        })
    });
    futures::future::join_all(tasks).await;

    assert_eq!(*order.lock(), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_rate_limited_task_returns_to_front() {
    let queue = TaskQueue::new(QueueConfig {
        concurrency_limit: 1,
        retry_base_delay_ms: 200,
        retry_max_delay_ms: 200,
        max_rate_limit_retries: Some(3),
    });
    let order = Arc::new(Mutex::new(Vec::new()));
    let attempts = Arc::new(AtomicU32::new(0));

    let first = {
        let order = Arc::clone(&order);
        let attempts = Arc::clone(&attempts);
        queue.add("owner-a", move || {
            let order = Arc::clone(&order);
            let attempts = Arc::clone(&attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(ApiError::ProviderRateLimit("HTTP 429".to_string()));
                }
                order.lock().push("a");
                Ok("a")
            }
        })
    };
    let second = {
        let order = Arc::clone(&order);
        queue.add("owner-b", move || {
            let order = Arc::clone(&order);
            async move {
                order.lock().push("b");
                Ok::<_, ApiError>("b")
            }
        })
    };

    let observe = {
        let queue = queue.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            (queue.position("owner-a"), queue.position("owner-b"))
        }
    };

    let (a, b, positions) = tokio::join!(first, second, observe);
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert_eq!(positions, (1, 2));
    assert_eq!(*order.lock(), vec!["a", "b"]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(queue.snapshot().stats.rate_limited, 1);
}

#[tokio::test]
async fn test_429_in_message_is_treated_as_rate_limit() {
    let queue = TaskQueue::new(fast_queue(1));
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = queue
        .add("owner", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(ApiError::ProviderRequestFailed(
                        "HTTP 429 Too Many Requests".to_string(),
                    ));
                }
                Ok(7)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_ceiling_rejects_with_rate_limited() {
    let queue = TaskQueue::new(QueueConfig {
        concurrency_limit: 1,
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        max_rate_limit_retries: Some(2),
    });

    let result: Result<(), ApiError> = queue
        .add("owner", || async {
            Err(ApiError::ProviderRateLimit("slow down".to_string()))
        })
        .await;

    match result {
        Err(ApiError::RateLimited { attempts, message }) => {
            assert_eq!(attempts, 3);
            assert!(message.contains("slow down"));
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
    assert_eq!(queue.snapshot().stats.failed, 1);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_other_failures_settle_once_and_do_not_stall() {
    let queue = TaskQueue::new(fast_queue(1));
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let failing = queue.add("owner-a", move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ApiError::ProviderError("boom".to_string()))
        }
    });
    let next = queue.add("owner-b", || async { Ok::<_, ApiError>(1) });

    let (failed, ok) = tokio::join!(failing, next);
    assert!(matches!(failed, Err(ApiError::ProviderError(ref m)) if m == "boom"));
    assert_eq!(ok.unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_position_is_zero_once_running() {
    let queue = TaskQueue::new(fast_queue(1));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let running = {
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        queue.add("owner-a", move || {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            async move {
                started.notify_one();
                release.notified().await;
                Ok::<_, ApiError>(())
            }
        })
    };
    let waiting = queue.add("owner-b", || async { Ok::<_, ApiError>(()) });

    let observe = {
        let queue = queue.clone();
        let started = Arc::clone(&started);
        let release = Arc::clone(&release);
        async move {
            started.notified().await;
            let positions = (
                queue.position("owner-a"),
                queue.position("owner-b"),
                queue.position("nobody"),
            );
            release.notify_one();
            positions
        }
    };

    let (a, b, positions) = tokio::join!(running, waiting, observe);
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(positions, (0, 1, 0));
    assert_eq!(queue.position("owner-a"), 0);
    assert_eq!(queue.position("owner-b"), 0);
}

#[tokio::test]
async fn test_cancelled_pending_task_is_withdrawn() {
    let queue = TaskQueue::new(fast_queue(1));
    let release = Arc::new(Notify::new());
    let token = CancellationToken::new();
    let ran = Arc::new(AtomicU32::new(0));

    let blocker = {
        let release = Arc::clone(&release);
        queue.add("owner-a", move || {
            let release = Arc::clone(&release);
            async move {
                release.notified().await;
                Ok::<_, ApiError>(())
            }
        })
    };
    let cancelled = {
        let ran = Arc::clone(&ran);
        queue.add_cancellable("owner-b", token.clone(), move || {
            let ran = Arc::clone(&ran);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ApiError>(())
            }
        })
    };
    let control = {
        let queue = queue.clone();
        let release = Arc::clone(&release);
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let before = queue.position("owner-b");
            token.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
            let after = queue.position("owner-b");
            release.notify_one();
            (before, after)
        }
    };

    let (blocked, cancelled, (before, after)) = tokio::join!(blocker, cancelled, control);
    assert!(blocked.is_ok());
    assert!(matches!(cancelled, Err(ApiError::Cancelled)));
    assert_eq!(before, 1);
    assert_eq!(after, 0);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(queue.snapshot().stats.cancelled, 1);
}

#[tokio::test]
async fn test_cancelled_running_task_frees_its_slot() {
    let queue = TaskQueue::new(fast_queue(1));
    let token = CancellationToken::new();

    let hung = queue.add_cancellable("owner-a", token.clone(), || async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, ApiError>(())
    });
    let control = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let active = queue.active_count();
        token.cancel();
        active
    };

    let (result, active_before) = tokio::join!(hung, control);
    assert!(matches!(result, Err(ApiError::Cancelled)));
    assert_eq!(active_before, 1);

    let next = queue.add("owner-b", || async { Ok::<_, ApiError>("ran") }).await;
    assert_eq!(next.unwrap(), "ran");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test]
async fn test_panicking_task_is_rejected() {
    let queue = TaskQueue::new(fast_queue(1));
    let result: Result<u8, ApiError> = queue
        .add("owner", || async {
            if true {
                panic!("task blew up");
            }
            Ok(0)
        })
        .await;
    assert!(matches!(result, Err(ApiError::QueueRejection(_))));

    let after = queue.add("owner", || async { Ok::<_, ApiError>(1u8) }).await;
    assert_eq!(after.unwrap(), 1);
}

#[tokio::test]
async fn test_panic_before_future_is_built_is_rejected() {
    let queue = TaskQueue::new(fast_queue(1));
    let values: Vec<u8> = Vec::new();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        queue.add("owner", move || {
            let value = values[3];
            async move { Ok::<_, ApiError>(value) }
        }),
    )
    .await
    .expect("caller must settle");
    assert!(matches!(result, Err(ApiError::QueueRejection(_))));

    let after = tokio::time::timeout(
        Duration::from_secs(2),
        queue.add("owner", || async { Ok::<_, ApiError>(1u8) }),
    )
    .await
    .expect("slot must be released");
    assert_eq!(after.unwrap(), 1);
    assert_eq!(queue.snapshot().stats.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shorter_backoff_at_front_wakes_earlier() {
    let queue = TaskQueue::new(QueueConfig {
        concurrency_limit: 2,
        retry_base_delay_ms: 100,
        retry_max_delay_ms: 1000,
        max_rate_limit_retries: Some(10),
    });
    let origin = tokio::time::Instant::now();
    let calls = Arc::new(AtomicU32::new(0));
    let starts = Arc::new(Mutex::new(Vec::new()));

    // Limited three times: runs at 0, 100 and 300ms, then due again at 700ms.
    let backing_off = {
        let calls = Arc::clone(&calls);
        queue.add("owner-a", move || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    return Err(ApiError::ProviderRateLimit("HTTP 429".to_string()));
                }
                Ok("a")
            }
        })
    };
    // Limited once at 350ms and pushed ahead of it, due again at 450ms.
    let late = {
        let starts = Arc::clone(&starts);
        queue.add("owner-b", move || {
            let starts = Arc::clone(&starts);
            async move {
                let first = {
                    let mut starts = starts.lock();
                    starts.push(origin.elapsed());
                    starts.len() == 1
                };
                if first {
                    tokio::time::sleep(Duration::from_millis(350)).await;
                    return Err(ApiError::ProviderRateLimit("HTTP 429".to_string()));
                }
                Ok("b")
            }
        })
    };

    let (a, b) = tokio::join!(backing_off, late);
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let starts = starts.lock().clone();
    assert_eq!(starts.len(), 2);
    assert!(starts[1] >= Duration::from_millis(450), "restarted at {:?}", starts[1]);
    assert!(starts[1] < Duration::from_millis(700), "restarted at {:?}", starts[1]);
}
