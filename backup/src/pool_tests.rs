//! Worker pool scenarios: partial failure, retry law, cancellation

use super::*;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use rstest::rstest;
use tokio_util::sync::CancellationToken;

/// Tasks whose `size` doubles as their index
fn tasks(count: usize) -> Vec<CopyTask> {
    (0..count)
        .map(|i| CopyTask {
            source: PathBuf::from(format!("src/file{:03}.txt", i)),
            destination: PathBuf::from(format!("dst/file{:03}.txt", i)),
            size: i as u64,
            modified: Utc::now(),
        })
        .collect()
}

fn fast_retry_pool<F, Fut>(workers: usize, copy_fn: F, attempts: u32) -> WorkerPool<F>
where
    F: Fn(CopyTask) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<TaskOutcome>> + Send + 'static,
{
    WorkerPool::new(workers, copy_fn, attempts, Duration::from_millis(1)).with_max_jitter(Duration::ZERO)
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_permanent_failures_are_reported_together() {
        let pool = fast_retry_pool(
            4,
            |task: CopyTask| async move {
                if task.size % 10 == 0 {
                    Err(BackupError::copy_error(&task.source, "disk on fire"))
                } else if task.size % 2 == 0 {
                    Ok(TaskOutcome::Skipped { bytes: task.size })
                } else {
                    Ok(TaskOutcome::Copied { bytes: task.size })
                }
            },
            2,
        );

        let mut metrics = MetricsAggregator::start(100, true);
        let result = pool
            .execute(tasks(100), &metrics.handle(), &CancellationToken::new())
            .await;
        metrics.flush().await;
        let stats = metrics.get_stats();
        metrics.shutdown().await;

        assert_eq!(stats.files_failed, 10);
        assert_eq!(stats.files_completed + stats.files_skipped, 90);

        let error = result.unwrap_err();
        let message = error.to_string();
        match &error {
            BackupError::TasksFailed { failures } => assert_eq!(failures.len(), 10),
            other => panic!("expected combined failure report, got {:?}", other),
        }
        for i in (0..100).step_by(10) {
            assert!(message.contains(&format!("src/file{:03}.txt", i)), "missing file{:03}", i);
        }
        assert!(message.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let pool = fast_retry_pool(
            1,
            move |_task: CopyTask| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<TaskOutcome, _>(BackupError::NoActiveVersion)
                }
            },
            5,
        );

        let mut metrics = MetricsAggregator::start(1, true);
        let result = pool
            .execute(tasks(1), &metrics.handle(), &CancellationToken::new())
            .await;
        metrics.shutdown().await;

        assert!(matches!(result, Err(BackupError::TasksFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_task_list() {
        let pool = fast_retry_pool(4, |_task: CopyTask| async { Ok::<_, BackupError>(TaskOutcome::Copied { bytes: 0 }) }, 1);
        let mut metrics = MetricsAggregator::start(0, true);

        let result = pool.execute(Vec::new(), &metrics.handle(), &CancellationToken::new()).await;
        metrics.shutdown().await;

        assert!(result.is_ok());
    }
}

mod retry_tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;

    type BoxedAttempt = Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send>>;

    /// Copy function failing `failures` times before succeeding
    fn flaky(failures: u32, calls: Arc<AtomicU32>) -> impl Fn(CopyTask) -> BoxedAttempt + Send + Sync + 'static {
        move |task: CopyTask| -> BoxedAttempt {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= failures {
                    Err(BackupError::copy_error(&task.source, format!("transient failure {}", call)))
                } else {
                    Ok(TaskOutcome::Copied { bytes: task.size })
                }
            })
        }
    }

    #[rstest]
    #[case::enough_attempts(3, true)]
    #[case::one_attempt_short(2, false)]
    #[tokio::test]
    async fn test_retry_law(#[case] attempts: u32, #[case] succeeds: bool) {
        let calls = Arc::new(AtomicU32::new(0));
        let pool = fast_retry_pool(1, flaky(2, Arc::clone(&calls)), attempts);

        let mut metrics = MetricsAggregator::start(1, true);
        let result = pool
            .execute(tasks(1), &metrics.handle(), &CancellationToken::new())
            .await;
        metrics.flush().await;
        let stats = metrics.get_stats();
        metrics.shutdown().await;

        assert_eq!(result.is_ok(), succeeds);
        assert_eq!(calls.load(Ordering::SeqCst), attempts.min(3));
        if succeeds {
            assert_eq!((stats.files_completed, stats.files_failed), (1, 0));
        } else {
            assert_eq!((stats.files_completed, stats.files_failed), (0, 1));
        }
    }

    #[tokio::test]
    async fn test_exhausted_error_wraps_last_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let pool = fast_retry_pool(1, flaky(10, Arc::clone(&calls)), 3);

        let mut metrics = MetricsAggregator::start(1, true);
        let result = pool
            .execute(tasks(1), &metrics.handle(), &CancellationToken::new())
            .await;
        metrics.shutdown().await;

        let message = result.unwrap_err().to_string();
        assert!(message.contains("Failed after 3 attempt(s)"));
        assert!(message.contains("transient failure 3"));
    }
}

mod concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_count_bounds_parallelism() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (active_in, peak_in) = (Arc::clone(&active), Arc::clone(&peak));

        let pool = fast_retry_pool(
            3,
            move |task: CopyTask| {
                let active = Arc::clone(&active_in);
                let peak = Arc::clone(&peak_in);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, BackupError>(TaskOutcome::Copied { bytes: task.size })
                }
            },
            1,
        );

        let mut metrics = MetricsAggregator::start(30, true);
        pool.execute(tasks(30), &metrics.handle(), &CancellationToken::new())
            .await
            .unwrap();
        metrics.flush().await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(metrics.get_stats().files_completed, 30);
        metrics.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancellation_stops_pulling_tasks() {
        let pool = fast_retry_pool(
            4,
            |task: CopyTask| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, BackupError>(TaskOutcome::Copied { bytes: task.size })
            },
            1,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let mut metrics = MetricsAggregator::start(100, true);
        let started = Instant::now();
        let result = pool.execute(tasks(100), &metrics.handle(), &cancel).await;
        let elapsed = started.elapsed();
        metrics.flush().await;
        let stats = metrics.get_stats();
        metrics.shutdown().await;

        assert!(matches!(result, Err(BackupError::Cancelled)));
        // Draining all 100 tasks would take about 500ms
        assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);
        assert!(stats.processed() < 100);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retry_sleep() {
        let pool = WorkerPool::new(
            2,
            |task: CopyTask| async move {
                Err::<TaskOutcome, _>(BackupError::copy_error(&task.source, "still failing"))
            },
            5,
            Duration::from_secs(30),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut metrics = MetricsAggregator::start(2, true);
        let started = Instant::now();
        let result = pool.execute(tasks(2), &metrics.handle(), &cancel).await;
        metrics.flush().await;
        let stats = metrics.get_stats();
        metrics.shutdown().await;

        assert!(matches!(result, Err(BackupError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.files_failed, 0);
    }
}
