//! Bounded-concurrency task execution with per-task retry

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BackupError, Result, TaskFailure};
use crate::metrics::MetricsHandle;
use crate::task::CopyTask;

/// Upper bound of the random jitter added to every retry delay
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);

/// Successful result of processing one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Copied { bytes: u64 },
    Skipped { bytes: u64 },
}

/// Retry schedule: `base * k²` plus jitter in `[0, max_jitter)` after attempt `k`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-indexed), without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_mul(attempt))
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max = self.max_jitter.as_nanos().min(u64::MAX as u128) as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(0..max))
    }
}

/// Fixed set of workers draining a shared queue
pub struct WorkerPool<F> {
    workers: usize,
    copy_fn: Arc<F>,
    retry: RetryPolicy,
}

impl<F, Fut> WorkerPool<F>
where
    F: Fn(CopyTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutcome>> + Send + 'static,
{
    /// Create a pool; zero workers or zero attempts are raised to one
    pub fn new(workers: usize, copy_fn: F, retry_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            workers: workers.max(1),
            copy_fn: Arc::new(copy_fn),
            retry: RetryPolicy {
                attempts: retry_attempts.max(1),
                base_delay: retry_delay,
                max_jitter: DEFAULT_MAX_JITTER,
            },
        }
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.retry.max_jitter = max_jitter;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run every task, returning once all workers have exited.
    ///
    /// Tasks that exhaust their retries are reported together in
    /// `TasksFailed`; the remaining tasks still run. Cancellation stops
    /// workers from taking new tasks and interrupts retry sleeps.
    pub async fn execute(
        &self,
        tasks: Vec<CopyTask>,
        metrics: &MetricsHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = tasks.len();
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let failures: Arc<Mutex<Vec<TaskFailure>>> = Arc::new(Mutex::new(Vec::new()));
        let worker_count = self.workers.min(total.max(1));

        info!(workers = worker_count, tasks = total, "Starting worker pool");

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let failures = Arc::clone(&failures);
            let copy_fn = Arc::clone(&self.copy_fn);
            let metrics = metrics.clone();
            let cancel = cancel.clone();
            let retry = self.retry;

            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker_id, "Worker observed cancellation");
                        break;
                    }

                    let next = queue.lock().pop_front();
                    let Some(task) = next else {
                        break;
                    };

                    match run_with_retry(copy_fn.as_ref(), &task, &retry, &cancel).await {
                        Ok(TaskOutcome::Copied { bytes }) => metrics.increment_completed(bytes),
                        Ok(TaskOutcome::Skipped { bytes }) => metrics.increment_skipped(bytes),
                        Err(BackupError::Cancelled) => break,
                        Err(e) => {
                            error!(source = %task.source.display(), error = %e, "Task failed");
                            metrics.increment_failed();
                            failures.lock().push(TaskFailure {
                                source: task.source.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task terminated abnormally");
            }
        }

        if cancel.is_cancelled() {
            let remaining = queue.lock().len();
            warn!(remaining, "Worker pool cancelled");
            return Err(BackupError::Cancelled);
        }

        let failures = std::mem::take(&mut *failures.lock());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BackupError::TasksFailed { failures })
        }
    }
}

async fn run_with_retry<F, Fut>(
    copy_fn: &F,
    task: &CopyTask,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<TaskOutcome>
where
    F: Fn(CopyTask) -> Fut,
    Fut: Future<Output = Result<TaskOutcome>>,
{
    let mut attempt = 1;

    loop {
        let error = match copy_fn(task.clone()).await {
            Ok(outcome) => return Ok(outcome),
            Err(BackupError::Cancelled) => return Err(BackupError::Cancelled),
            Err(e) => e,
        };

        if attempt >= retry.attempts || !error.is_retryable() {
            return Err(BackupError::RetryExhausted {
                path: task.source.clone(),
                attempts: attempt,
                last_error: Box::new(error),
            });
        }

        let delay = retry.backoff(attempt);
        warn!(
            source = %task.source.display(),
            attempt,
            attempts = retry.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Copy attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
