//! Worker pool draining the invocation queue.
//!
//! Each worker repeatedly takes the next due invocation, runs exactly one
//! attempt and settles it with the queue: completed, re-queued with backoff,
//! deferred or failed. Attempts run on their own task so a panicking
//! executor fails its invocation instead of killing the worker.

use crate::config::WorkerConfig;
use crate::core::executor::TaskRunner;
use crate::core::inflight::InFlightSet;
use crate::core::{reporter, retry};
use crate::error::{JobError, JobResult};
use crate::queue::TaskQueue;
use crate::task::Invocation;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// How a worker settled an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Attempt succeeded
    Completed,
    /// Attempt failed, next attempt scheduled
    Retried,
    /// Put back without running, task was busy or the pool is stopping
    Deferred,
    /// Invocation failed terminally
    Failed,
}

/// Statistics about worker performance
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Number of active workers
    pub active_workers: usize,
    /// Total number of workers spawned
    pub total_workers: usize,
    /// Invocations completed
    pub completed: u64,
    /// Attempts that failed and were re-queued
    pub retried: u64,
    /// Invocations put back without running
    pub deferred: u64,
    /// Invocations that failed terminally
    pub failed: u64,
    /// Average attempt duration in milliseconds
    pub avg_attempt_ms: Option<u64>,
}

/// Everything a worker needs, shared by the whole pool.
#[derive(Clone)]
pub struct WorkerContext {
    /// Queue to drain
    pub queue: TaskQueue,
    /// Runs attempts
    pub runner: Arc<TaskRunner>,
    /// Guards exclusive tasks
    pub inflight: InFlightSet,
    /// Worker settings
    pub config: WorkerConfig,
}

/// Individual worker that processes invocations
pub struct Worker {
    id: usize,
    ctx: WorkerContext,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    /// Create a new worker with the given ID
    pub fn new(id: usize, ctx: WorkerContext, stats: Arc<Mutex<WorkerStats>>) -> Self {
        Self { id, ctx, stats }
    }

    /// Run the worker loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("Worker {} started", self.id);

        let mut empty_polls = 0u32;
        while !cancel.is_cancelled() {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.ctx.queue.dequeue() => next,
            };

            match next {
                Ok(Some(invocation)) => {
                    empty_polls = 0;
                    if let Err(e) = self.process(invocation, &cancel).await {
                        tracing::error!("Worker {} could not settle invocation: {}", self.id, e);
                    }
                }
                Ok(None) => {
                    empty_polls = empty_polls.saturating_add(1);
                    let backoff = idle_backoff(empty_polls, self.ctx.config.idle_timeout_ms);
                    tracing::trace!("Worker {} idle, backing off {:?}", self.id, backoff);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("Worker {} dequeue error: {}", self.id, e);
                    empty_polls = empty_polls.saturating_add(1);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(idle_backoff(empty_polls, self.ctx.config.idle_timeout_ms)) => {}
                    }
                }
            }
        }

        tracing::info!("Worker {} stopped", self.id);
    }

    /// Run one attempt of `invocation` and settle it with the queue.
    pub async fn process(
        &self,
        invocation: Invocation,
        cancel: &CancellationToken,
    ) -> JobResult<Settlement> {
        let queue = &self.ctx.queue;
        let definition = match self.ctx.runner.registry().resolve(&invocation.task_id) {
            Ok(definition) => definition.clone(),
            Err(e) => {
                queue.fail(&invocation.id, &e).await?;
                reporter::report_invocation(&invocation, 0, &Err(e), Duration::ZERO);
                self.record(Settlement::Failed, None).await;
                return Ok(Settlement::Failed);
            }
        };

        let _claim = if definition.is_exclusive() {
            match self.ctx.inflight.try_acquire(&[definition.id()]) {
                Some(guard) => Some(guard),
                None => {
                    tracing::debug!(
                        invocation_id = %invocation.id,
                        task_id = definition.id(),
                        "Task busy, deferring invocation"
                    );
                    queue
                        .defer(&invocation.id, Duration::from_millis(self.ctx.config.defer_delay_ms))
                        .await?;
                    self.record(Settlement::Deferred, None).await;
                    return Ok(Settlement::Deferred);
                }
            }
        } else {
            None
        };

        tracing::debug!(
            "Worker {} running {} (attempt {}) of task {}",
            self.id,
            invocation.id,
            invocation.attempt,
            invocation.task_id
        );

        let attempt_timeout = self.ctx.config.task_timeout_secs.map(Duration::from_secs);
        let started = Instant::now();
        let handle = {
            let runner = Arc::clone(&self.ctx.runner);
            let definition = definition.clone();
            let invocation = invocation.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                runner
                    .attempt(&definition, &invocation, attempt_timeout, cancel)
                    .await
            })
        };
        let result = match self.hold_lease(&invocation.id, handle).await {
            Ok(result) => result,
            Err(join_error) => Err(JobError::fatal(format!("Executor panicked: {join_error}"))),
        };
        let elapsed = started.elapsed();

        let settlement = match result {
            Ok(value) => {
                queue.complete(&invocation.id, value.clone()).await?;
                reporter::report_invocation(&invocation, invocation.attempt, &Ok(value), elapsed);
                Settlement::Completed
            }
            Err(JobError::Cancelled) => {
                // Stopping; the attempt did not count.
                queue.defer(&invocation.id, Duration::ZERO).await?;
                Settlement::Deferred
            }
            Err(e) => {
                let policy = self.ctx.runner.registry().policy_for(&definition);
                if retry::should_retry(policy, invocation.attempt, &e) {
                    let delay = retry::next_delay(policy, invocation.attempt);
                    tracing::warn!(
                        task_id = %invocation.task_id,
                        invocation_id = %invocation.id,
                        attempt = invocation.attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying: {}",
                        e
                    );
                    queue.retry(&invocation.id, delay, &e).await?;
                    Settlement::Retried
                } else {
                    let terminal = if e.is_retryable() {
                        JobError::RetriesExhausted {
                            task_id: invocation.task_id.clone(),
                            attempts: invocation.attempt,
                            last_error: e.to_string(),
                        }
                    } else {
                        e
                    };
                    queue.fail(&invocation.id, &terminal).await?;
                    reporter::report_invocation(
                        &invocation,
                        invocation.attempt,
                        &Err(terminal),
                        elapsed,
                    );
                    Settlement::Failed
                }
            }
        };

        self.record(settlement, Some(elapsed)).await;
        Ok(settlement)
    }

    /// Wait for a running attempt, renewing its lease at half the visibility
    /// timeout so no other worker picks the invocation up meanwhile.
    async fn hold_lease(
        &self,
        id: &str,
        mut handle: JoinHandle<JobResult<Value>>,
    ) -> Result<JobResult<Value>, JoinError> {
        let every = (self.ctx.queue.visibility_timeout() / 2).max(Duration::from_millis(10));
        let mut renewal = interval_at(Instant::now() + every, every);

        loop {
            tokio::select! {
                joined = &mut handle => return joined,
                _ = renewal.tick() => {
                    if let Err(e) = self.ctx.queue.renew_lease(id).await {
                        tracing::warn!(invocation_id = id, "Could not renew lease: {}", e);
                    }
                }
            }
        }
    }

    async fn record(&self, settlement: Settlement, duration: Option<Duration>) {
        let mut stats = self.stats.lock().await;

        match settlement {
            Settlement::Completed => stats.completed += 1,
            Settlement::Retried => stats.retried += 1,
            Settlement::Deferred => stats.deferred += 1,
            Settlement::Failed => stats.failed += 1,
        }

        if let Some(duration) = duration {
            let sample = duration.as_millis() as u64;
            stats.avg_attempt_ms = Some(match stats.avg_attempt_ms {
                Some(avg) => (avg + sample) / 2,
                None => sample,
            });
        }
    }
}

/// Delay before polling an empty queue again: doubles from 10ms up to `max_ms`.
pub fn idle_backoff(empty_polls: u32, max_ms: u64) -> Duration {
    let exponent = empty_polls.saturating_sub(1).min(16);
    Duration::from_millis((10u64 << exponent).min(max_ms.max(1)))
}

/// Result of shutting the pool down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// Workers that stopped cleanly
    pub stopped: usize,
    /// Workers that ended with a join error
    pub errors: usize,
    /// Workers that had to be aborted
    pub timeouts: usize,
}

impl fmt::Display for ShutdownSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stopped, {} errors, {} timeouts",
            self.stopped, self.errors, self.timeouts
        )
    }
}

/// Manages the worker pool
pub struct WorkerPool {
    ctx: WorkerContext,
    active_workers: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<Mutex<WorkerStats>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create a pool with no workers yet.
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            active_workers: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the configured number of workers.
    pub async fn start(&self) {
        for worker_id in 0..self.ctx.config.num_workers {
            self.spawn_worker(worker_id).await;
        }
    }

    /// Spawn a new worker
    pub async fn spawn_worker(&self, worker_id: usize) {
        let active_workers = Arc::clone(&self.active_workers);
        let stats = Arc::clone(&self.stats);
        let worker = Worker::new(worker_id, self.ctx.clone(), Arc::clone(&self.stats));
        let cancel = self.cancel.clone();

        {
            let mut stats = stats.lock().await;
            stats.total_workers += 1;
        }

        // Count the worker before it is scheduled so callers see it at once.
        active_workers.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(async move {
            worker.run(cancel).await;
            active_workers.fetch_sub(1, Ordering::Relaxed);
        });

        self.handles.lock().await.push(handle);
        tracing::debug!("Spawned worker {}", worker_id);
    }

    /// Get current worker statistics
    pub async fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().await.clone();
        stats.active_workers = self.active_worker_count();
        stats
    }

    /// Get the number of active workers
    pub fn active_worker_count(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Stop all workers, waiting up to `timeout_duration` for each.
    ///
    /// Running attempts are cancelled and their invocations put back.
    pub async fn shutdown(&self, timeout_duration: Duration) -> ShutdownSummary {
        self.cancel.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        tracing::info!(
            "Shutting down {} workers with timeout {:?}",
            handles.len(),
            timeout_duration
        );

        let mut summary = ShutdownSummary::default();
        for (i, mut handle) in handles.into_iter().enumerate() {
            match timeout(timeout_duration, &mut handle).await {
                Ok(Ok(())) => summary.stopped += 1,
                Ok(Err(e)) => {
                    summary.errors += 1;
                    tracing::error!("Worker handle {} error: {}", i, e);
                }
                Err(_) => {
                    summary.timeouts += 1;
                    tracing::warn!("Worker handle {} timed out, aborting", i);
                    handle.abort();
                }
            }
        }

        tracing::info!("Worker shutdown complete: {}", summary);
        summary
    }
}
