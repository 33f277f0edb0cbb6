//! Task execution with validation, retries, deadlines and cancellation.
//!
//! [`TaskRunner::execute`] drives one invocation to a terminal state:
//! the payload is validated first (never retried), then the executor is
//! attempted until it succeeds, fails fatally or the retry policy gives up.
//! Backoff sleeps race against the deadline and the cancellation token, so a
//! timed-out or cancelled invocation never fires a late retry.
//!
//! Workers use [`TaskRunner::attempt`] instead, which runs exactly one
//! attempt and leaves rescheduling to the queue.

use crate::core::registry::{TaskDefinition, TaskRegistry};
use crate::core::retry;
use crate::error::{JobError, JobResult};
use crate::task::{ExecutionContext, ExecutionResult, Invocation};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

/// Statistics for a task id.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    /// Total number of attempts executed
    pub total_executed: u64,
    /// Number of successful attempts
    pub successful: u64,
    /// Number of failed attempts
    pub failed: u64,
    /// Number of timed out invocations
    pub timed_out: u64,
    /// Number of payloads rejected by the schema
    pub rejected: u64,
    /// Average attempt duration
    pub avg_duration_ms: Option<u64>,
    /// Last execution time
    pub last_executed: Option<SystemTime>,
}

/// Everything that happened to one invocation.
#[derive(Debug)]
pub struct InvocationReport {
    /// Final invocation state
    pub invocation: Invocation,
    /// One entry per attempt, in order
    pub attempts: Vec<ExecutionResult>,
    /// Executor output or the terminal failure
    pub outcome: JobResult<serde_json::Value>,
}

impl InvocationReport {
    /// Whether the invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Number of times the executor was invoked.
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    fn rejected(mut invocation: Invocation, error: JobError) -> Self {
        invocation.fail(&error);
        Self {
            invocation,
            attempts: Vec::new(),
            outcome: Err(error),
        }
    }
}

/// Runs task executors and keeps per-task statistics.
pub struct TaskRunner {
    registry: Arc<TaskRegistry>,
    stats: RwLock<HashMap<String, TaskStats>>,
}

impl TaskRunner {
    /// Create a runner over a frozen registry.
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// The registry this runner resolves tasks from.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Resolve `task_id` and execute it to completion.
    pub async fn execute_by_id(
        &self,
        task_id: &str,
        payload: serde_json::Value,
        deadline: Option<Duration>,
        cancel: CancellationToken,
    ) -> InvocationReport {
        match self.registry.resolve(task_id) {
            Ok(definition) => self.execute(definition, payload, deadline, cancel).await,
            Err(e) => InvocationReport::rejected(Invocation::new(task_id, payload), e),
        }
    }

    /// Validate the payload and run attempts until a terminal outcome.
    pub async fn execute(
        &self,
        definition: &TaskDefinition,
        payload: serde_json::Value,
        deadline: Option<Duration>,
        cancel: CancellationToken,
    ) -> InvocationReport {
        let mut invocation = Invocation::new(definition.id(), payload);

        if let Err(e) = definition.validate(&invocation.payload) {
            tracing::warn!(
                task_id = definition.id(),
                invocation_id = %invocation.id,
                "Payload rejected: {}",
                e
            );
            self.record_rejection(definition.id()).await;
            return InvocationReport::rejected(invocation, e);
        }

        let policy = self.registry.policy_for(definition).clone();
        let deadline_at = deadline.map(|d| Instant::now() + d);
        let timeout_error = || JobError::Timeout {
            timeout_ms: deadline.map(|d| d.as_millis() as u64).unwrap_or_default(),
        };
        let mut attempts = Vec::new();

        loop {
            let ctx = ExecutionContext {
                invocation_id: invocation.id.clone(),
                task_id: definition.id().to_string(),
                attempt: invocation.attempt,
                cancel: cancel.child_token(),
            };
            invocation.status = crate::task::InvocationStatus::Running;

            let started = std::time::Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(JobError::Cancelled),
                _ = wait_until(deadline_at) => Err(timeout_error()),
                r = definition.executor().execute(invocation.payload.clone(), ctx.clone()) => r,
            };
            ctx.cancel.cancel();
            self.update_stats(definition.id(), &result, started.elapsed())
                .await;

            let error = match result {
                Ok(value) => {
                    tracing::debug!(
                        task_id = definition.id(),
                        invocation_id = %invocation.id,
                        attempt = invocation.attempt,
                        "Attempt succeeded"
                    );
                    attempts.push(ExecutionResult::success(invocation.attempt, value.clone()));
                    invocation.complete(value.clone());
                    return InvocationReport {
                        invocation,
                        attempts,
                        outcome: Ok(value),
                    };
                }
                Err(e) => e,
            };

            let interrupted = matches!(error, JobError::Timeout { .. } | JobError::Cancelled);
            if !interrupted && retry::should_retry(&policy, invocation.attempt, &error) {
                let delay = retry::next_delay(&policy, invocation.attempt);
                tracing::warn!(
                    task_id = definition.id(),
                    invocation_id = %invocation.id,
                    attempt = invocation.attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying: {}",
                    error
                );
                attempts.push(ExecutionResult::failed(invocation.attempt, &error, true));
                invocation.schedule_retry(delay, &error);

                let interrupted_by = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Some(JobError::Cancelled),
                    _ = wait_until(deadline_at) => Some(timeout_error()),
                    _ = sleep(delay) => None,
                };
                if let Some(e) = interrupted_by {
                    return self.finish_failed(definition, invocation, attempts, e).await;
                }
                continue;
            }

            attempts.push(ExecutionResult::failed(invocation.attempt, &error, false));
            let terminal = if error.is_retryable() {
                JobError::RetriesExhausted {
                    task_id: definition.id().to_string(),
                    attempts: invocation.attempt,
                    last_error: error.to_string(),
                }
            } else {
                error
            };
            return self
                .finish_failed(definition, invocation, attempts, terminal)
                .await;
        }
    }

    /// Run exactly one attempt of a queued invocation.
    ///
    /// The payload was validated when it was enqueued. `timeout` bounds this
    /// attempt only.
    pub async fn attempt(
        &self,
        definition: &TaskDefinition,
        invocation: &Invocation,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> JobResult<serde_json::Value> {
        let ctx = ExecutionContext {
            invocation_id: invocation.id.clone(),
            task_id: definition.id().to_string(),
            attempt: invocation.attempt,
            cancel: cancel.child_token(),
        };
        let deadline_at = timeout.map(|d| Instant::now() + d);

        let started = std::time::Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(JobError::Cancelled),
            _ = wait_until(deadline_at) => Err(JobError::Timeout {
                timeout_ms: timeout.map(|d| d.as_millis() as u64).unwrap_or_default(),
            }),
            r = definition.executor().execute(invocation.payload.clone(), ctx.clone()) => r,
        };
        ctx.cancel.cancel();
        self.update_stats(definition.id(), &result, started.elapsed())
            .await;
        result
    }

    async fn finish_failed(
        &self,
        definition: &TaskDefinition,
        mut invocation: Invocation,
        attempts: Vec<ExecutionResult>,
        error: JobError,
    ) -> InvocationReport {
        if matches!(error, JobError::Timeout { .. }) {
            let mut stats = self.stats.write().await;
            stats.entry(definition.id().to_string()).or_default().timed_out += 1;
        }

        tracing::error!(
            task_id = definition.id(),
            invocation_id = %invocation.id,
            attempts = attempts.len(),
            error_kind = error.kind(),
            "Invocation failed: {}",
            error
        );
        invocation.fail(&error);
        InvocationReport {
            invocation,
            attempts,
            outcome: Err(error),
        }
    }

    /// Statistics for one task id.
    pub async fn stats(&self, task_id: &str) -> Option<TaskStats> {
        let stats = self.stats.read().await;
        stats.get(task_id).cloned()
    }

    /// Statistics for every task id that has run.
    pub async fn all_stats(&self) -> HashMap<String, TaskStats> {
        let stats = self.stats.read().await;
        stats.clone()
    }

    async fn record_rejection(&self, task_id: &str) {
        let mut stats = self.stats.write().await;
        stats.entry(task_id.to_string()).or_default().rejected += 1;
    }

    /// Update statistics for a task attempt.
    async fn update_stats(
        &self,
        task_id: &str,
        result: &JobResult<serde_json::Value>,
        duration: Duration,
    ) {
        let mut stats = self.stats.write().await;
        let task_stats = stats.entry(task_id.to_string()).or_default();

        task_stats.total_executed += 1;
        task_stats.last_executed = Some(SystemTime::now());

        match result {
            Ok(_) => task_stats.successful += 1,
            Err(_) => task_stats.failed += 1,
        }

        // Exponential moving average
        let sample = duration.as_millis() as f64;
        task_stats.avg_duration_ms = Some(match task_stats.avg_duration_ms {
            Some(avg) => {
                let alpha = 0.1;
                (alpha * sample + (1.0 - alpha) * avg as f64) as u64
            }
            None => sample as u64,
        });
    }
}

/// Sleeps until `deadline`, or forever when there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
