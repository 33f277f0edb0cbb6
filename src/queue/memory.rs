//! In-memory queue implementation.
//!
//! Stores every invocation in process memory behind a single async lock.
//! Suits development, tests and single-process deployments where queued
//! invocations need not survive a restart.
//!
//! Due-ness is decided by wall-clock time: an invocation is due once its
//! `next_attempt_at` has passed. Running invocations hold a lease for the
//! configured visibility timeout; an expired lease puts the invocation back
//! at the front of the queue.

use super::{QueueBackend, QueueConfig, QueueStats};
use crate::error::{JobError, JobResult};
use crate::task::{Invocation, InvocationId, InvocationStatus, after};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct QueueState {
    /// Every known invocation indexed by id
    invocations: HashMap<InvocationId, Invocation>,
    /// Ids waiting to run, FIFO
    ready: VecDeque<InvocationId>,
    /// Running ids and when their lease expires
    leases: HashMap<InvocationId, DateTime<Utc>>,
    /// Terminal invocations since start
    total_processed: u64,
}

impl QueueState {
    fn running_mut(&mut self, id: &str) -> JobResult<&mut Invocation> {
        if self.leases.remove(id).is_none() {
            return Err(JobError::queue(format!("Invocation '{id}' is not running")));
        }
        self.invocations
            .get_mut(id)
            .ok_or_else(|| JobError::queue(format!("Invocation '{id}' not found")))
    }

    /// Put invocations with expired leases back in front of the queue.
    fn release_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<InvocationId> = self
            .leases
            .iter()
            .filter(|(_, expires_at)| now >= **expires_at)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            self.leases.remove(&id);
            if let Some(invocation) = self.invocations.get_mut(&id) {
                tracing::warn!(
                    invocation_id = %id,
                    task_id = %invocation.task_id,
                    "Lease expired, making invocation visible again"
                );
                invocation.status = InvocationStatus::Pending;
                invocation.updated_at = now;
                self.ready.push_front(id);
            }
        }
    }
}

/// In-memory queue backend implementation
#[derive(Debug)]
pub struct InMemoryQueue {
    state: RwLock<QueueState>,
    config: QueueConfig,
}

impl InMemoryQueue {
    /// Create a new in-memory queue with default configuration
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create a new in-memory queue with custom configuration
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            config,
        }
    }

    fn is_full(&self, state: &QueueState) -> bool {
        // Zero means unlimited.
        self.config.max_queue_size != 0
            && state
                .invocations
                .values()
                .filter(|i| !i.status.is_terminal())
                .count()
                >= self.config.max_queue_size
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        after(now, Duration::from_secs(self.config.visibility_timeout_secs))
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn enqueue(&self, mut invocation: Invocation) -> JobResult<InvocationId> {
        let mut state = self.state.write().await;

        if self.is_full(&state) {
            return Err(JobError::queue(format!(
                "Queue is full (max size: {})",
                self.config.max_queue_size
            )));
        }
        if state.invocations.contains_key(&invocation.id) {
            return Err(JobError::queue(format!(
                "Invocation '{}' is already queued",
                invocation.id
            )));
        }

        invocation.status = InvocationStatus::Pending;
        invocation.updated_at = Utc::now();

        let id = invocation.id.clone();
        tracing::debug!(invocation_id = %id, task_id = %invocation.task_id, "Enqueued invocation");
        state.ready.push_back(id.clone());
        state.invocations.insert(id.clone(), invocation);
        Ok(id)
    }

    async fn dequeue(&self) -> JobResult<Option<Invocation>> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        state.release_expired(now);

        let state = &mut *state;
        let due = state.ready.iter().position(|id| {
            state
                .invocations
                .get(id)
                .is_some_and(|i| i.next_attempt_at.is_none_or(|at| at <= now))
        });
        let Some(id) = due.and_then(|index| state.ready.remove(index)) else {
            return Ok(None);
        };

        let lease = self.lease_until(now);
        let Some(invocation) = state.invocations.get_mut(&id) else {
            return Ok(None);
        };
        invocation.status = InvocationStatus::Running;
        invocation.updated_at = now;
        let running = invocation.clone();
        state.leases.insert(id.clone(), lease);

        tracing::debug!(invocation_id = %id, attempt = running.attempt, "Dequeued invocation");
        Ok(Some(running))
    }

    async fn renew_lease(&self, id: &str) -> JobResult<()> {
        let now = Utc::now();
        let lease = self.lease_until(now);
        let mut state = self.state.write().await;
        match state.leases.get_mut(id) {
            Some(expires_at) => {
                *expires_at = lease;
                tracing::trace!(invocation_id = id, "Renewed lease");
                Ok(())
            }
            None => Err(JobError::queue(format!("Invocation '{id}' is not running"))),
        }
    }

    fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.config.visibility_timeout_secs)
    }

    async fn complete(&self, id: &str, result: serde_json::Value) -> JobResult<()> {
        let mut state = self.state.write().await;
        state.running_mut(id)?.complete(result);
        state.total_processed += 1;

        tracing::debug!(invocation_id = id, "Completed invocation");
        Ok(())
    }

    async fn retry(&self, id: &str, delay: Duration, error: &JobError) -> JobResult<()> {
        let mut state = self.state.write().await;
        state.running_mut(id)?.schedule_retry(delay, error);
        state.ready.push_back(id.to_string());

        tracing::debug!(invocation_id = id, delay_ms = delay.as_millis() as u64, "Requeued invocation for retry");
        Ok(())
    }

    async fn defer(&self, id: &str, delay: Duration) -> JobResult<()> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let invocation = state.running_mut(id)?;
        invocation.status = if invocation.attempt > 1 {
            InvocationStatus::Retrying
        } else {
            InvocationStatus::Pending
        };
        invocation.next_attempt_at = Some(after(now, delay));
        invocation.updated_at = now;
        state.ready.push_back(id.to_string());

        tracing::debug!(invocation_id = id, "Deferred invocation");
        Ok(())
    }

    async fn fail(&self, id: &str, error: &JobError) -> JobResult<()> {
        let mut state = self.state.write().await;
        state.running_mut(id)?.fail(error);
        state.total_processed += 1;

        tracing::debug!(invocation_id = id, "Failed invocation: {}", error);
        Ok(())
    }

    async fn get(&self, id: &str) -> JobResult<Option<Invocation>> {
        let state = self.state.read().await;
        Ok(state.invocations.get(id).cloned())
    }

    async fn stats(&self) -> JobResult<QueueStats> {
        let state = self.state.read().await;
        let mut stats = QueueStats {
            total_processed: state.total_processed,
            ..Default::default()
        };

        for invocation in state.invocations.values() {
            match invocation.status {
                InvocationStatus::Pending => stats.pending += 1,
                InvocationStatus::Running => stats.running += 1,
                InvocationStatus::Retrying => stats.retrying += 1,
                InvocationStatus::Completed => stats.completed += 1,
                InvocationStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }

    async fn cleanup(&self) -> JobResult<u64> {
        let now = Utc::now();
        let cutoff = now
            .checked_sub_signed(
                chrono::Duration::from_std(Duration::from_secs(self.config.retention_secs))
                    .unwrap_or(chrono::Duration::MAX),
            )
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut state = self.state.write().await;
        state.release_expired(now);

        let before = state.invocations.len();
        state
            .invocations
            .retain(|_, i| !(i.status.is_terminal() && i.updated_at < cutoff));
        let cleaned = (before - state.invocations.len()) as u64;

        if cleaned > 0 {
            tracing::info!("Cleaned up {} old invocations", cleaned);
        }
        Ok(cleaned)
    }

    async fn purge(&self) -> JobResult<u64> {
        let mut state = self.state.write().await;
        let purged = state.invocations.len() as u64;

        state.invocations.clear();
        state.ready.clear();
        state.leases.clear();
        // total_processed is kept as historical data

        tracing::warn!("Purged {} invocations from queue", purged);
        Ok(purged)
    }

    async fn health_check(&self) -> JobResult<()> {
        let state = self.state.read().await;

        let orphaned = state
            .ready
            .iter()
            .chain(state.leases.keys())
            .filter(|id| !state.invocations.contains_key(*id))
            .count();
        if orphaned > 0 {
            return Err(JobError::queue(format!(
                "{orphaned} queued ids have no invocation record"
            )));
        }

        tracing::debug!(
            "Queue health check: {} invocations, {} ready, {} running",
            state.invocations.len(),
            state.ready.len(),
            state.leases.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(task_id: &str) -> Invocation {
        Invocation::new(task_id, json!({"companyId": "c1"}))
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_is_fifo() {
        let queue = InMemoryQueue::new();
        let first = queue.enqueue(invocation("a")).await.unwrap();
        let second = queue.enqueue(invocation("b")).await.unwrap();

        let dequeued = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(dequeued.id, first);
        assert_eq!(dequeued.status, InvocationStatus::Running);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, second);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(invocation("a")).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.complete(&id, json!({"success": true})).await.unwrap();

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvocationStatus::Completed);
        assert_eq!(stored.result, Some(json!({"success": true})));

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total_processed, 1);
    }

    #[tokio::test]
    async fn test_settling_requires_a_lease() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(invocation("a")).await.unwrap();

        assert!(queue.complete(&id, json!(null)).await.is_err());
        assert!(queue.fail("missing", &JobError::Cancelled).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_increments_attempt_and_delays() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(invocation("a")).await.unwrap();
        queue.dequeue().await.unwrap();

        queue
            .retry(&id, Duration::from_secs(60), &JobError::transient("smtp down"))
            .await
            .unwrap();

        let stored = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.attempt, 2);
        assert_eq!(stored.status, InvocationStatus::Retrying);
        assert!(stored.last_error.unwrap().contains("smtp down"));

        // Not due for another minute
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().retrying, 1);
    }

    #[tokio::test]
    async fn test_retry_without_delay_is_due_immediately() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(invocation("a")).await.unwrap();
        queue.dequeue().await.unwrap();
        queue
            .retry(&id, Duration::ZERO, &JobError::transient("flaky"))
            .await
            .unwrap();

        let retried = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.attempt, 2);
    }

    #[tokio::test]
    async fn test_defer_keeps_attempt() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(invocation("a")).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.defer(&id, Duration::ZERO).await.unwrap();

        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn test_fail_is_terminal() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(invocation("a")).await.unwrap();
        queue.dequeue().await.unwrap();
        queue
            .fail(&id, &JobError::fatal("company not found"))
            .await
            .unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        let failed = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(failed.status, InvocationStatus::Failed);
        assert!(failed.status.is_terminal());
        assert_eq!(queue.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_expired_lease_makes_invocation_visible() {
        let queue = InMemoryQueue::with_config(QueueConfig {
            visibility_timeout_secs: 0,
            ..Default::default()
        });
        let id = queue.enqueue(invocation("a")).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.id, id);
    }

    #[tokio::test]
    async fn test_queue_size_limit() {
        let queue = InMemoryQueue::with_config(QueueConfig {
            max_queue_size: 2,
            ..Default::default()
        });

        queue.enqueue(invocation("a")).await.unwrap();
        let second = queue.enqueue(invocation("b")).await.unwrap();
        assert!(matches!(
            queue.enqueue(invocation("c")).await,
            Err(JobError::Queue { .. })
        ));

        // Terminal invocations do not count towards the limit.
        queue.dequeue().await.unwrap();
        let running = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(running.id, second);
        queue.complete(&second, json!({})).await.unwrap();
        assert!(queue.enqueue(invocation("c")).await.is_ok());
    }

    #[tokio::test]
    async fn test_renewed_lease_stays_hidden() {
        let queue = InMemoryQueue::with_config(QueueConfig {
            visibility_timeout_secs: 1,
            ..Default::default()
        });
        let id = queue.enqueue(invocation("a")).await.unwrap();
        queue.dequeue().await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        queue.renew_lease(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        // 1.2s after dequeue, but only 0.6s after the renewal.
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().running, 1);
        assert!(queue.renew_lease("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let queue = InMemoryQueue::new();
        let id = queue.enqueue(invocation("a")).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.complete(&id, json!({})).await.unwrap();
        assert_eq!(queue.cleanup().await.unwrap(), 0);

        let expired = InMemoryQueue::with_config(QueueConfig {
            retention_secs: 0,
            ..Default::default()
        });
        let id = expired.enqueue(invocation("a")).await.unwrap();
        expired.dequeue().await.unwrap();
        expired.complete(&id, json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(expired.cleanup().await.unwrap(), 1);
        assert!(expired.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge() {
        let queue = InMemoryQueue::new();
        for i in 1..=3 {
            queue.enqueue(invocation(&format!("task-{i}"))).await.unwrap();
        }

        assert_eq!(queue.purge().await.unwrap(), 3);
        assert_eq!(queue.stats().await.unwrap().pending, 0);
        assert!(queue.health_check().await.is_ok());
    }
}
