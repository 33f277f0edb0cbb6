//! Queue backends for enqueued invocations.
//!
//! Invocations created through the enqueue path are stored in a queue and
//! drained by the worker pool. The queue owns the invocation record: workers
//! dequeue an invocation, run one attempt, and report back with
//! [`QueueBackend::complete`], [`QueueBackend::retry`],
//! [`QueueBackend::defer`] or [`QueueBackend::fail`].
//!
//! Only an in-memory backend ships with jobsmith. It suits a single process;
//! invocations do not survive a restart.
//!
//! # Examples
//!
//! ```rust
//! use jobsmith::queue::{InMemoryQueue, QueueBackend};
//! use jobsmith::task::Invocation;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let queue = InMemoryQueue::new();
//! let id = queue.enqueue(Invocation::new("send-notification", json!({}))).await?;
//! let running = queue.dequeue().await?.expect("invocation is ready");
//! assert_eq!(running.id, id);
//! queue.complete(&id, json!({"success": true})).await?;
//! # Ok::<(), jobsmith::error::JobError>(())
//! # }).unwrap();
//! ```

use crate::config::QueueConfig;
use crate::error::{JobError, JobResult};
use crate::task::{Invocation, InvocationId};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryQueue;

/// Statistics about the queue state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Invocations waiting for their first attempt
    pub pending: u64,
    /// Invocations with an attempt in progress
    pub running: u64,
    /// Invocations waiting for a retry
    pub retrying: u64,
    /// Invocations that completed
    pub completed: u64,
    /// Invocations that failed terminally
    pub failed: u64,
    /// Invocations that reached a terminal state since start
    pub total_processed: u64,
}

/// Trait that all queue backends must implement
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new invocation and make it available to workers.
    async fn enqueue(&self, invocation: Invocation) -> JobResult<InvocationId>;

    /// Take the next invocation that is due.
    ///
    /// Returns `None` if nothing is due. The invocation is marked running and
    /// becomes visible again if it is not settled within the visibility
    /// timeout.
    async fn dequeue(&self) -> JobResult<Option<Invocation>>;

    /// Extend the lease of a running invocation by a full visibility timeout.
    async fn renew_lease(&self, id: &str) -> JobResult<()>;

    /// How long a lease lasts before the invocation becomes visible again.
    fn visibility_timeout(&self) -> Duration;

    /// Settle a running invocation as completed.
    async fn complete(&self, id: &str, result: serde_json::Value) -> JobResult<()>;

    /// Settle a failed attempt and schedule the next one after `delay`.
    async fn retry(&self, id: &str, delay: Duration, error: &JobError) -> JobResult<()>;

    /// Put a running invocation back without counting an attempt.
    async fn defer(&self, id: &str, delay: Duration) -> JobResult<()>;

    /// Settle a running invocation as terminally failed.
    async fn fail(&self, id: &str, error: &JobError) -> JobResult<()>;

    /// Look up an invocation by id.
    async fn get(&self, id: &str) -> JobResult<Option<Invocation>>;

    /// Current queue statistics.
    async fn stats(&self) -> JobResult<QueueStats>;

    /// Release expired leases and drop terminal invocations older than the
    /// retention period. Returns the number of invocations dropped.
    async fn cleanup(&self) -> JobResult<u64>;

    /// Drop every invocation. Returns how many were dropped.
    async fn purge(&self) -> JobResult<u64>;

    /// Check that the backend is usable.
    async fn health_check(&self) -> JobResult<()>;
}

/// Shared queue handle
pub type TaskQueue = Arc<dyn QueueBackend>;

/// Factory methods for creating queue backends
pub struct QueueFactory;

impl QueueFactory {
    /// Create an in-memory queue
    pub fn in_memory(config: QueueConfig) -> TaskQueue {
        Arc::new(InMemoryQueue::with_config(config))
    }
}
