//! Task execution traits and invocation records.

use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Unique identifier for an invocation
pub type InvocationId = String;

/// Status of an invocation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    /// Waiting to be picked up
    Pending,
    /// An attempt is currently executing
    Running,
    /// Last attempt failed, another one is scheduled
    Retrying,
    /// Finished successfully
    Completed,
    /// Finished with a terminal failure
    Failed,
}

impl InvocationStatus {
    /// Whether the invocation has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One concrete run of a task against a payload, tracked until terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// Unique invocation identifier
    pub id: InvocationId,
    /// Task the invocation runs
    pub task_id: String,
    /// Payload handed to the executor
    pub payload: serde_json::Value,
    /// Current attempt number (starts at 1)
    pub attempt: u32,
    /// Current status
    pub status: InvocationStatus,
    /// When the invocation was created
    pub created_at: DateTime<Utc>,
    /// When the invocation was last updated
    pub updated_at: DateTime<Utc>,
    /// Earliest time the next attempt may start
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Message of the most recent failure
    pub last_error: Option<String>,
    /// Result of the successful attempt
    pub result: Option<serde_json::Value>,
}

impl Invocation {
    /// Create a fresh invocation at attempt 1.
    pub fn new(task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            payload,
            attempt: 1,
            status: InvocationStatus::Pending,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
            last_error: None,
            result: None,
        }
    }

    /// Record a failed attempt and schedule the next one after `delay`.
    pub fn schedule_retry(&mut self, delay: std::time::Duration, error: &JobError) {
        let now = Utc::now();
        self.attempt += 1;
        self.status = InvocationStatus::Retrying;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = Some(after(now, delay));
        self.updated_at = now;
    }

    /// Mark the invocation as successfully finished.
    pub fn complete(&mut self, result: serde_json::Value) {
        self.status = InvocationStatus::Completed;
        self.result = Some(result);
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
    }

    /// Mark the invocation as terminally failed.
    pub fn fail(&mut self, error: &JobError) {
        self.status = InvocationStatus::Failed;
        self.last_error = Some(error.to_string());
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
    }
}

/// `now + delay`, saturating at the latest representable time.
pub(crate) fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Outcome tag of a single attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Attempt succeeded
    Success,
    /// Attempt failed terminally
    Failure,
    /// Attempt failed and another attempt follows
    Retrying,
}

/// Result of one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Outcome tag
    pub outcome: Outcome,
    /// Attempt number this result belongs to
    pub attempt: u32,
    /// Executor output on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure message otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    pub(crate) fn success(attempt: u32, value: serde_json::Value) -> Self {
        Self {
            outcome: Outcome::Success,
            attempt,
            result: Some(value),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn failed(attempt: u32, error: &JobError, retrying: bool) -> Self {
        Self {
            outcome: if retrying {
                Outcome::Retrying
            } else {
                Outcome::Failure
            },
            attempt,
            result: None,
            error: Some(error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

/// Per-attempt information handed to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Invocation being executed
    pub invocation_id: InvocationId,
    /// Task identifier
    pub task_id: String,
    /// Attempt number (starts at 1)
    pub attempt: u32,
    /// Fires when the invocation is cancelled or its deadline elapses
    pub cancel: CancellationToken,
}

/// Executes one task type from its JSON payload.
///
/// Executors receive payloads that already passed the task's schema. Return
/// [`JobError::Transient`] for failures worth retrying and
/// [`JobError::Fatal`] for failures that are not.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run a single attempt.
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: ExecutionContext,
    ) -> JobResult<serde_json::Value>;
}

/// Executor backed by an async closure.
pub struct FnExecutor<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskExecutor`].
///
/// ```rust
/// use jobsmith::task::executor_fn;
///
/// let echo = executor_fn(|payload, _ctx| async move { Ok(payload) });
/// # let _ = echo;
/// ```
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(serde_json::Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult<serde_json::Value>> + Send,
{
    FnExecutor { f }
}

#[async_trait]
impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(serde_json::Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult<serde_json::Value>> + Send,
{
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: ExecutionContext,
    ) -> JobResult<serde_json::Value> {
        (self.f)(payload, ctx).await
    }
}

/// Deserialize a validated payload into its typed form.
///
/// A mismatch here means the schema is looser than the type, so it is
/// reported as a validation failure rather than retried.
pub fn parse_payload<P: DeserializeOwned>(task_id: &str, payload: serde_json::Value) -> JobResult<P> {
    serde_json::from_value(payload)
        .map_err(|e| JobError::invalid_field(task_id, "$", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_new_invocation_starts_at_first_attempt() {
        let invocation = Invocation::new("send-notification", json!({"userId": "u1"}));
        assert_eq!(invocation.attempt, 1);
        assert_eq!(invocation.status, InvocationStatus::Pending);
        assert!(invocation.next_attempt_at.is_none());
        assert!(!invocation.id.is_empty());
    }

    #[test]
    fn test_invocation_lifecycle() {
        let mut invocation = Invocation::new("generate-report", json!({}));

        invocation.schedule_retry(Duration::from_secs(2), &JobError::transient("db down"));
        assert_eq!(invocation.attempt, 2);
        assert_eq!(invocation.status, InvocationStatus::Retrying);
        assert!(invocation.next_attempt_at.unwrap() > invocation.created_at);
        assert!(invocation.last_error.as_deref().unwrap().contains("db down"));

        invocation.complete(json!({"success": true}));
        assert!(invocation.status.is_terminal());
        assert!(invocation.next_attempt_at.is_none());
        assert_eq!(invocation.result, Some(json!({"success": true})));
    }

    #[test]
    fn test_invocation_serializes_camel_case() {
        let invocation = Invocation::new("t", json!({}));
        let value = serde_json::to_value(&invocation).unwrap();
        assert!(value.get("taskId").is_some());
        assert!(value.get("createdAt").is_some());
        assert_eq!(value["status"], "pending");
    }

    #[tokio::test]
    async fn test_fn_executor_forwards_payload_and_context() {
        let executor = executor_fn(|payload, ctx: ExecutionContext| async move {
            Ok(json!({"echo": payload, "attempt": ctx.attempt}))
        });

        let ctx = ExecutionContext {
            invocation_id: "inv-1".to_string(),
            task_id: "echo".to_string(),
            attempt: 2,
            cancel: CancellationToken::new(),
        };

        let result = executor.execute(json!({"a": 1}), ctx).await.unwrap();
        assert_eq!(result, json!({"echo": {"a": 1}, "attempt": 2}));
    }

    #[test]
    fn test_parse_payload_mismatch_is_validation_error() {
        #[derive(Debug, Deserialize)]
        struct Payload {
            #[allow(dead_code)]
            count: u32,
        }

        let err = parse_payload::<Payload>("count-task", json!({"count": "three"})).unwrap_err();
        assert!(matches!(err, JobError::Validation { .. }));
    }
}
