//! Error types for jobsmith operations.

use thiserror::Error;

/// Result type used throughout jobsmith.
pub type JobResult<T> = Result<T, JobError>;

/// A single payload field that failed schema validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Field name (`$` for the payload itself)
    pub field: String,
    /// Why the field was rejected
    pub reason: String,
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Main error type for jobsmith operations.
#[derive(Error, Debug)]
pub enum JobError {
    /// Deployment configuration is missing or invalid
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Caller presented a missing or wrong credential
    #[error("Unauthorized")]
    Unauthorized,

    /// Payload did not match the task's schema
    #[error("Payload validation failed for '{task_id}': {}", join_violations(.violations))]
    Validation {
        /// Task the payload was meant for
        task_id: String,
        /// Every rejected field
        violations: Vec<FieldViolation>,
    },

    /// Executor failed in a way that may succeed on a later attempt
    #[error("Task execution failed: {message}")]
    Transient {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Executor failed and must not be retried
    #[error("Task execution failed permanently: {message}")]
    Fatal {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invocation deadline elapsed
    #[error("Invocation timed out after {timeout_ms}ms")]
    Timeout {
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// Invocation was cancelled by shutdown
    #[error("Invocation cancelled")]
    Cancelled,

    /// Every allowed attempt failed
    #[error("Task '{task_id}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Task identifier
        task_id: String,
        /// Number of attempts made
        attempts: u32,
        /// Message of the final failure
        last_error: String,
    },

    /// Task id registered twice
    #[error("Task '{task_id}' is already registered")]
    DuplicateTaskId {
        /// The duplicated task id
        task_id: String,
    },

    /// Task id not found in registry
    #[error("Task '{task_id}' not found in registry")]
    UnknownTaskId {
        /// The task id that wasn't found
        task_id: String,
    },

    /// Trigger name not configured
    #[error("Trigger '{name}' is not configured")]
    UnknownTrigger {
        /// The trigger name that wasn't found
        name: String,
    },

    /// Another invocation of the task is in flight
    #[error("Task '{task_id}' is already executing")]
    AlreadyExecuting {
        /// The busy task id
        task_id: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue backend error
    #[error("Queue error: {message}")]
    Queue {
        /// Error message
        message: String,
    },

    /// Engine is already running
    #[error("Engine is already running")]
    AlreadyRunning,

    /// Engine is not running
    #[error("Engine is not running")]
    NotRunning,
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl JobError {
    /// Create a retryable execution error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Create a retryable execution error wrapping its cause
    pub fn transient_from<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a non-retryable execution error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a queue error
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Create a validation error with a single violation
    pub fn invalid_field(
        task_id: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Validation {
            task_id: task_id.into(),
            violations: vec![FieldViolation {
                field: field.into(),
                reason: reason.into(),
            }],
        }
    }

    /// Whether the retry policy may re-attempt after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Short machine-readable tag for logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Unauthorized => "unauthorized",
            Self::Validation { .. } => "validation",
            Self::Transient { .. } => "transient",
            Self::Fatal { .. } => "fatal",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::DuplicateTaskId { .. } => "duplicate_task_id",
            Self::UnknownTaskId { .. } => "unknown_task_id",
            Self::UnknownTrigger { .. } => "unknown_trigger",
            Self::AlreadyExecuting { .. } => "already_executing",
            Self::Serialization(_) => "serialization",
            Self::Queue { .. } => "queue",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
        }
    }
}
