//! Task registry for jobsmith.
//!
//! The registry maps task identifiers to their definitions: payload schema,
//! executor, optional retry policy and concurrency flags. It is assembled once
//! at startup through [`RegistryBuilder`] and then shared read-only behind an
//! `Arc`, so lookups need no locking.
//!
//! # Examples
//!
//! ```rust
//! use jobsmith::core::registry::RegistryBuilder;
//! use jobsmith::config::RetryPolicy;
//! use jobsmith::schema::{FieldSpec, PayloadSchema};
//! use jobsmith::task::executor_fn;
//!
//! let mut builder = RegistryBuilder::new(RetryPolicy::default());
//! builder
//!     .register(
//!         "ping",
//!         PayloadSchema::new().field("host", FieldSpec::string()),
//!         executor_fn(|payload, _ctx| async move { Ok(payload) }),
//!     )
//!     .unwrap();
//!
//! let registry = builder.build();
//! assert!(registry.resolve("ping").is_ok());
//! assert!(registry.resolve("pong").is_err());
//! ```

use crate::config::RetryPolicy;
use crate::error::{JobError, JobResult};
use crate::schema::PayloadSchema;
use crate::task::{ExecutionContext, TaskExecutor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A named unit of work: payload schema plus executor.
#[derive(Clone)]
pub struct TaskDefinition {
    id: String,
    schema: PayloadSchema,
    executor: Arc<dyn TaskExecutor>,
    retry_policy: Option<RetryPolicy>,
    exclusive: bool,
    description: Option<String>,
}

impl TaskDefinition {
    /// Create a definition with the process-wide retry policy.
    pub fn new<E>(id: impl Into<String>, schema: PayloadSchema, executor: E) -> Self
    where
        E: TaskExecutor + 'static,
    {
        Self::from_arc(id, schema, Arc::new(executor))
    }

    /// Create a definition from a shared executor.
    pub fn from_arc(
        id: impl Into<String>,
        schema: PayloadSchema,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            schema,
            executor,
            retry_policy: None,
            exclusive: false,
            description: None,
        }
    }

    /// Override the retry policy for this task.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Allow at most one queued invocation of this task to run at a time.
    ///
    /// Trigger calls are always exclusive per task id; this flag extends the
    /// guarantee to invocations drained from the queue.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Attach a human-readable description.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Task identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Payload schema
    pub fn schema(&self) -> &PayloadSchema {
        &self.schema
    }

    /// Executor
    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    /// Task-specific retry policy, if any
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    /// Whether queued invocations are mutually exclusive
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Description
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Validate a payload against this task's schema.
    pub fn validate(&self, payload: &serde_json::Value) -> JobResult<()> {
        self.schema.validate(&self.id, payload)
    }
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("retry_policy", &self.retry_policy)
            .field("exclusive", &self.exclusive)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Collects task definitions before the registry is frozen.
pub struct RegistryBuilder {
    definitions: HashMap<String, TaskDefinition>,
    default_policy: RetryPolicy,
}

impl RegistryBuilder {
    /// Create an empty builder with the process-wide default retry policy.
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            definitions: HashMap::new(),
            default_policy,
        }
    }

    /// Register an executor under `id`.
    pub fn register<E>(
        &mut self,
        id: impl Into<String>,
        schema: PayloadSchema,
        executor: E,
    ) -> JobResult<&mut Self>
    where
        E: TaskExecutor + 'static,
    {
        self.register_definition(TaskDefinition::new(id, schema, executor))
    }

    /// Register a fully configured definition.
    pub fn register_definition(&mut self, definition: TaskDefinition) -> JobResult<&mut Self> {
        if definition.id.trim().is_empty() {
            return Err(JobError::config("Task id must not be empty"));
        }
        if self.definitions.contains_key(&definition.id) {
            return Err(JobError::DuplicateTaskId {
                task_id: definition.id,
            });
        }
        if let Some(policy) = &definition.retry_policy {
            policy.validate()?;
        }

        tracing::info!("Registering task: {}", definition.id);
        self.definitions.insert(definition.id.clone(), definition);
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> TaskRegistry {
        tracing::debug!("Task registry built with {} tasks", self.definitions.len());
        TaskRegistry {
            definitions: self.definitions,
            default_policy: self.default_policy,
        }
    }
}

/// Immutable registry of task definitions.
#[derive(Debug)]
pub struct TaskRegistry {
    definitions: HashMap<String, TaskDefinition>,
    default_policy: RetryPolicy,
}

impl TaskRegistry {
    /// Look up a task by id.
    pub fn resolve(&self, task_id: &str) -> JobResult<&TaskDefinition> {
        self.definitions
            .get(task_id)
            .ok_or_else(|| JobError::UnknownTaskId {
                task_id: task_id.to_string(),
            })
    }

    /// Check if a task id is registered.
    pub fn is_registered(&self, task_id: &str) -> bool {
        self.definitions.contains_key(task_id)
    }

    /// All registered task ids, sorted.
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.definitions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Whether no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Retry policy that applies to `definition`.
    pub fn policy_for<'a>(&'a self, definition: &'a TaskDefinition) -> &'a RetryPolicy {
        definition.retry_policy.as_ref().unwrap_or(&self.default_policy)
    }

    /// Process-wide default retry policy.
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }
}

type ExecutorFuture = std::pin::Pin<Box<dyn Future<Output = JobResult<Arc<dyn TaskExecutor>>> + Send>>;

/// Executor constructed on first use and cached for the process lifetime.
///
/// Suits executors that are expensive to build (model clients, bot runtimes)
/// and should not be constructed per call. If construction fails the error
/// is returned as a transient failure and the next call tries again.
pub struct LazyExecutor {
    name: String,
    init: Box<dyn Fn() -> ExecutorFuture + Send + Sync>,
    cell: OnceCell<Arc<dyn TaskExecutor>>,
}

impl LazyExecutor {
    /// Wrap an async factory.
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<Arc<dyn TaskExecutor>>> + Send + 'static,
    {
        Self {
            name: name.into(),
            init: Box::new(move || Box::pin(factory())),
            cell: OnceCell::new(),
        }
    }

    /// Whether the inner executor has been constructed.
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    async fn get(&self) -> JobResult<&Arc<dyn TaskExecutor>> {
        self.cell
            .get_or_try_init(|| async {
                tracing::info!("Initializing executor: {}", self.name);
                (self.init)().await
            })
            .await
            .map_err(|e| match e {
                JobError::Transient { .. } | JobError::Fatal { .. } => e,
                other => JobError::transient(format!(
                    "Executor '{}' failed to initialize: {}",
                    self.name, other
                )),
            })
    }
}

#[async_trait]
impl TaskExecutor for LazyExecutor {
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: ExecutionContext,
    ) -> JobResult<serde_json::Value> {
        let executor = self.get().await?;
        executor.execute(payload, ctx).await
    }
}
