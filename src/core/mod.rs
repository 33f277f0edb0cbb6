//! The main jobsmith service.
//!
//! [`Jobsmith`] wires the registry, the task runner, the trigger dispatcher,
//! the invocation queue and the background engine together. It is the
//! primary interface for embedding applications and for the HTTP layer.

use crate::config::JobsmithConfig;
use crate::error::{JobError, JobResult};
use crate::queue::{QueueFactory, QueueStats, TaskQueue};
use crate::task::{Invocation, InvocationId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod inflight;
pub mod registry;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use dispatcher::{
    DispatchOptions, ExecutionMode, TriggerConfig, TriggerDispatcher, TriggerReport, TriggerState,
};
pub use engine::{EngineShutdown, HealthStatus, JobEngine};
pub use executor::{InvocationReport, TaskRunner, TaskStats};
pub use inflight::InFlightSet;
pub use registry::{LazyExecutor, RegistryBuilder, TaskDefinition, TaskRegistry};
pub use reporter::Envelope;
pub use scheduler::{Cadence, CronScheduler};
pub use worker::{WorkerContext, WorkerPool, WorkerStats};

/// Snapshot of everything jobsmith counts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsmithStats {
    /// Per-task execution statistics
    pub tasks: HashMap<String, TaskStats>,
    /// Queue state
    pub queue: QueueStats,
    /// Worker pool statistics, when running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerStats>,
    /// Task ids with an invocation in flight
    pub in_flight: Vec<String>,
}

/// The jobsmith service.
///
/// # Examples
///
/// ```rust
/// use jobsmith::prelude::*;
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let mut builder = RegistryBuilder::new(RetryPolicy::default());
/// builder.register(
///     "ping",
///     PayloadSchema::new(),
///     executor_fn(|_payload, _ctx| async move { Ok(json!({"success": true})) }),
/// )?;
///
/// let jobsmith = Jobsmith::new(JobsmithConfig::testing(), builder.build())?;
/// let invocation_id = jobsmith.enqueue("ping", json!({})).await?;
/// assert!(jobsmith.invocation(&invocation_id).await?.is_some());
/// # Ok::<(), JobError>(())
/// # }).unwrap();
/// ```
pub struct Jobsmith {
    config: JobsmithConfig,
    runner: Arc<TaskRunner>,
    dispatcher: Arc<TriggerDispatcher>,
    queue: TaskQueue,
    inflight: InFlightSet,
    engine: Mutex<JobEngine>,
    shutdown: CancellationToken,
}

impl Jobsmith {
    /// Create a service with an in-memory queue.
    pub fn new(config: JobsmithConfig, registry: TaskRegistry) -> JobResult<Self> {
        let queue = QueueFactory::in_memory(config.queue.clone());
        Self::with_queue(config, registry, queue)
    }

    /// Create a service with a custom queue backend.
    pub fn with_queue(
        config: JobsmithConfig,
        registry: TaskRegistry,
        queue: TaskQueue,
    ) -> JobResult<Self> {
        config
            .validate()
            .map_err(|errors| JobError::config(errors.join("; ")))?;

        let runner = Arc::new(TaskRunner::new(Arc::new(registry)));
        let inflight = InFlightSet::new();
        let shutdown = CancellationToken::new();

        let dispatcher = Arc::new(
            TriggerDispatcher::new(
                Arc::clone(&runner),
                config.triggers.clone(),
                config.cron_secret.clone(),
            )?
            .with_default_deadline(config.server.default_deadline_ms.map(Duration::from_millis))
            .with_inflight(inflight.clone())
            .with_cancellation(shutdown.child_token()),
        );

        let worker_ctx = WorkerContext {
            queue: Arc::clone(&queue),
            runner: Arc::clone(&runner),
            inflight: inflight.clone(),
            config: config.workers.clone(),
        };
        let engine = JobEngine::new(
            config.clone(),
            Arc::clone(&queue),
            worker_ctx,
            Arc::clone(&dispatcher),
        );

        if config.cron_secret.is_none() {
            tracing::warn!("CRON_SECRET is not set, every trigger call will be refused");
        }

        Ok(Self {
            config,
            runner,
            dispatcher,
            queue,
            inflight,
            engine: Mutex::new(engine),
            shutdown,
        })
    }

    /// Start workers and scheduled triggers.
    pub async fn start(&self) -> JobResult<()> {
        let mut engine = self.engine.lock().await;
        engine.start().await?;
        tracing::info!(
            tasks = ?self.runner.registry().task_ids(),
            "Jobsmith started"
        );
        Ok(())
    }

    /// Stop workers and scheduled triggers.
    ///
    /// Trigger calls still executing are cancelled. The service cannot be
    /// started again afterwards.
    pub async fn stop(&self) -> JobResult<()> {
        let stopping = {
            let mut engine = self.engine.lock().await;
            self.shutdown.cancel();
            engine.begin_shutdown()?
        };
        // Stats and health checks keep answering while workers wind down.
        stopping.finish().await;
        tracing::info!("Jobsmith stopped");
        Ok(())
    }

    /// Whether the background engine is running.
    pub async fn is_running(&self) -> bool {
        self.engine.lock().await.is_running()
    }

    /// Validate `payload` and queue an invocation of `task_id`.
    ///
    /// Unknown tasks and invalid payloads are rejected here, before anything
    /// is queued.
    pub async fn enqueue(
        &self,
        task_id: &str,
        payload: serde_json::Value,
    ) -> JobResult<InvocationId> {
        let definition = self.runner.registry().resolve(task_id)?;
        definition.validate(&payload)?;

        let invocation_id = self.queue.enqueue(Invocation::new(task_id, payload)).await?;
        tracing::debug!(task_id, invocation_id = %invocation_id, "Invocation enqueued");
        Ok(invocation_id)
    }

    /// Look up a queued invocation.
    pub async fn invocation(&self, id: &str) -> JobResult<Option<Invocation>> {
        self.queue.get(id).await
    }

    /// Execution statistics.
    pub async fn stats(&self) -> JobResult<JobsmithStats> {
        let workers = self.engine.lock().await.worker_stats().await;
        Ok(JobsmithStats {
            tasks: self.runner.all_stats().await,
            queue: self.queue.stats().await?,
            workers,
            in_flight: self.inflight.active(),
        })
    }

    /// Check the queue and, when running, the worker pool.
    pub async fn health_check(&self) -> JobResult<()> {
        self.queue.health_check().await?;

        let engine = self.engine.lock().await;
        if engine.is_running() {
            engine.health_check().await?;
        }
        Ok(())
    }

    /// The trigger dispatcher.
    pub fn dispatcher(&self) -> &Arc<TriggerDispatcher> {
        &self.dispatcher
    }

    /// The task registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        self.runner.registry()
    }

    /// The task runner.
    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// The invocation queue.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Get the configuration used by this service.
    pub fn config(&self) -> &JobsmithConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::schema::{FieldSpec, PayloadSchema};
    use crate::task::{InvocationStatus, executor_fn};
    use serde_json::json;
    use tokio::sync::Notify;

    fn registry() -> TaskRegistry {
        let mut builder = RegistryBuilder::new(RetryPolicy::none());
        builder
            .register(
                "send-notification",
                PayloadSchema::new().field("userId", FieldSpec::string()),
                executor_fn(|payload, _ctx| async move {
                    Ok(json!({"success": true, "userId": payload["userId"]}))
                }),
            )
            .unwrap();
        builder.build()
    }

    #[tokio::test]
    async fn test_enqueue_validates_up_front() {
        let jobsmith = Jobsmith::new(JobsmithConfig::testing(), registry()).unwrap();

        assert!(matches!(
            jobsmith.enqueue("unknown", json!({})).await,
            Err(JobError::UnknownTaskId { .. })
        ));
        assert!(matches!(
            jobsmith.enqueue("send-notification", json!({})).await,
            Err(JobError::Validation { .. })
        ));
        assert_eq!(jobsmith.stats().await.unwrap().queue.pending, 0);

        let id = jobsmith
            .enqueue("send-notification", json!({"userId": "u1"}))
            .await
            .unwrap();
        let invocation = jobsmith.invocation(&id).await.unwrap().unwrap();
        assert_eq!(invocation.status, InvocationStatus::Pending);
        assert_eq!(invocation.attempt, 1);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = JobsmithConfig::testing();
        config.workers.num_workers = 0;
        assert!(matches!(
            Jobsmith::new(config, registry()),
            Err(JobError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_processes_queue() {
        let jobsmith = Jobsmith::new(JobsmithConfig::testing(), registry()).unwrap();
        assert!(!jobsmith.is_running().await);

        jobsmith.start().await.unwrap();
        assert!(jobsmith.is_running().await);
        assert!(matches!(jobsmith.start().await, Err(JobError::AlreadyRunning)));

        let id = jobsmith
            .enqueue("send-notification", json!({"userId": "u7"}))
            .await
            .unwrap();

        let mut done = None;
        for _ in 0..200 {
            let invocation = jobsmith.invocation(&id).await.unwrap().unwrap();
            if invocation.status == InvocationStatus::Completed {
                done = Some(invocation);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let done = done.expect("invocation completed");
        assert_eq!(done.result.unwrap()["userId"], "u7");
        assert!(jobsmith.health_check().await.is_ok());

        let stats = jobsmith.stats().await.unwrap();
        assert_eq!(stats.queue.completed, 1);
        assert_eq!(stats.tasks["send-notification"].successful, 1);

        jobsmith.stop().await.unwrap();
        assert!(!jobsmith.is_running().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stats_answer_while_stopping() {
        let started = Arc::new(Notify::new());
        let signal = Arc::clone(&started);
        let mut builder = RegistryBuilder::new(RetryPolicy::none());
        builder
            .register(
                "export-bookings",
                PayloadSchema::new(),
                executor_fn(move |_payload, _ctx| {
                    let signal = Arc::clone(&signal);
                    async move {
                        signal.notify_one();
                        // Blocks the thread, so cancellation cannot cut it short.
                        std::thread::sleep(Duration::from_millis(800));
                        Ok(json!({"success": true}))
                    }
                }),
            )
            .unwrap();

        let jobsmith = Arc::new(Jobsmith::new(JobsmithConfig::testing(), builder.build()).unwrap());
        jobsmith.start().await.unwrap();
        jobsmith.enqueue("export-bookings", json!({})).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), started.notified())
            .await
            .unwrap();

        let stopping = tokio::spawn({
            let jobsmith = Arc::clone(&jobsmith);
            async move { jobsmith.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = tokio::time::timeout(Duration::from_millis(300), jobsmith.stats())
            .await
            .expect("stats answered during stop")
            .unwrap();
        assert!(stats.workers.is_none());
        assert!(!stopping.is_finished());
        assert!(
            tokio::time::timeout(Duration::from_millis(300), jobsmith.health_check())
                .await
                .is_ok()
        );

        stopping.await.unwrap().unwrap();
    }
}
