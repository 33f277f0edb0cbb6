//! The jobsmith engine - runs the worker pool, the cron scheduler and the
//! health monitor.
//!
//! The engine owns the background parts of the system. Trigger calls over
//! HTTP do not need it; they run on the caller's task through the
//! dispatcher.

use crate::config::JobsmithConfig;
use crate::core::dispatcher::TriggerDispatcher;
use crate::core::scheduler::{CronScheduler, join_tickers};
use crate::core::worker::{WorkerContext, WorkerPool, WorkerStats};
use crate::error::{JobError, JobResult};
use crate::queue::TaskQueue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Health of the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Every worker is alive
    Healthy,
    /// Some workers are gone
    Degraded,
    /// No worker is alive
    Critical,
}

impl HealthStatus {
    fn from_workers(active: usize, expected: usize) -> Self {
        if active >= expected {
            Self::Healthy
        } else if active > 0 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }
}

/// Parts of a stopping engine that are still winding down.
pub struct EngineShutdown {
    pool: Arc<WorkerPool>,
    tickers: Vec<JoinHandle<()>>,
    monitor: Option<(CancellationToken, JoinHandle<()>)>,
    timeout: Duration,
}

impl EngineShutdown {
    /// Wait for scheduled triggers, workers and the monitor to end.
    pub async fn finish(self) {
        join_tickers(self.tickers).await;

        let summary = self.pool.shutdown(self.timeout).await;
        tracing::info!("Worker shutdown result: {}", summary);

        if let Some((cancel, handle)) = self.monitor {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!("Health monitor ended abnormally: {}", e);
            }
        }

        tracing::info!("Jobsmith engine shutdown complete");
    }
}

/// Orchestrates workers, scheduled triggers and monitoring.
pub struct JobEngine {
    config: JobsmithConfig,
    queue: TaskQueue,
    worker_ctx: WorkerContext,
    pool: Option<Arc<WorkerPool>>,
    scheduler: CronScheduler,
    monitor: Option<(CancellationToken, JoinHandle<()>)>,
    start_time: Option<Instant>,
}

impl JobEngine {
    /// Create a stopped engine.
    pub fn new(
        config: JobsmithConfig,
        queue: TaskQueue,
        worker_ctx: WorkerContext,
        dispatcher: Arc<TriggerDispatcher>,
    ) -> Self {
        Self {
            config,
            queue,
            worker_ctx,
            pool: None,
            scheduler: CronScheduler::new(dispatcher),
            monitor: None,
            start_time: None,
        }
    }

    /// Start workers, scheduled triggers and the health monitor.
    pub async fn start(&mut self) -> JobResult<()> {
        if self.is_running() {
            return Err(JobError::AlreadyRunning);
        }

        tracing::info!(
            "Starting jobsmith engine with {} workers and {} scheduled triggers",
            self.config.workers.num_workers,
            self.scheduler.scheduled_count()
        );

        let pool = Arc::new(WorkerPool::new(self.worker_ctx.clone()));
        pool.start().await;
        self.scheduler.start()?;
        self.monitor = Some(self.start_monitor(Arc::clone(&pool)));
        self.pool = Some(pool);
        self.start_time = Some(Instant::now());

        tracing::info!("Jobsmith engine started");
        Ok(())
    }

    /// Stop everything, waiting for workers up to the shutdown timeout.
    pub async fn shutdown(&mut self) -> JobResult<()> {
        self.begin_shutdown()?.finish().await;
        Ok(())
    }

    /// Detach the running parts and signal them to stop.
    ///
    /// The engine reports not running as soon as this returns. Waiting for
    /// the parts to end happens in [`EngineShutdown::finish`], which needs no
    /// access to the engine.
    pub fn begin_shutdown(&mut self) -> JobResult<EngineShutdown> {
        let pool = self.pool.take().ok_or(JobError::NotRunning)?;
        tracing::info!("Shutting down jobsmith engine...");

        let tickers = self.scheduler.stop().unwrap_or_else(|e| {
            tracing::warn!("Scheduler was not running: {}", e);
            Vec::new()
        });
        self.start_time = None;

        Ok(EngineShutdown {
            pool,
            tickers,
            monitor: self.monitor.take(),
            timeout: Duration::from_secs(self.config.workers.shutdown_timeout_secs.unwrap_or(30)),
        })
    }

    fn start_monitor(&self, pool: Arc<WorkerPool>) -> (CancellationToken, JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let queue = Arc::clone(&self.queue);
        let expected_workers = self.config.workers.num_workers;
        let period = Duration::from_secs(self.config.engine.health_check_interval_secs.max(1));
        let auto_cleanup = self.config.engine.enable_auto_cleanup;
        let start_time = Instant::now();

        let handle = tokio::spawn(async move {
            tracing::info!("Health monitor started");

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let active = pool.active_worker_count();
                let worker_stats = pool.stats().await;
                let queue_stats = match queue.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        tracing::error!("Failed to get queue stats: {}", e);
                        continue;
                    }
                };

                let status = HealthStatus::from_workers(active, expected_workers);
                tracing::info!(
                    status = ?status,
                    workers = active,
                    expected_workers,
                    pending = queue_stats.pending,
                    running = queue_stats.running,
                    retrying = queue_stats.retrying,
                    completed = queue_stats.completed,
                    failed = queue_stats.failed,
                    uptime_secs = start_time.elapsed().as_secs(),
                    "Health check"
                );

                if status == HealthStatus::Critical {
                    tracing::error!("All workers are dead");
                }

                if worker_stats.completed > 0 {
                    tracing::debug!(
                        "Worker performance - Completed: {} | Retried: {} | Failed: {} | Avg attempt: {:?}ms",
                        worker_stats.completed,
                        worker_stats.retried,
                        worker_stats.failed,
                        worker_stats.avg_attempt_ms
                    );
                }

                if auto_cleanup {
                    if let Err(e) = queue.cleanup().await {
                        tracing::error!("Queue cleanup failed: {}", e);
                    }
                }
            }

            tracing::info!("Health monitor stopped");
        });

        (cancel, handle)
    }

    /// Get worker statistics, if running.
    pub async fn worker_stats(&self) -> Option<WorkerStats> {
        match &self.pool {
            Some(pool) => Some(pool.stats().await),
            None => None,
        }
    }

    /// Perform a health check
    pub async fn health_check(&self) -> JobResult<HealthStatus> {
        let pool = self.pool.as_ref().ok_or(JobError::NotRunning)?;

        let active = pool.active_worker_count();
        let expected = self.config.workers.num_workers;
        let status = HealthStatus::from_workers(active, expected);

        match status {
            HealthStatus::Critical => Err(JobError::config("No active workers")),
            HealthStatus::Degraded => {
                tracing::warn!("Only {}/{} workers active", active, expected);
                Ok(status)
            }
            HealthStatus::Healthy => Ok(status),
        }
    }

    /// Get engine uptime
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.map(|start| start.elapsed())
    }

    /// Check if engine is running
    pub fn is_running(&self) -> bool {
        self.pool.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::core::executor::TaskRunner;
    use crate::core::inflight::InFlightSet;
    use crate::core::registry::RegistryBuilder;
    use crate::queue::InMemoryQueue;

    fn engine() -> JobEngine {
        let config = JobsmithConfig::testing();
        let runner = Arc::new(TaskRunner::new(Arc::new(
            RegistryBuilder::new(RetryPolicy::none()).build(),
        )));
        let queue: TaskQueue = Arc::new(InMemoryQueue::new());
        let dispatcher = Arc::new(
            TriggerDispatcher::new(Arc::clone(&runner), Vec::new(), config.cron_secret.clone())
                .unwrap(),
        );
        let worker_ctx = WorkerContext {
            queue: Arc::clone(&queue),
            runner,
            inflight: InFlightSet::new(),
            config: config.workers.clone(),
        };
        JobEngine::new(config, queue, worker_ctx, dispatcher)
    }

    #[test]
    fn test_health_status() {
        assert_eq!(HealthStatus::from_workers(4, 4), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_workers(1, 4), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_workers(0, 4), HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let mut engine = engine();
        assert!(!engine.is_running());
        assert!(matches!(engine.health_check().await, Err(JobError::NotRunning)));

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start().await, Err(JobError::AlreadyRunning)));
        assert_eq!(engine.health_check().await.unwrap(), HealthStatus::Healthy);
        assert!(engine.uptime().is_some());
        assert_eq!(engine.worker_stats().await.unwrap().active_workers, 1);

        engine.shutdown().await.unwrap();
        assert!(!engine.is_running());
        assert!(matches!(engine.shutdown().await, Err(JobError::NotRunning)));
        assert!(engine.worker_stats().await.is_none());
    }

    #[tokio::test]
    async fn test_begin_shutdown_detaches_running_parts() {
        let mut engine = engine();
        engine.start().await.unwrap();

        let stopping = engine.begin_shutdown().unwrap();
        assert!(!engine.is_running());
        assert!(engine.uptime().is_none());
        assert!(matches!(engine.begin_shutdown(), Err(JobError::NotRunning)));

        stopping.finish().await;
        engine.start().await.unwrap();
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_restarts_after_shutdown() {
        let mut engine = engine();
        engine.start().await.unwrap();
        engine.shutdown().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());
        engine.shutdown().await.unwrap();
    }
}
