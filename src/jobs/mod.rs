//! Built-in tasks of the dispatch platform.
//!
//! Executors here depend on collaborator traits rather than concrete
//! services, so deployments plug in their own providers and tests use the
//! in-memory ones.

use crate::config::JobsmithConfig;
use crate::core::registry::{LazyExecutor, RegistryBuilder, TaskDefinition};
use crate::error::{JobError, JobResult};
use crate::task::TaskExecutor;
use std::path::PathBuf;
use std::sync::Arc;

pub mod notification;
pub mod report;

pub use notification::{LogNotificationChannel, NotificationChannel, NotificationKind, SendNotification};
pub use report::{
    ArtifactStore, Booking, DataStore, FsArtifactStore, GenerateReport, MemoryArtifactStore,
    MemoryDataStore, ReportPeriod,
};

/// Collaborators the built-in tasks run against.
#[derive(Clone)]
pub struct JobDeps {
    pub notifications: Arc<dyn NotificationChannel>,
    pub data: Arc<dyn DataStore>,
    /// `None` writes artifacts below `artifact_dir` on first use.
    pub artifacts: Option<Arc<dyn ArtifactStore>>,
    pub artifact_dir: PathBuf,
}

impl JobDeps {
    /// Logging notifications, an empty in-memory data store and filesystem
    /// artifacts in the configured directory.
    pub fn from_config(config: &JobsmithConfig) -> Self {
        Self {
            notifications: Arc::new(LogNotificationChannel),
            data: Arc::new(MemoryDataStore::new()),
            artifacts: None,
            artifact_dir: PathBuf::from(&config.artifact_dir),
        }
    }
}

/// Register `send-notification` and `generate-report`.
pub fn register_builtin_jobs(builder: &mut RegistryBuilder, deps: JobDeps) -> JobResult<()> {
    builder.register_definition(
        TaskDefinition::new(
            notification::TASK_ID,
            notification::schema(),
            SendNotification::new(deps.notifications),
        )
        .describe("Send an email, SMS or push notification to a user"),
    )?;

    let data = deps.data;
    let report_executor: Arc<dyn TaskExecutor> = match deps.artifacts {
        Some(artifacts) => Arc::new(GenerateReport::new(data, artifacts)),
        None => {
            let root = deps.artifact_dir;
            Arc::new(LazyExecutor::new(report::TASK_ID, move || {
                let data = Arc::clone(&data);
                let root = root.clone();
                async move {
                    tokio::fs::create_dir_all(&root).await.map_err(|e| {
                        JobError::transient_from(
                            format!("Cannot create artifact directory {}", root.display()),
                            e,
                        )
                    })?;
                    let executor: Arc<dyn TaskExecutor> =
                        Arc::new(GenerateReport::new(data, Arc::new(FsArtifactStore::new(root))));
                    Ok::<_, JobError>(executor)
                }
            }))
        }
    };

    builder.register_definition(
        TaskDefinition::from_arc(report::TASK_ID, report::schema(), report_executor)
            .exclusive(true)
            .describe("Summarise a company's bookings and store the report"),
    )?;

    Ok(())
}
