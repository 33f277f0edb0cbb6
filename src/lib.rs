//! # jobsmith
//!
//! Background job layer for a multi-tenant dispatch platform.
//!
//! ## Features
//!
//! - **Authenticated cron triggers**: external schedulers call an HTTP
//!   endpoint with a shared bearer secret; each trigger runs one or more
//!   registered tasks
//! - **Validated payloads**: every task declares a payload schema checked
//!   before its executor runs
//! - **Retries with backoff**: transient failures are retried with
//!   exponential, jittered backoff under a per-task policy
//! - **Overlap protection**: a task that is already executing is skipped
//! - **Work queue**: invocations can be enqueued and are processed by a
//!   worker pool with visibility timeouts and graceful shutdown
//! - **Structured logging**: one `tracing` event per reported outcome
//!
//! ## Quick Start
//!
//! ```rust
//! use jobsmith::prelude::*;
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let mut builder = RegistryBuilder::new(RetryPolicy::exponential(3));
//! builder.register(
//!     "cleanup-sessions",
//!     PayloadSchema::new().field("olderThanDays", FieldSpec::integer().min(1.0)),
//!     executor_fn(|payload, _ctx| async move {
//!         Ok(json!({"success": true, "olderThanDays": payload["olderThanDays"]}))
//!     }),
//! )?;
//!
//! let mut config = JobsmithConfig::testing();
//! config.triggers.push(TriggerConfig::for_task(
//!     "cleanup-sessions",
//!     json!({"olderThanDays": 30}),
//! ));
//!
//! let jobsmith = Jobsmith::new(config, builder.build())?;
//! let report = jobsmith
//!     .dispatcher()
//!     .dispatch("cleanup-sessions", Some("Bearer test-secret"), DispatchOptions::default())
//!     .await?;
//!
//! let envelope = jobsmith::core::reporter::report(&report);
//! assert!(envelope.ok);
//! assert_eq!(envelope.results.unwrap()["olderThanDays"], 30);
//! # Ok::<(), JobError>(())
//! # }).unwrap();
//! ```

pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod jobs;
pub mod queue;
pub mod schema;
pub mod task;
pub mod telemetry;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{
        Cadence, DispatchOptions, Envelope, ExecutionMode, Jobsmith, JobsmithStats,
        RegistryBuilder, TaskDefinition, TaskRegistry, TriggerConfig, TriggerReport,
    };
    pub use crate::error::{JobError, JobResult};
    pub use crate::queue::{QueueBackend, TaskQueue};
    pub use crate::schema::{FieldSpec, FieldType, PayloadSchema};
    pub use crate::task::{
        ExecutionContext, Invocation, InvocationId, InvocationStatus, TaskExecutor, executor_fn,
        parse_payload,
    };
    pub use async_trait::async_trait;
}

pub use crate::config::JobsmithConfig;
pub use crate::core::Jobsmith;
pub use crate::error::{JobError, JobResult};
pub use crate::task::{ExecutionContext, TaskExecutor};
pub use async_trait::async_trait;
