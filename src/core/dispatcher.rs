//! Scheduled trigger dispatch.
//!
//! A trigger is a named rule that runs one or more registered tasks. Every
//! call goes through the same state machine:
//!
//! ```text
//! Received -> Authenticated -> Executing -> Completed | Failed
//! ```
//!
//! Authentication happens before anything else is looked at, so a rejected
//! call never executes a task. Before executing, the dispatcher claims every
//! task id of the trigger in the shared [`InFlightSet`]; a call that finds
//! one of them busy is skipped with [`JobError::AlreadyExecuting`].

use crate::auth;
use crate::core::executor::{InvocationReport, TaskRunner};
use crate::core::inflight::InFlightSet;
use crate::core::scheduler::Cadence;
use crate::error::{JobError, JobResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How the targets of a trigger are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One after another, in declared order
    #[default]
    Sequential,
    /// All at once
    Concurrent,
}

/// A task a trigger runs, with the payload it runs it with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerTarget {
    /// Registered task id
    pub task_id: String,
    /// Payload handed to the task
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A named, optionally recurring rule that runs one or more tasks.
///
/// ```rust
/// use jobsmith::core::dispatcher::{ExecutionMode, TriggerConfig};
/// use serde_json::json;
///
/// let trigger = TriggerConfig::new("nightly")
///     .every("1d".parse().unwrap())
///     .target("generate-report", json!({"companyId": "c1", "period": "daily"}))
///     .target("send-notification", json!({"userId": "u1", "type": "email", "subject": "Report", "body": "Ready"}))
///     .mode(ExecutionMode::Concurrent);
/// assert_eq!(trigger.task_ids(), vec!["generate-report", "send-notification"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Trigger name, used in the trigger URL
    pub name: String,
    /// Interval between scheduled runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence: Option<Cadence>,
    /// Tasks to run, in declared order
    pub targets: Vec<TriggerTarget>,
    /// How targets are run
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Deadline for one call, unless the caller provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

impl TriggerConfig {
    /// A trigger with no targets that only runs when called.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cadence: None,
            targets: Vec::new(),
            mode: ExecutionMode::Sequential,
            deadline_ms: None,
        }
    }

    /// A trigger named after the single task it runs.
    pub fn for_task(task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        let task_id = task_id.into();
        Self::new(task_id.clone()).target(task_id, payload)
    }

    /// Append a target.
    pub fn target(mut self, task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        self.targets.push(TriggerTarget {
            task_id: task_id.into(),
            payload,
        });
        self
    }

    /// Run on a schedule.
    pub fn every(mut self, cadence: Cadence) -> Self {
        self.cadence = Some(cadence);
        self
    }

    /// Set the execution mode.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the default deadline.
    pub fn deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

    /// Target task ids in declared order.
    pub fn task_ids(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.task_id.as_str()).collect()
    }

    fn validate(&self) -> JobResult<()> {
        if self.name.trim().is_empty() {
            return Err(JobError::config("Trigger name must not be empty"));
        }
        if self.targets.is_empty() {
            return Err(JobError::config(format!(
                "Trigger '{}' has no targets",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.task_id.as_str()) {
                return Err(JobError::config(format!(
                    "Trigger '{}' names task '{}' more than once",
                    self.name, target.task_id
                )));
            }
        }
        if self.deadline_ms == Some(0) {
            return Err(JobError::config(format!(
                "Trigger '{}' has a zero deadline",
                self.name
            )));
        }
        Ok(())
    }
}

/// Where a trigger call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    /// Call arrived, not yet authenticated
    Received,
    /// Credential accepted
    Authenticated,
    /// Targets are running
    Executing,
    /// Every target succeeded
    Completed,
    /// At least one target failed
    Failed,
}

/// Per-call options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Overrides the trigger's deadline
    pub deadline: Option<Duration>,
    /// Replaces target payloads.
    ///
    /// For a single-target trigger the value is the payload itself. For a
    /// multi-target trigger it must be an object keyed by task id.
    pub payload: Option<serde_json::Value>,
}

/// Outcome of one target within a trigger call.
#[derive(Debug)]
pub struct TargetReport {
    /// Task id of the target
    pub task_id: String,
    /// What happened to its invocation
    pub report: InvocationReport,
}

/// Outcome of one trigger call.
#[derive(Debug)]
pub struct TriggerReport {
    /// Trigger name
    pub trigger: String,
    /// Final state, `Completed` or `Failed`
    pub state: TriggerState,
    /// Mode the targets ran in
    pub mode: ExecutionMode,
    /// One entry per target, in declared order
    pub targets: Vec<TargetReport>,
    /// When execution started
    pub started_at: DateTime<Utc>,
    /// When execution ended
    pub finished_at: DateTime<Utc>,
}

impl TriggerReport {
    /// Whether every target succeeded.
    pub fn is_success(&self) -> bool {
        self.state == TriggerState::Completed
    }

    /// The first failure, in declared order.
    pub fn first_error(&self) -> Option<(&str, &JobError)> {
        self.targets.iter().find_map(|t| match &t.report.outcome {
            Err(e) => Some((t.task_id.as_str(), e)),
            Ok(_) => None,
        })
    }
}

/// Authenticates trigger calls and runs their targets.
pub struct TriggerDispatcher {
    runner: Arc<TaskRunner>,
    triggers: HashMap<String, TriggerConfig>,
    secret: Option<String>,
    default_deadline: Option<Duration>,
    inflight: InFlightSet,
    cancel: CancellationToken,
}

impl TriggerDispatcher {
    /// Build a dispatcher over a set of triggers.
    ///
    /// Fails with a configuration error on duplicate trigger names, empty
    /// triggers or a trigger naming the same task twice. Targets are not
    /// resolved here; an unknown task id fails only its own target.
    pub fn new(
        runner: Arc<TaskRunner>,
        triggers: Vec<TriggerConfig>,
        secret: Option<String>,
    ) -> JobResult<Self> {
        let mut by_name = HashMap::with_capacity(triggers.len());
        for trigger in triggers {
            trigger.validate()?;
            for task_id in trigger.task_ids() {
                if !runner.registry().is_registered(task_id) {
                    tracing::warn!(
                        trigger = %trigger.name,
                        task_id,
                        "Trigger targets an unregistered task"
                    );
                }
            }
            if by_name.contains_key(&trigger.name) {
                return Err(JobError::config(format!(
                    "Trigger '{}' is defined more than once",
                    trigger.name
                )));
            }
            by_name.insert(trigger.name.clone(), trigger);
        }

        Ok(Self {
            runner,
            triggers: by_name,
            secret,
            default_deadline: None,
            inflight: InFlightSet::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Deadline applied when neither the caller nor the trigger sets one.
    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    /// Share the in-flight set with other execution paths.
    pub fn with_inflight(mut self, inflight: InFlightSet) -> Self {
        self.inflight = inflight;
        self
    }

    /// Cancel running calls when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Look up a trigger.
    pub fn trigger(&self, name: &str) -> Option<&TriggerConfig> {
        self.triggers.get(name)
    }

    /// All triggers, sorted by name.
    pub fn triggers(&self) -> Vec<&TriggerConfig> {
        let mut triggers: Vec<&TriggerConfig> = self.triggers.values().collect();
        triggers.sort_by(|a, b| a.name.cmp(&b.name));
        triggers
    }

    /// Task ids with an invocation in flight.
    pub fn inflight(&self) -> &InFlightSet {
        &self.inflight
    }

    /// The runner targets execute on.
    pub fn runner(&self) -> &Arc<TaskRunner> {
        &self.runner
    }

    /// Authenticate `authorization`, then run the trigger `name`.
    ///
    /// Errors returned here mean no target was executed. Target failures are
    /// reported inside the [`TriggerReport`].
    pub async fn dispatch(
        &self,
        name: &str,
        authorization: Option<&str>,
        options: DispatchOptions,
    ) -> JobResult<TriggerReport> {
        tracing::debug!(trigger = name, state = ?TriggerState::Received, "Trigger call received");

        if let Err(e) = auth::authenticate(self.secret.as_deref(), authorization) {
            tracing::warn!(trigger = name, error_kind = e.kind(), "Trigger call rejected: {}", e);
            return Err(e);
        }

        let trigger = self.triggers.get(name).ok_or_else(|| JobError::UnknownTrigger {
            name: name.to_string(),
        })?;
        tracing::debug!(trigger = name, state = ?TriggerState::Authenticated, "Trigger call authenticated");

        let targets = resolve_payloads(trigger, options.payload)?;

        let task_ids = trigger.task_ids();
        let Some(_guard) = self.inflight.try_acquire(&task_ids) else {
            let busy = task_ids
                .iter()
                .find(|id| self.inflight.is_active(id))
                .copied()
                .unwrap_or(name);
            tracing::warn!(
                trigger = name,
                task_id = busy,
                "Skipping trigger call, task is already executing"
            );
            return Err(JobError::AlreadyExecuting {
                task_id: busy.to_string(),
            });
        };

        let deadline = options
            .deadline
            .or(trigger.deadline_ms.map(Duration::from_millis))
            .or(self.default_deadline);
        let deadline_at = deadline.map(|d| Instant::now() + d);

        tracing::info!(
            trigger = name,
            state = ?TriggerState::Executing,
            mode = ?trigger.mode,
            targets = targets.len(),
            deadline_ms = deadline.map(|d| d.as_millis() as u64),
            "Executing trigger"
        );

        let started_at = Utc::now();
        let cancel = self.cancel.child_token();
        let reports = match trigger.mode {
            ExecutionMode::Sequential => {
                let mut reports = Vec::with_capacity(targets.len());
                for (task_id, payload) in targets {
                    let report = self
                        .runner
                        .execute_by_id(&task_id, payload, remaining(deadline_at), cancel.clone())
                        .await;
                    reports.push(TargetReport { task_id, report });
                }
                reports
            }
            ExecutionMode::Concurrent => {
                let runs = targets.into_iter().map(|(task_id, payload)| {
                    let cancel = cancel.clone();
                    async move {
                        let report = self
                            .runner
                            .execute_by_id(&task_id, payload, remaining(deadline_at), cancel)
                            .await;
                        TargetReport { task_id, report }
                    }
                });
                // join_all yields in input order, not completion order.
                futures::future::join_all(runs).await
            }
        };

        let state = if reports.iter().all(|t| t.report.is_success()) {
            TriggerState::Completed
        } else {
            TriggerState::Failed
        };

        Ok(TriggerReport {
            trigger: name.to_string(),
            state,
            mode: trigger.mode,
            targets: reports,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run a trigger on behalf of the scheduler.
    ///
    /// Goes through the same authenticated path as external calls, presenting
    /// the configured secret.
    pub async fn run_scheduled(&self, name: &str) -> JobResult<TriggerReport> {
        let authorization = self.secret.as_ref().map(|s| format!("Bearer {s}"));
        self.dispatch(name, authorization.as_deref(), DispatchOptions::default())
            .await
    }
}

fn remaining(deadline_at: Option<Instant>) -> Option<Duration> {
    deadline_at.map(|at| at.saturating_duration_since(Instant::now()))
}

fn resolve_payloads(
    trigger: &TriggerConfig,
    payload: Option<serde_json::Value>,
) -> JobResult<Vec<(String, serde_json::Value)>> {
    let defaults = trigger
        .targets
        .iter()
        .map(|t| (t.task_id.clone(), t.payload.clone()));

    let Some(payload) = payload else {
        return Ok(defaults.collect());
    };

    if let [only] = trigger.targets.as_slice() {
        return Ok(vec![(only.task_id.clone(), payload)]);
    }

    let serde_json::Value::Object(mut by_task) = payload else {
        return Err(JobError::invalid_field(
            &trigger.name,
            "$",
            "must be an object keyed by task id",
        ));
    };
    if let Some(unknown) = by_task.keys().find(|k| !trigger.task_ids().contains(&k.as_str())) {
        return Err(JobError::invalid_field(
            &trigger.name,
            unknown.clone(),
            "is not a target of this trigger",
        ));
    }
    Ok(defaults
        .map(|(task_id, default)| {
            let payload = by_task.remove(&task_id).unwrap_or(default);
            (task_id, payload)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::core::registry::RegistryBuilder;
    use crate::schema::{FieldSpec, PayloadSchema};
    use crate::task::executor_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    const AUTH: Option<&str> = Some("Bearer secret123");

    fn runner(calls: Arc<AtomicU32>) -> Arc<TaskRunner> {
        let mut builder = RegistryBuilder::new(RetryPolicy::fixed(2, 10));
        let counter = Arc::clone(&calls);
        builder
            .register(
                "send-notification",
                PayloadSchema::new().field("userId", FieldSpec::string()),
                executor_fn(move |payload, _ctx| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"success": true, "userId": payload["userId"]}))
                    }
                }),
            )
            .unwrap()
            .register(
                "slow",
                PayloadSchema::new(),
                executor_fn(|payload, _ctx| async move {
                    let ms = payload["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!({"sleptMs": ms}))
                }),
            )
            .unwrap()
            .register(
                "broken",
                PayloadSchema::new(),
                executor_fn(|_payload, _ctx| async move { Err(JobError::fatal("no data")) }),
            )
            .unwrap();
        Arc::new(TaskRunner::new(Arc::new(builder.build())))
    }

    fn dispatcher(triggers: Vec<TriggerConfig>, secret: Option<&str>) -> (TriggerDispatcher, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let dispatcher =
            TriggerDispatcher::new(runner(Arc::clone(&calls)), triggers, secret.map(String::from))
                .unwrap();
        (dispatcher, calls)
    }

    fn notify() -> TriggerConfig {
        TriggerConfig::for_task("send-notification", json!({"userId": "u1"}))
    }

    #[tokio::test]
    async fn test_authenticated_call_executes() {
        let (dispatcher, calls) = dispatcher(vec![notify()], Some("secret123"));

        let report = assert_ok!(
            dispatcher
                .dispatch("send-notification", AUTH, DispatchOptions::default())
                .await
        );
        assert!(report.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.inflight().active().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_calls_execute_nothing() {
        let (dispatcher, calls) = dispatcher(vec![notify()], Some("secret123"));
        for header in [None, Some("Bearer wrong")] {
            let err = assert_err!(
                dispatcher
                    .dispatch("send-notification", header, DispatchOptions::default())
                    .await
            );
            assert!(matches!(err, JobError::Unauthorized));
        }

        let (unconfigured, unconfigured_calls) = dispatcher_without_secret();
        let err = assert_err!(
            unconfigured
                .dispatch("send-notification", AUTH, DispatchOptions::default())
                .await
        );
        assert!(matches!(err, JobError::Configuration { .. }));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(unconfigured_calls.load(Ordering::SeqCst), 0);
    }

    fn dispatcher_without_secret() -> (TriggerDispatcher, Arc<AtomicU32>) {
        dispatcher(vec![notify()], None)
    }

    #[tokio::test]
    async fn test_unknown_trigger_is_checked_after_auth() {
        let (dispatcher, _) = dispatcher(vec![notify()], Some("secret123"));
        assert!(matches!(
            dispatcher
                .dispatch("nope", Some("Bearer wrong"), DispatchOptions::default())
                .await,
            Err(JobError::Unauthorized)
        ));
        assert!(matches!(
            dispatcher.dispatch("nope", AUTH, DispatchOptions::default()).await,
            Err(JobError::UnknownTrigger { .. })
        ));
    }

    #[tokio::test]
    async fn test_payload_override_for_single_target() {
        let (dispatcher, _) = dispatcher(vec![notify()], Some("secret123"));
        let report = dispatcher
            .dispatch(
                "send-notification",
                AUTH,
                DispatchOptions {
                    payload: Some(json!({"userId": "u42"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            report.targets[0].report.outcome.as_ref().unwrap()["userId"],
            "u42"
        );
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_sibling_results() {
        let trigger = TriggerConfig::new("batch")
            .target("send-notification", json!({"userId": "u1"}))
            .target("broken", json!({}))
            .target("ghost", json!({}));
        let (dispatcher, calls) = dispatcher(vec![trigger], Some("secret123"));

        let report = dispatcher
            .dispatch("batch", AUTH, DispatchOptions::default())
            .await
            .unwrap();

        assert_eq!(report.state, TriggerState::Failed);
        assert!(report.targets[0].report.is_success());
        assert!(matches!(
            report.targets[2].report.outcome,
            Err(JobError::UnknownTaskId { .. })
        ));
        assert_eq!(report.first_error().unwrap().0, "broken");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_results_follow_declared_order() {
        let trigger = TriggerConfig::new("fan-out")
            .target("slow", json!({"ms": 300}))
            .target("send-notification", json!({"userId": "u1"}))
            .mode(ExecutionMode::Concurrent);
        let (dispatcher, _) = dispatcher(vec![trigger], Some("secret123"));

        let report = dispatcher
            .dispatch("fan-out", AUTH, DispatchOptions::default())
            .await
            .unwrap();

        let order: Vec<&str> = report.targets.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(order, vec!["slow", "send-notification"]);
        assert!(report.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_call_is_skipped() {
        let trigger = TriggerConfig::for_task("slow", json!({"ms": 1_000}));
        let (dispatcher, _) = dispatcher(vec![trigger], Some("secret123"));
        let dispatcher = Arc::new(dispatcher);

        let first = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch("slow", AUTH, DispatchOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = dispatcher
            .dispatch("slow", AUTH, DispatchOptions::default())
            .await;
        assert!(matches!(second, Err(JobError::AlreadyExecuting { ref task_id }) if task_id == "slow"));

        assert!(first.await.unwrap().unwrap().is_success());
        assert!(
            dispatcher
                .dispatch("slow", AUTH, DispatchOptions::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fails_with_timeout_and_releases_claim() {
        let trigger = TriggerConfig::for_task("slow", json!({"ms": 60_000})).deadline_ms(100);
        let (dispatcher, _) = dispatcher(vec![trigger], Some("secret123"));

        let report = dispatcher
            .dispatch("slow", AUTH, DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.state, TriggerState::Failed);
        assert!(matches!(
            report.targets[0].report.outcome,
            Err(JobError::Timeout { .. })
        ));
        assert!(!dispatcher.inflight().is_active("slow"));
    }

    #[tokio::test]
    async fn test_run_scheduled_uses_configured_secret() {
        let (dispatcher, calls) = dispatcher(vec![notify()], Some("secret123"));
        assert!(dispatcher.run_scheduled("send-notification").await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (unconfigured, _) = dispatcher_without_secret();
        assert!(matches!(
            unconfigured.run_scheduled("send-notification").await,
            Err(JobError::Configuration { .. })
        ));
    }

    #[test]
    fn test_invalid_trigger_definitions() {
        let calls = Arc::new(AtomicU32::new(0));
        let twice = TriggerConfig::new("twice")
            .target("send-notification", json!({}))
            .target("send-notification", json!({}));
        let empty = TriggerConfig::new("empty");

        for triggers in [vec![twice], vec![empty], vec![notify(), notify()]] {
            assert!(matches!(
                TriggerDispatcher::new(runner(Arc::clone(&calls)), triggers, None),
                Err(JobError::Configuration { .. })
            ));
        }
    }

    #[test]
    fn test_trigger_config_from_json() {
        let trigger: TriggerConfig = serde_json::from_value(json!({
            "name": "daily-reports",
            "cadence": "1d",
            "targets": [{"task_id": "generate-report", "payload": {"companyId": "c1", "period": "daily"}}],
            "mode": "concurrent"
        }))
        .unwrap();
        assert_eq!(trigger.cadence.unwrap().period(), Duration::from_secs(86_400));
        assert_eq!(trigger.mode, ExecutionMode::Concurrent);
        assert!(trigger.deadline_ms.is_none());
    }
}
