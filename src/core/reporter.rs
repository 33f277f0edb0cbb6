//! Execution result reporting.
//!
//! Turns trigger and invocation outcomes into the uniform response envelope
//! and emits one structured log event per report. The envelope is built
//! before anything is logged and logging never touches it.

use crate::core::dispatcher::TriggerReport;
use crate::error::JobResult;
use crate::task::Invocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Uniform result envelope.
///
/// Never carries both `results` and `error`. When some targets of a failed
/// trigger succeeded, their results are kept in `partialResults`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Whether everything succeeded
    pub ok: bool,
    /// When the report was produced
    pub timestamp: DateTime<Utc>,
    /// Trigger or task name
    pub task: String,
    /// Results on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    /// Failure message otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Results of the targets that succeeded in a failed trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_results: Option<Value>,
}

impl Envelope {
    /// Successful envelope.
    pub fn success(task: impl Into<String>, results: Value) -> Self {
        Self {
            ok: true,
            timestamp: Utc::now(),
            task: task.into(),
            results: Some(results),
            error: None,
            partial_results: None,
        }
    }

    /// Failed envelope.
    pub fn failure(task: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            timestamp: Utc::now(),
            task: task.into(),
            results: None,
            error: Some(error.into()),
            partial_results: None,
        }
    }
}

/// Build the envelope for a trigger call and log it.
///
/// A single-target trigger reports the task's own result; a multi-target
/// trigger reports an object keyed by task id, in declared order.
pub fn report(trigger: &TriggerReport) -> Envelope {
    let attempts: u32 = trigger.targets.iter().map(|t| t.report.attempt_count()).sum();
    let tasks: Vec<&str> = trigger.targets.iter().map(|t| t.task_id.as_str()).collect();

    let envelope = if trigger.is_success() {
        let results = match trigger.targets.as_slice() {
            [only] => only.report.outcome.as_ref().cloned().unwrap_or(Value::Null),
            targets => Value::Object(
                targets
                    .iter()
                    .filter_map(|t| {
                        let value = t.report.outcome.as_ref().ok()?;
                        Some((t.task_id.clone(), value.clone()))
                    })
                    .collect(),
            ),
        };
        Envelope::success(&trigger.trigger, results)
    } else {
        let failures: Vec<String> = trigger
            .targets
            .iter()
            .filter_map(|t| match &t.report.outcome {
                Err(e) if trigger.targets.len() == 1 => Some(e.to_string()),
                Err(e) => Some(format!("{}: {}", t.task_id, e)),
                Ok(_) => None,
            })
            .collect();

        let succeeded: Map<String, Value> = trigger
            .targets
            .iter()
            .filter_map(|t| {
                let value = t.report.outcome.as_ref().ok()?;
                Some((t.task_id.clone(), value.clone()))
            })
            .collect();

        let mut envelope = Envelope::failure(&trigger.trigger, failures.join("; "));
        if !succeeded.is_empty() {
            envelope.partial_results = Some(Value::Object(succeeded));
        }
        envelope
    };

    if envelope.ok {
        tracing::info!(
            trigger = %trigger.trigger,
            tasks = ?tasks,
            attempts,
            outcome = "success",
            duration_ms = (trigger.finished_at - trigger.started_at).num_milliseconds(),
            "Trigger completed"
        );
    } else {
        tracing::error!(
            trigger = %trigger.trigger,
            tasks = ?tasks,
            attempts,
            outcome = "failure",
            error = envelope.error.as_deref().unwrap_or_default(),
            "Trigger failed"
        );
    }

    envelope
}

/// Build the envelope for a settled queue invocation and log it.
///
/// `attempts` counts every executor call, including the final one.
pub fn report_invocation(
    invocation: &Invocation,
    attempts: u32,
    outcome: &JobResult<Value>,
    elapsed: Duration,
) -> Envelope {
    let task_id = invocation.task_id.as_str();
    let duration_ms = elapsed.as_millis() as u64;

    match outcome {
        Ok(value) => {
            tracing::info!(
                task_id,
                invocation_id = %invocation.id,
                attempts,
                outcome = "success",
                duration_ms,
                "Invocation completed"
            );
            Envelope::success(task_id, value.clone())
        }
        Err(e) => {
            tracing::error!(
                task_id,
                invocation_id = %invocation.id,
                attempts,
                outcome = "failure",
                error_kind = e.kind(),
                error = %e,
                "Invocation failed"
            );
            Envelope::failure(task_id, e.to_string())
        }
    }
}
