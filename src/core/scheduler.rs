//! Interval-based trigger scheduling.
//!
//! Cadences are fixed intervals written as `<n><unit>` with unit `s`, `m`,
//! `h` or `d`, e.g. `30s`, `15m`, `6h`, `1d`. Each scheduled trigger gets
//! its own ticker task. Ticks missed while the process was busy are skipped,
//! not replayed, and a tick that overlaps a still-running call for the same
//! task is skipped by the dispatcher's in-flight guard.

use crate::core::dispatcher::TriggerDispatcher;
use crate::core::reporter;
use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

/// Interval between scheduled runs of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cadence {
    period: Duration,
}

impl Cadence {
    /// A cadence of `period`. Fails on a zero period.
    pub fn every(period: Duration) -> JobResult<Self> {
        if period.is_zero() {
            return Err(JobError::config("Cadence must be greater than zero"));
        }
        Ok(Self { period })
    }

    /// Time between runs.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl FromStr for Cadence {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || {
            JobError::config(format!(
                "Invalid cadence '{s}', expected <number><s|m|h|d> such as 15m"
            ))
        };

        let split = s.len().checked_sub(1).filter(|i| s.is_char_boundary(*i)).ok_or_else(invalid)?;
        let (amount, unit) = s.split_at(split);
        let amount: u64 = amount.parse().map_err(|_| invalid())?;
        let unit_secs = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            _ => return Err(invalid()),
        };
        let secs = amount.checked_mul(unit_secs).ok_or_else(invalid)?;
        Self::every(Duration::from_secs(secs))
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.period.as_secs();
        match secs {
            s if s % 86_400 == 0 => write!(f, "{}d", s / 86_400),
            s if s % 3_600 == 0 => write!(f, "{}h", s / 3_600),
            s if s % 60 == 0 => write!(f, "{}m", s / 60),
            s => write!(f, "{s}s"),
        }
    }
}

impl TryFrom<String> for Cadence {
    type Error = JobError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cadence> for String {
    fn from(cadence: Cadence) -> Self {
        cadence.to_string()
    }
}

/// Fires scheduled triggers through the dispatcher.
pub struct CronScheduler {
    dispatcher: Arc<TriggerDispatcher>,
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

impl CronScheduler {
    /// Create a stopped scheduler.
    pub fn new(dispatcher: Arc<TriggerDispatcher>) -> Self {
        Self {
            dispatcher,
            cancel: None,
            handles: Vec::new(),
        }
    }

    /// Whether tickers are running.
    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Number of triggers with a cadence.
    pub fn scheduled_count(&self) -> usize {
        self.dispatcher
            .triggers()
            .iter()
            .filter(|t| t.cadence.is_some())
            .count()
    }

    /// Spawn one ticker per scheduled trigger.
    ///
    /// The first run happens one period after start.
    pub fn start(&mut self) -> JobResult<()> {
        if self.is_running() {
            return Err(JobError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        for trigger in self.dispatcher.triggers() {
            let Some(cadence) = trigger.cadence else {
                continue;
            };
            tracing::info!(trigger = %trigger.name, cadence = %cadence, "Scheduling trigger");
            self.handles.push(tokio::spawn(run_ticker(
                Arc::clone(&self.dispatcher),
                trigger.name.clone(),
                cadence,
                cancel.clone(),
            )));
        }

        self.cancel = Some(cancel);
        Ok(())
    }

    /// Cancel all tickers and hand back their handles without waiting.
    pub fn stop(&mut self) -> JobResult<Vec<JoinHandle<()>>> {
        let cancel = self.cancel.take().ok_or(JobError::NotRunning)?;
        cancel.cancel();
        Ok(std::mem::take(&mut self.handles))
    }

    /// Stop all tickers. Calls already dispatched run to completion.
    pub async fn shutdown(&mut self) -> JobResult<()> {
        join_tickers(self.stop()?).await;
        Ok(())
    }
}

/// Wait for cancelled tickers to end.
pub(crate) async fn join_tickers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Scheduler ticker ended abnormally: {}", e);
        }
    }
    tracing::info!("Cron scheduler stopped");
}

async fn run_ticker(
    dispatcher: Arc<TriggerDispatcher>,
    name: String,
    cadence: Cadence,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + cadence.period(), cadence.period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tracing::debug!(trigger = %name, "Scheduled tick");
        let dispatcher = Arc::clone(&dispatcher);
        let name = name.clone();
        // Each run is its own task so a slow run does not delay the next tick.
        tokio::spawn(async move {
            match dispatcher.run_scheduled(&name).await {
                Ok(report) => {
                    reporter::report(&report);
                }
                Err(JobError::AlreadyExecuting { task_id }) => {
                    tracing::info!(
                        trigger = %name,
                        task_id = %task_id,
                        "Scheduled run skipped, previous run still executing"
                    );
                }
                Err(e) => {
                    tracing::error!(trigger = %name, "Scheduled run failed: {}", e);
                }
            }
        });
    }
}
