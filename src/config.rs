//! Configuration types for jobsmith.
//!
//! This module contains all configuration structures used throughout jobsmith,
//! including the HTTP server, worker pool, queue, retry defaults and logging.
//! Configuration is usually built with [`JobsmithConfig::from_env`], which
//! reads a `.env` file when present.

use crate::core::dispatcher::TriggerConfig;
use crate::error::{JobError, JobResult};
use serde::{Deserialize, Serialize};

/// Main configuration for jobsmith.
///
/// # Examples
///
/// ```rust
/// use jobsmith::config::{JobsmithConfig, WorkerConfig};
///
/// let config = JobsmithConfig {
///     cron_secret: Some("secret123".to_string()),
///     workers: WorkerConfig::with_workers(4),
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsmithConfig {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Worker-related configuration
    pub workers: WorkerConfig,

    /// Queue configuration
    pub queue: QueueConfig,

    /// Process-wide default retry policy
    pub retry: RetryPolicy,

    /// Engine-level configuration
    pub engine: EngineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Shared secret trigger callers must present as a bearer token
    #[serde(skip_serializing)]
    pub cron_secret: Option<String>,

    /// Scheduled triggers
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    /// Directory generated artifacts are written to
    pub artifact_dir: String,
}

impl Default for JobsmithConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            workers: WorkerConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
            cron_secret: None,
            triggers: Vec::new(),
            artifact_dir: "./artifacts".to_string(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// Default deadline applied to trigger calls without one (in milliseconds)
    pub default_deadline_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            default_deadline_ms: Some(300_000), // 5 minutes
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers draining the queue
    pub num_workers: usize,

    /// Maximum time a single attempt can run before it is abandoned (in seconds)
    pub task_timeout_secs: Option<u64>,

    /// Time to wait for workers to shutdown gracefully (in seconds)
    pub shutdown_timeout_secs: Option<u64>,

    /// Upper bound of the idle backoff when the queue is empty (in milliseconds)
    pub idle_timeout_ms: u64,

    /// Delay before re-checking an exclusive task that is already active (in milliseconds)
    pub defer_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            task_timeout_secs: Some(300),    // 5 minutes
            shutdown_timeout_secs: Some(30), // 30 seconds
            idle_timeout_ms: 5000,           // 5 seconds
            defer_delay_ms: 1000,
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration with a specific number of workers.
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Set the task timeout.
    pub fn with_task_timeout(mut self, timeout_secs: u64) -> Self {
        self.task_timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout_secs: u64) -> Self {
        self.shutdown_timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout_ms: u64) -> Self {
        self.idle_timeout_ms = timeout_ms;
        self
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Visibility timeout for running invocations - how long before an
    /// unacknowledged invocation becomes visible again (in seconds)
    pub visibility_timeout_secs: u64,

    /// Age after which completed or failed invocations are cleaned up (in seconds)
    pub retention_secs: u64,

    /// Maximum queue size (0 = unlimited)
    pub max_queue_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 600, // 10 minutes
            retention_secs: 3600,         // 1 hour
            max_queue_size: 0,            // unlimited
        }
    }
}

impl QueueConfig {
    /// Set the maximum queue size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }

    /// Set the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout_secs: u64) -> Self {
        self.visibility_timeout_secs = timeout_secs;
        self
    }
}

/// Retry policy configuration.
///
/// Delays grow exponentially from `min_delay_ms` by `factor` per attempt and
/// are capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry (in milliseconds)
    pub min_delay_ms: u64,

    /// Maximum delay between retries (in milliseconds)
    pub max_delay_ms: u64,

    /// Backoff growth factor
    pub factor: f64,

    /// Whether to randomise delays (full jitter)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay_ms: 1000,  // 1 second
            max_delay_ms: 60000, // 1 minute
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a retry policy with exponential backoff.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Create a retry policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            min_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            factor: 1.0,
            jitter: false,
        }
    }

    /// Run once, never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Disable jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Check the policy invariants.
    pub fn validate(&self) -> JobResult<()> {
        if self.max_attempts < 1 {
            return Err(JobError::config("Retry max_attempts must be at least 1"));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(JobError::config(
                "Retry min delay must be less than or equal to max delay",
            ));
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(JobError::config("Retry factor must be a finite value >= 1.0"));
        }
        Ok(())
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Health check interval (in seconds)
    pub health_check_interval_secs: u64,

    /// Enable automatic cleanup of old terminal invocations
    pub enable_auto_cleanup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            enable_auto_cleanup: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(JobError::config(format!("Unknown log level '{other}'"))),
        }
    }
}

impl JobsmithConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: 2,
                task_timeout_secs: Some(60),
                ..Default::default()
            },
            queue: QueueConfig {
                max_queue_size: 1000,
                visibility_timeout_secs: 120,
                retention_secs: 300, // 5 minutes
            },
            engine: EngineConfig {
                health_check_interval_secs: 10,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        Self {
            workers: WorkerConfig {
                num_workers: num_cpus::get() * 2,
                task_timeout_secs: Some(300),
                shutdown_timeout_secs: Some(60),
                ..Default::default()
            },
            queue: QueueConfig {
                max_queue_size: 0,            // unlimited
                visibility_timeout_secs: 900, // 15 minutes
                retention_secs: 86400,        // 24 hours
            },
            retry: RetryPolicy::exponential(5),
            engine: EngineConfig {
                health_check_interval_secs: 60,
                enable_auto_cleanup: true,
            },
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                default_deadline_ms: Some(10_000),
            },
            workers: WorkerConfig {
                num_workers: 1,
                task_timeout_secs: Some(5),
                shutdown_timeout_secs: Some(5),
                idle_timeout_ms: 50,
                defer_delay_ms: 10,
            },
            queue: QueueConfig {
                max_queue_size: 100,
                visibility_timeout_secs: 10,
                retention_secs: 60,
            },
            retry: RetryPolicy::fixed(2, 10),
            engine: EngineConfig {
                health_check_interval_secs: 1,
                enable_auto_cleanup: false,
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
                ..Default::default()
            },
            cron_secret: Some("test-secret".to_string()),
            ..Default::default()
        }
    }

    /// Load configuration from the environment, reading `.env` first when present.
    ///
    /// Recognised variables: `CRON_SECRET`, `JOBSMITH_BIND_ADDR`,
    /// `JOBSMITH_WORKERS`, `JOBSMITH_LOG_LEVEL`, `JOBSMITH_LOG_JSON`,
    /// `JOBSMITH_TRIGGERS_FILE` and `JOBSMITH_ARTIFACT_DIR`.
    pub fn from_env() -> JobResult<Self> {
        load_dotenv(dotenvy::dotenv())?;
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> JobResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.cron_secret = lookup("CRON_SECRET").filter(|s| !s.trim().is_empty());

        if let Some(addr) = lookup("JOBSMITH_BIND_ADDR") {
            config.server.bind_addr = addr;
        }

        if let Some(workers) = lookup("JOBSMITH_WORKERS") {
            config.workers.num_workers = workers
                .parse()
                .map_err(|_| JobError::config(format!("JOBSMITH_WORKERS is not a number: {workers}")))?;
        }

        if let Some(level) = lookup("JOBSMITH_LOG_LEVEL") {
            config.logging.level = level.parse()?;
        }

        if let Some(json) = lookup("JOBSMITH_LOG_JSON") {
            config.logging.json_format = matches!(json.as_str(), "1" | "true" | "yes");
            config.logging.colored = !config.logging.json_format;
        }

        if let Some(dir) = lookup("JOBSMITH_ARTIFACT_DIR") {
            config.artifact_dir = dir;
        }

        if let Some(path) = lookup("JOBSMITH_TRIGGERS_FILE") {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                JobError::config(format!("Cannot read triggers file '{path}': {e}"))
            })?;
            config.triggers = serde_json::from_str(&raw)?;
        }

        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Validate worker config
        if self.workers.num_workers == 0 {
            errors.push("Number of workers must be greater than 0".to_string());
        }

        if self.workers.num_workers > 1000 {
            errors.push("Number of workers should not exceed 1000".to_string());
        }

        // Validate queue config
        if self.queue.visibility_timeout_secs == 0 {
            errors.push("Visibility timeout must be greater than 0".to_string());
        }

        // A lease must outlive the attempt holding it.
        match self.workers.task_timeout_secs {
            None => errors.push(
                "Task timeout must be set so attempts end before their lease".to_string(),
            ),
            Some(task_timeout) if task_timeout >= self.queue.visibility_timeout_secs => {
                errors.push(format!(
                    "Task timeout ({task_timeout}s) must be shorter than the visibility timeout ({}s)",
                    self.queue.visibility_timeout_secs
                ));
            }
            Some(_) => {}
        }

        // Validate retry policy
        if let Err(e) = self.retry.validate() {
            errors.push(e.to_string());
        }

        // Validate engine config
        if self.engine.health_check_interval_secs == 0 {
            errors.push("Health check interval must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A missing `.env` is fine; one that cannot be read or parsed is not.
fn load_dotenv<T>(result: dotenvy::Result<T>) -> JobResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(JobError::config(format!("Cannot load .env: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = JobsmithConfig::default();
        assert!(config.workers.num_workers > 0);
        assert!(config.cron_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_are_valid() {
        let development = JobsmithConfig::development();
        assert_eq!(development.workers.num_workers, 2);
        assert_eq!(development.logging.level, LogLevel::Debug);
        assert!(development.validate().is_ok());

        let production = JobsmithConfig::production();
        assert!(production.workers.num_workers >= 2);
        assert!(production.logging.json_format);
        assert_eq!(production.retry.max_attempts, 5);
        assert!(production.validate().is_ok());

        let testing = JobsmithConfig::testing();
        assert_eq!(testing.workers.num_workers, 1);
        assert!(testing.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = JobsmithConfig::default();
        assert!(config.validate().is_ok());

        config.workers.num_workers = 0;
        assert!(config.validate().is_err());
        config.workers.num_workers = 1;

        config.retry.min_delay_ms = 10_000;
        config.retry.max_delay_ms = 5_000;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("min delay")));
    }

    #[test]
    fn test_retry_policy_invariants() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::fixed(2, 1000).validate().is_ok());
        assert_eq!(RetryPolicy::none().max_attempts, 1);

        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(JobError::Configuration { .. })
        ));

        let shrinking = RetryPolicy {
            factor: 0.5,
            ..Default::default()
        };
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CRON_SECRET", "secret123"),
            ("JOBSMITH_BIND_ADDR", "127.0.0.1:9000"),
            ("JOBSMITH_WORKERS", "3"),
            ("JOBSMITH_LOG_LEVEL", "warn"),
            ("JOBSMITH_LOG_JSON", "true"),
        ]);

        let config =
            JobsmithConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.cron_secret.as_deref(), Some("secret123"));
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.workers.num_workers, 3);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert!(config.logging.json_format);
        assert!(!config.logging.colored);
    }

    #[test]
    fn test_blank_secret_counts_as_missing() {
        let config = JobsmithConfig::from_lookup(|key| {
            (key == "CRON_SECRET").then(|| "   ".to_string())
        })
        .unwrap();
        assert!(config.cron_secret.is_none());
    }

    #[test]
    fn test_bad_worker_count_is_rejected() {
        let result = JobsmithConfig::from_lookup(|key| {
            (key == "JOBSMITH_WORKERS").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(JobError::Configuration { .. })));
    }

    #[test]
    fn test_task_timeout_must_end_before_lease() {
        let mut config = JobsmithConfig::default();
        config.queue.visibility_timeout_secs = 60;

        config.workers.task_timeout_secs = Some(60);
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("shorter than the visibility timeout")));

        config.workers.task_timeout_secs = None;
        assert!(config.validate().is_err());

        config.workers.task_timeout_secs = Some(59);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_dotenv_is_ignored() {
        let missing = dotenvy::from_filename("definitely-not-here.env");
        assert!(load_dotenv(missing).is_ok());
    }

    #[test]
    fn test_malformed_dotenv_is_rejected() {
        let path = std::env::temp_dir().join(format!("jobsmith-{}.env", uuid::Uuid::new_v4()));
        std::fs::write(&path, "CRON_SECRET='unterminated\n").unwrap();

        let result = load_dotenv(dotenvy::from_path_iter(&path).and_then(|iter| {
            iter.collect::<Result<Vec<_>, _>>()
        }));
        std::fs::remove_file(&path).ok();

        assert!(matches!(result, Err(JobError::Configuration { .. })));
    }
}
