//! Structured logging setup.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install the default `tracing` subscriber described by `config`.
///
/// `RUST_LOG` overrides the configured level when set. Does nothing if a
/// global subscriber is already installed, so embedding applications and
/// tests can install their own.
pub fn init_tracing(config: &LoggingConfig) {
    if tracing::dispatcher::has_been_set() {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.include_targets);

    let _ = if config.json_format {
        builder.json().try_init()
    } else {
        builder.with_ansi(config.colored).try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = LoggingConfig {
            level: LogLevel::Warn,
            json_format: true,
            ..Default::default()
        };
        init_tracing(&config);
        init_tracing(&LoggingConfig::default());
        assert!(tracing::dispatcher::has_been_set());
    }
}
