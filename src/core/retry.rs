//! Retry policy evaluation.
//!
//! Decides whether a failed attempt is re-attempted and how long to wait
//! first. Delays grow exponentially from the policy's minimum and are capped
//! at its maximum; with jitter enabled the delay is drawn uniformly from
//! `[0, delay]`.

use crate::config::RetryPolicy;
use crate::error::JobError;
use rand::Rng;
use std::time::Duration;

/// Whether attempt number `attempt` (1-based) should be followed by another.
pub fn should_retry(policy: &RetryPolicy, attempt: u32, failure: &JobError) -> bool {
    attempt < policy.max_attempts && failure.is_retryable()
}

/// Backoff before the attempt after `attempt`, without jitter.
///
/// `min(max_delay, min_delay * factor^(attempt-1))`
pub fn base_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = policy.min_delay_ms as f64 * policy.factor.powi(exponent);
    let capped = if raw.is_finite() {
        raw.min(policy.max_delay_ms as f64)
    } else {
        policy.max_delay_ms as f64
    };
    Duration::from_millis(capped.max(0.0) as u64)
}

/// Backoff before the attempt after `attempt`, jittered when the policy asks for it.
pub fn next_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = base_delay(policy, attempt);
    if !policy.jitter || delay.is_zero() {
        return delay;
    }
    let millis = delay.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            min_delay_ms: 100,
            max_delay_ms: 1000,
            factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_retry_until_max_attempts() {
        let policy = policy();
        let err = JobError::transient("timeout talking to provider");

        assert!(should_retry(&policy, 1, &err));
        assert!(should_retry(&policy, 4, &err));
        assert!(!should_retry(&policy, 5, &err));
        assert!(!should_retry(&policy, 6, &err));
    }

    #[test]
    fn test_non_retryable_failures_stop_immediately() {
        let policy = policy();
        assert!(!should_retry(&policy, 1, &JobError::fatal("bad record")));
        assert!(!should_retry(
            &policy,
            1,
            &JobError::invalid_field("t", "userId", "is required")
        ));
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let err = JobError::transient("flaky");
        assert!(!should_retry(&RetryPolicy::none(), 1, &err));
    }

    #[test]
    fn test_exponential_growth_with_ceiling() {
        let policy = policy();
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| next_delay(&policy, attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_delay_is_monotonic_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 50,
            min_delay_ms: 7,
            max_delay_ms: 90_000,
            factor: 1.7,
            jitter: false,
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..=200 {
            let delay = next_delay(&policy, attempt);
            assert!(delay >= previous, "attempt {attempt} shrank");
            assert!(delay <= Duration::from_millis(policy.max_delay_ms));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(90_000));
    }

    #[test]
    fn test_huge_attempt_numbers_saturate() {
        let policy = policy();
        assert_eq!(next_delay(&policy, u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy()
        };

        for attempt in 1..=10 {
            let ceiling = base_delay(&policy, attempt);
            for _ in 0..50 {
                let delay = next_delay(&policy, attempt);
                assert!(delay <= ceiling);
                assert!(delay <= Duration::from_millis(policy.max_delay_ms));
            }
        }
    }

    #[test]
    fn test_fixed_policy() {
        let policy = RetryPolicy::fixed(3, 250);
        assert_eq!(next_delay(&policy, 1), Duration::from_millis(250));
        assert_eq!(next_delay(&policy, 3), Duration::from_millis(250));
    }
}
