//! Shared-secret authentication for trigger and enqueue calls.

use crate::error::{JobError, JobResult};

/// Check an `Authorization` header value against the configured secret.
///
/// The secret is checked first: when it is missing or blank the call fails
/// with [`JobError::Configuration`] no matter what the caller sent. The
/// header must then be `Bearer <secret>`; anything else is
/// [`JobError::Unauthorized`].
pub fn authenticate(secret: Option<&str>, authorization: Option<&str>) -> JobResult<()> {
    let secret = secret
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| JobError::config("CRON_SECRET is not configured"))?;

    let token = authorization
        .and_then(|header| header.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .ok_or(JobError::Unauthorized)?;

    if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
        Ok(())
    } else {
        Err(JobError::Unauthorized)
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}
