//! Retry with exponential backoff for the transcription call

use std::time::{Duration, SystemTime};

/// Retry policy for the transcription phase
///
/// `max_attempts` counts the first try; a value of zero still makes one attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay between attempts (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Whether an HTTP status indicates a failure worth retrying
///
/// Rate limits (429) and server errors (5xx) are recoverable.
#[must_use]
pub fn is_recoverable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Whether a transport-level failure is transient
#[must_use]
pub fn is_recoverable_error(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }

    let lower = err.to_string().to_lowercase();
    lower.contains("connection reset") || lower.contains("dns error")
}

/// Parse a `Retry-After` header value given in whole seconds
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Compute the delay before the next attempt
///
/// `attempt` is zero-based. A server-provided `retry_after` wins but is capped
/// at `policy.max_delay`; otherwise `min(base_delay * 2^attempt + jitter, max_delay)`
/// with 0-25% jitter taken from the system clock.
#[must_use]
pub fn delay_for_attempt(
    policy: &RetryPolicy,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(ra) = retry_after {
        return ra.min(policy.max_delay);
    }

    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}
