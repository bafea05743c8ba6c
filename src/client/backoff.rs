//! Retry classification and backoff timing.

use rand::Rng;
use std::time::Duration;

/// Statuses worth a local retry: throttles and common transient 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Auth-failure-shaped statuses. Some providers disguise auth failures as
/// HTTP 400; that behavior is flagged per provider.
pub fn is_auth_status(status: u16, auth_error_as_400: bool) -> bool {
    status == 401 || status == 403 || (status == 400 && auth_error_as_400)
}

/// Exponential backoff with an upstream minimum-wait hint and bounded jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Deterministic exponential delay: base·2^attempt, capped.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max)
    }

    /// Wait before the next attempt. An upstream hint replaces the
    /// exponential schedule (the server knows its own reset better than we
    /// do); up to 25% jitter is added and the ceiling always applies.
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let wait = hint.unwrap_or_else(|| self.raw_delay(attempt));
        let jitter = wait.mul_f64(rand::thread_rng().gen_range(0.0..0.25));
        (wait + jitter).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{}", status);
        }
        for status in [200, 201, 400, 401, 403, 404, 501] {
            assert!(!is_retryable_status(status), "{}", status);
        }
    }

    #[test]
    fn test_auth_statuses() {
        assert!(is_auth_status(401, false));
        assert!(is_auth_status(403, false));
        assert!(!is_auth_status(400, false));
        assert!(is_auth_status(400, true));
        assert!(!is_auth_status(429, true));
    }

    #[test]
    fn test_raw_delay_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 8,
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        };
        assert_eq!(policy.raw_delay(0), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(1), Duration::from_secs(2));
        assert_eq!(policy.raw_delay(2), Duration::from_secs(4));
        assert_eq!(policy.raw_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 0..4 {
            let raw = policy.raw_delay(attempt);
            let delay = policy.delay_for_attempt(attempt, None);
            assert!(delay >= raw);
            assert!(delay <= raw.mul_f64(1.25).min(policy.max));
        }
    }

    #[test]
    fn test_hint_overrides_schedule() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay_for_attempt(3, Some(Duration::ZERO));
        // Retry-After: 0 means retry now; jitter on zero is zero.
        assert_eq!(delay, Duration::ZERO);

        let delay = policy.delay_for_attempt(0, Some(Duration::from_secs(30)));
        assert!(delay >= Duration::from_secs(30));
        assert!(delay <= Duration::from_secs(38));
    }
}
