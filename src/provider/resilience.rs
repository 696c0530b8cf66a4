//! Retry policy for transient provider failures.

use std::time::Duration;

/// Exponential backoff with jitter.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base =
            self.initial.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let clamped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let jitter_range = clamped * self.jitter;
            let jitter_offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
            (clamped + jitter_offset).max(0.0)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

/// Bounded retry policy applied uniformly by the orchestration layer,
/// independent of the specific failure site.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts allowed per item, first try included.
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: ExponentialBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// No retries; single attempt only.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before retrying after the given number of attempts, honoring
    /// a provider-supplied hint when it is longer.
    pub fn delay_after(&self, attempts_made: u32, hint: Option<Duration>) -> Duration {
        let computed = self.backoff.delay_for(attempts_made);
        match hint {
            Some(hint) if hint > computed => hint,
            _ => computed,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
                .with_jitter(0.0);

        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(750), 2.0)
                .with_jitter(0.0);
        assert_eq!(backoff.delay_for(12), Duration::from_millis(750));
    }

    #[test]
    fn test_policy_attempt_budget() {
        let policy = RetryPolicy::new(3);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));

        assert!(!RetryPolicy::none().allows_retry(1));
    }

    #[test]
    fn test_policy_honors_longer_hint() {
        let policy = RetryPolicy::new(3).with_backoff(
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10), 2.0)
                .with_jitter(0.0),
        );

        let delay = policy.delay_after(1, Some(Duration::from_secs(5)));
        assert_eq!(delay, Duration::from_secs(5));

        let delay = policy.delay_after(1, Some(Duration::from_millis(10)));
        assert_eq!(delay, Duration::from_millis(100));
    }
}
