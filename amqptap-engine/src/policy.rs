//! Reconnect policy: when to retry a tap and how long to wait.
//!
//! The policy is a pure function of the retry count and the error, so it can
//! be tested without a broker.
//!
//! # Backoff Schedule (default)
//!
//! ```text
//! Retry  Delay
//! -----  -----
//! 1      500ms
//! 2      1s
//! 3      2s
//! 4      4s
//! ...
//! 7+     30s (cap)
//! ```

use std::time::Duration;

use crate::error::TapError;

/// Backoff and retry limits for reconnecting a tap.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the delay.
    pub max_delay: Duration,

    /// Growth factor per retry. Values below 1.0 are treated as 1.0.
    pub multiplier: f64,

    /// Give up after this many consecutive failed attempts.
    /// `None` retries transient failures forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Retry forever with the same delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_retries: None,
        }
    }

    /// Short delays and few retries, for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_retries: Some(3),
        }
    }

    /// Set the retry limit (builder style).
    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `retry_count` (1-indexed).
    ///
    /// Non-decreasing in `retry_count` and never above `max_delay`.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let initial = self.initial_delay.min(self.max_delay);
        if retry_count <= 1 {
            return initial;
        }

        let multiplier = self.multiplier.max(1.0);
        let exponent = i32::try_from(retry_count - 1).unwrap_or(i32::MAX);
        let secs = initial.as_secs_f64() * multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether an error is worth retrying at all.
    pub fn should_retry(&self, error: &TapError) -> bool {
        error.is_transient()
    }

    /// Whether another attempt is allowed after `retry_count` failures.
    pub fn allows(&self, retry_count: u32) -> bool {
        self.max_retries.map_or(true, |max| retry_count <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::from_millis(500));
        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
        assert_eq!(policy.next_delay(2), Duration::from_secs(1));
        assert_eq!(policy.next_delay(3), Duration::from_secs(2));
        assert_eq!(policy.next_delay(4), Duration::from_secs(4));
        assert_eq!(policy.next_delay(7), Duration::from_secs(30));
    }

    #[test]
    fn delays_are_non_decreasing_and_capped() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 1.5,
            max_retries: None,
        };

        let mut previous = Duration::ZERO;
        for retry in 0..200 {
            let delay = policy.next_delay(retry);
            assert!(delay >= previous, "delay shrank at retry {retry}");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
        assert_eq!(previous, policy.max_delay);
    }

    #[test]
    fn huge_retry_count_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn fixed_policy_never_changes() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(3));
        for retry in [1, 2, 10, 1000] {
            assert_eq!(policy.next_delay(retry), Duration::from_secs(3));
        }
    }

    #[test]
    fn shrinking_multiplier_is_clamped() {
        let policy = ReconnectPolicy {
            multiplier: 0.5,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.next_delay(5), policy.initial_delay);
    }

    #[test]
    fn initial_above_cap_is_capped() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(10),
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.next_delay(1), Duration::from_secs(10));
        assert_eq!(policy.next_delay(2), Duration::from_secs(10));
    }

    #[test]
    fn retry_classification() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(&TapError::Connection("reset".into())));
        assert!(policy.should_retry(&TapError::Channel("closed".into())));
        assert!(!policy.should_retry(&TapError::Authentication("refused".into())));
        assert!(!policy.should_retry(&TapError::Configuration("bad uri".into())));
        assert!(!policy.should_retry(&TapError::Bind {
            exchange: "x".into(),
            binding_key: "#".into(),
            reason: "NOT_FOUND".into(),
        }));
    }

    #[test]
    fn retry_limit() {
        let unbounded = ReconnectPolicy::default();
        assert!(unbounded.allows(u32::MAX));

        let bounded = ReconnectPolicy::default().with_max_retries(Some(2));
        assert!(bounded.allows(1));
        assert!(bounded.allows(2));
        assert!(!bounded.allows(3));
    }
}
