//! Exponential backoff with a bounded number of attempts.

use std::time::Duration;

/// What to do after a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then open attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted.
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `min(initial * 2^(attempt-1), max)`; attempt 0 is treated as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Decision after `attempts_so_far` failed attempts in the current sequence.
    pub fn next(&self, attempts_so_far: u32) -> ReconnectDecision {
        if attempts_so_far >= self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        let attempt = attempts_so_far + 1;
        ReconnectDecision::Retry {
            attempt,
            delay: self.delay(attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_then_cap() {
        let policy = ReconnectPolicy::default();
        let secs: Vec<u64> = (1..=7).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
        assert_eq!(policy.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.next(0),
            ReconnectDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.next(4),
            ReconnectDecision::Retry {
                attempt: 5,
                delay: Duration::from_secs(16)
            }
        );
        assert_eq!(policy.next(5), ReconnectDecision::GiveUp);
        assert_eq!(policy.next(9), ReconnectDecision::GiveUp);
    }

    #[test]
    fn custom_policy() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
            max_attempts: 2,
        };
        assert_eq!(policy.delay(2), Duration::from_millis(500));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.next(2), ReconnectDecision::GiveUp);
    }
}
