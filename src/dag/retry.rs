// src/dag/retry.rs

use std::time::Duration;

use crate::types::BackoffKind;

/// Computes the wait before the next attempt of a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    /// Ceiling for exponential growth.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl BackoffPolicy {
    pub fn fixed() -> Self {
        Self {
            kind: BackoffKind::Fixed,
            ..Self::default()
        }
    }

    /// Delay after the `failed_attempt`-th attempt (1-based) failed.
    pub fn delay_for(&self, base: Duration, failed_attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Exponential => {
                let exp = failed_attempt.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exp).min(self.max_delay.max(base))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Exponential,
            max_delay: Duration::from_secs(10),
        };
        let base = Duration::from_secs(1);
        let delays: Vec<u64> = (1..=6).map(|a| policy.delay_for(base, a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn fixed_ignores_attempt_number() {
        let policy = BackoffPolicy::fixed();
        let base = Duration::from_millis(250);
        assert_eq!(policy.delay_for(base, 1), base);
        assert_eq!(policy.delay_for(base, 9), base);
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = BackoffPolicy::default();
        let d = policy.delay_for(Duration::from_secs(300), u32::MAX);
        assert_eq!(d, Duration::from_secs(600));
    }
}
