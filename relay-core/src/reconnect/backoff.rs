//! Backoff delay computation.

use std::time::Duration;

/// Exponential backoff without jitter.
///
/// `delay(n) = min(max_delay, base_delay * multiplier^(n-1))` for the
/// 1-indexed attempt `n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before the given attempt.
    ///
    /// Anything that does not fit a `Duration` (overflow, NaN, negative)
    /// saturates to `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn formula_holds_for_every_attempt() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 3.0,
        };
        for attempt in 1..=10u32 {
            let expected = Duration::from_millis(250)
                .mul_f64(3f64.powi(attempt as i32 - 1))
                .min(Duration::from_secs(10));
            assert_eq!(policy.delay(attempt), expected, "attempt {attempt}");
        }
    }

    #[test]
    fn huge_attempts_saturate() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn nonsense_multiplier_saturates() {
        let policy = BackoffPolicy {
            multiplier: -2.0,
            ..Default::default()
        };
        assert_eq!(policy.delay(2), Duration::from_secs(30));
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), policy.delay(1));
    }
}
