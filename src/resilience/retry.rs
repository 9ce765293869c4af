//! Exponential backoff schedule with multiplicative jitter.
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub base: f64,
    /// Fraction in `[0, 1]`; each delay is stretched by up to this much.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            base: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry number `retry` (1-based):
    /// `initial_delay * base^(retry - 1)`, capped at `max_delay`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.base.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay actually slept before retry number `retry`. Uniform in
    /// `[base_delay, base_delay * (1 + jitter))`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + self.jitter * rand::thread_rng().r#gen::<f64>();
        base.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            base: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(4), Duration::from_millis(500));
        assert_eq!(policy.base_delay(9), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = RetryPolicy {
            jitter: 0.25,
            ..RetryPolicy::default()
        };
        for retry in 1..=4 {
            let base = policy.base_delay(retry);
            for _ in 0..50 {
                let d = policy.delay_for(retry);
                assert!(d >= base);
                assert!(d <= base.mul_f64(1.25));
            }
        }
    }
}
