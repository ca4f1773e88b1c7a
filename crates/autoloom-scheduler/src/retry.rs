//! Exponential backoff shared by job retries and process restarts.

use std::time::Duration;

use autoloom_core::config::{SchedulerConfig, SupervisorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn for_jobs(config: &SchedulerConfig) -> Self {
        Self::new(
            Duration::from_secs(config.retry_base_delay_secs),
            Duration::from_secs(config.retry_max_delay_secs),
        )
    }

    pub fn for_restarts(config: &SupervisorConfig) -> Self {
        Self::new(
            Duration::from_secs(config.restart_base_delay_secs),
            Duration::from_secs(config.restart_max_delay_secs),
        )
    }

    /// `min(max_delay, base_delay * 2^attempts)`, where `attempts` is the
    /// number of retries already made.
    pub fn delay(&self, attempts: u32) -> Duration {
        1u32.checked_shl(attempts)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn delay_chrono(&self, attempts: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay(attempts)).unwrap_or_else(|_| chrono::Duration::weeks(52))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_jobs(&SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_from_base() {
        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(300));
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
    }

    #[test]
    fn test_delay_monotone_and_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(3), Duration::from_secs(100));
        let mut previous = Duration::ZERO;
        for n in 0..80 {
            let d = policy.delay(n);
            assert!(d >= previous, "delay({n}) went down");
            assert!(d <= policy.max_delay);
            previous = d;
        }
        assert_eq!(policy.delay(79), Duration::from_secs(100));
    }
}
