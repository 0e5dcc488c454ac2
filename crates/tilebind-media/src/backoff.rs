//! Retry delay policies

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use crate::config::BackoffConfig;

/// A retry schedule
pub trait Backoff: Send {
    /// Delay before the next retry, or `None` once retries are exhausted
    fn next_delay(&mut self) -> Option<Duration>;

    /// Retries handed out so far
    fn attempts(&self) -> u32;
}

/// Creates one independent [`Backoff`] per resolution
pub trait BackoffFactory: Send + Sync {
    fn create(&self) -> Box<dyn Backoff>;
}

/// Full-jitter exponential backoff.
///
/// Retry `n` (0-based) waits `fixed_wait + uniform(0, ceiling)` where the
/// ceiling is `short_bound * 2^n` clamped to `[short_bound, long_bound]`.
pub struct FullJitterBackoff {
    fixed_wait: Duration,
    short_bound: Duration,
    long_bound: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
    rng: StdRng,
}

impl FullJitterBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic jitter, for reproducible runs
    pub fn with_seed(config: &BackoffConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &BackoffConfig, rng: StdRng) -> Self {
        Self {
            fixed_wait: config.fixed_wait(),
            short_bound: config.short_bound(),
            long_bound: config.long_bound().max(config.short_bound()),
            max_attempts: config.max_attempts,
            attempt: 0,
            rng,
        }
    }

    /// Upper bound of the random component for retry `attempt`
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let short_ms = self.short_bound.as_millis() as u64;
        let growth = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ceiling = Duration::from_millis(short_ms.saturating_mul(growth));
        ceiling.clamp(self.short_bound, self.long_bound)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Backoff for FullJitterBackoff {
    fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let ceiling_ms = self.ceiling(self.attempt).as_millis() as u64;
        self.attempt += 1;

        let jitter = Duration::from_millis(self.rng.gen_range(0..=ceiling_ms));
        Some(self.fixed_wait + jitter)
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl BackoffFactory for BackoffConfig {
    fn create(&self) -> Box<dyn Backoff> {
        Box::new(FullJitterBackoff::new(self))
    }
}

/// The same delay before every retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBackoff {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

struct ConstantSchedule {
    policy: ConstantBackoff,
    attempt: u32,
}

impl Backoff for ConstantSchedule {
    fn next_delay(&mut self) -> Option<Duration> {
        if self.policy.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay)
    }

    fn attempts(&self) -> u32 {
        self.attempt
    }
}

impl BackoffFactory for ConstantBackoff {
    fn create(&self) -> Box<dyn Backoff> {
        Box::new(ConstantSchedule {
            policy: *self,
            attempt: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            fixed_wait_ms: 5,
            short_bound_ms: 10,
            long_bound_ms: 100,
            max_attempts: Some(8),
        }
    }

    #[test]
    fn test_ceiling_grows_then_caps() {
        let backoff = FullJitterBackoff::with_seed(&config(), 1);
        assert_eq!(backoff.ceiling(0), Duration::from_millis(10));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(20));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(80));
        assert_eq!(backoff.ceiling(4), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(63), Duration::from_millis(100));
        assert_eq!(backoff.ceiling(200), Duration::from_millis(100));
    }

    #[test]
    fn test_delays_stay_within_bounds() {
        let mut backoff = FullJitterBackoff::with_seed(&config(), 42);
        for attempt in 0..8 {
            let ceiling = backoff.ceiling(attempt);
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(5), "delay {delay:?} below fixed wait");
            assert!(
                delay <= Duration::from_millis(5) + ceiling,
                "delay {delay:?} above ceiling {ceiling:?}"
            );
        }
    }

    #[test]
    fn test_exhausts_after_max_attempts() {
        let mut backoff = FullJitterBackoff::with_seed(&config(), 7);
        for _ in 0..8 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.attempts(), 8);
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 8);

        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_constant_backoff() {
        let policy = ConstantBackoff {
            delay: Duration::from_millis(25),
            max_attempts: Some(2),
        };
        let mut schedule = policy.create();
        assert_eq!(schedule.next_delay(), Some(Duration::from_millis(25)));
        assert_eq!(schedule.next_delay(), Some(Duration::from_millis(25)));
        assert_eq!(schedule.next_delay(), None);

        // Each resolution gets a fresh schedule
        assert_eq!(policy.create().attempts(), 0);
    }

    #[test]
    fn test_uncapped_backoff_keeps_going() {
        let uncapped = BackoffConfig {
            max_attempts: None,
            ..config()
        };
        let mut backoff = uncapped.create();
        for _ in 0..1000 {
            assert!(backoff.next_delay().is_some());
        }
    }
}
