//! Retry budgets and backoff delays.
//!
//! Delays grow exponentially with a bounded random jitter and never shrink
//! between consecutive retries of the same stage.

use std::time::Duration;

/// Retry budget and delay shape for one stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageRetry {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl StageRetry {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: base_delay.saturating_mul(16),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Retry budgets for the stages the orchestrator retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Portal session plus extraction; every retry uses a fresh session.
    pub session: StageRetry,
    pub storage: StageRetry,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            session: StageRetry::new(3, Duration::from_secs(2))
                .with_max_delay(Duration::from_secs(30)),
            storage: StageRetry::new(3, Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(5)),
        }
    }
}

/// Per-run delay generator for one stage.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: StageRetry,
    retries: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(policy: StageRetry) -> Self {
        Self {
            policy,
            retries: 0,
            last: Duration::ZERO,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay before the next retry. Never smaller than the previous one.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.retries).unwrap_or(i32::MAX);
        let mut delay = self.policy.base_delay.as_secs_f64() * self.policy.multiplier.powi(exponent);
        if self.policy.jitter > 0.0 {
            delay += rand::random::<f64>() * self.policy.jitter * delay;
        }
        let delay = delay.clamp(0.0, self.policy.max_delay.as_secs_f64());

        let delay = Duration::from_secs_f64(delay).max(self.last);
        self.retries = self.retries.saturating_add(1);
        self.last = delay;
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_never_decrease() {
        let policy = StageRetry::new(10, Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_jitter(0.5);
        let mut backoff = Backoff::new(policy);
        let delays: Vec<_> = (0..10).map(|_| backoff.next_delay()).collect();

        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]), "{delays:?}");
        assert!(delays.iter().all(|delay| *delay <= Duration::from_secs(2)));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn without_jitter_delays_are_exact() {
        let policy = StageRetry::new(4, Duration::from_secs(1)).with_jitter(0.0);
        let mut backoff = Backoff::new(policy);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.retries(), 3);
    }

    #[test]
    fn attempts_are_at_least_one() {
        assert_eq!(StageRetry::new(0, Duration::ZERO).max_attempts, 1);
        assert_eq!(StageRetry::none().max_attempts, 1);
    }
}
