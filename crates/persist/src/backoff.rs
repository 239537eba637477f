use std::time::Duration;

use rand::Rng;

/// Exponential retry delay with a ceiling and optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any single delay, jitter included.
    pub max: Duration,
    /// Multiplier for each subsequent failure.
    pub factor: f64,
    /// Fraction of the delay randomly added or removed (0 disables).
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(4 * 60 * 60),
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    /// Doubling backoff without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculates the delay for a given failure count (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let max = self.max.as_secs_f64();
        let capped = (self.base.as_secs_f64() * self.factor.powi(exp)).min(max);
        if self.jitter <= 0.0 || capped <= 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let with_jitter = (capped + capped * self.jitter * offset).clamp(0.0, max);
        Duration::from_secs_f64(with_jitter)
    }
}
