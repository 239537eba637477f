use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.unwrap_or(100),
            window_size: window_size.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Records `bytes` moved at `now`.
    pub fn add_sample(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        while let Some(first) = self.samples.front() {
            if now.duration_since(first.timestamp) > self.window_size {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        let total_bytes: u64 = self.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all recorded samples.
    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn single_sample() {
        let mut calc = SpeedCalculator::default();
        calc.add_sample(100, Instant::now());
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn steady_rate() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        calc.add_sample(500, t0);
        calc.add_sample(500, t0 + Duration::from_millis(500));

        // 1000 bytes across 0.5 s.
        assert!((calc.bytes_per_second() - 2000.0).abs() < 1e-6);
        let eta = calc.eta(4000).unwrap();
        assert_eq!(eta, Duration::from_secs(2));
    }

    #[test]
    fn old_samples_leave_window() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(1)), None);
        let t0 = Instant::now();
        calc.add_sample(1_000_000, t0);
        calc.add_sample(10, t0 + Duration::from_secs(5));
        calc.add_sample(10, t0 + Duration::from_secs(6));

        assert!((calc.bytes_per_second() - 20.0).abs() < 1e-6);
    }

    #[test]
    fn reset_clears() {
        let mut calc = SpeedCalculator::default();
        let t0 = Instant::now();
        calc.add_sample(100, t0);
        calc.add_sample(200, t0 + Duration::from_millis(10));
        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }

    #[test]
    fn max_samples_bounded() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(60)), Some(5));
        let t0 = Instant::now();
        for i in 0..20u64 {
            calc.add_sample(i * 10, t0 + Duration::from_millis(i));
        }
        assert!(calc.samples.len() <= 5);
    }
}
