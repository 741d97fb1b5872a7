//! Jittered exponential backoff.

use std::time::Duration;

use rand::Rng;

use crate::constants::{BACKOFF_CEILING_RATIO, BACKOFF_JITTER_RATIO};

/// Delay before retry number `attempt` (0-based).
///
/// `min(base * 2^attempt, max)`, plus up to 10% positive jitter, then capped
/// at 90% of `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..=BACKOFF_JITTER_RATIO);
    backoff_delay_with_jitter(attempt, base, max, jitter)
}

/// Deterministic form of [`backoff_delay`]; `jitter` is clamped to
/// `[0, BACKOFF_JITTER_RATIO]`.
pub fn backoff_delay_with_jitter(
    attempt: u32,
    base: Duration,
    max: Duration,
    jitter: f64,
) -> Duration {
    let max_ms = max.as_secs_f64() * 1000.0;
    let exponential = base.as_secs_f64() * 1000.0 * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
    let capped = exponential.min(max_ms);
    let jittered = capped * (1.0 + jitter.clamp(0.0, BACKOFF_JITTER_RATIO));
    let ceiling = max_ms * BACKOFF_CEILING_RATIO;
    Duration::from_secs_f64(jittered.min(ceiling).max(0.0) / 1000.0)
}

/// Attempt counter around [`backoff_delay`].
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay for the current attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = backoff_delay(self.attempt, self.base, self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(10);

    #[test]
    fn test_backoff_monotonic_and_bounded() {
        for jitter in [0.0, 0.05, 0.1] {
            let mut previous = Duration::ZERO;
            for attempt in 0..20 {
                let delay = backoff_delay_with_jitter(attempt, BASE, MAX, jitter);
                assert!(delay >= previous, "attempt {attempt} went backwards");
                assert!(delay <= MAX);
                previous = delay;
            }
        }
    }

    #[test]
    fn test_random_jitter_stays_in_range() {
        let mut previous = Duration::ZERO;
        for attempt in 0..16 {
            let delay = backoff_delay(attempt, BASE, MAX);
            assert!(delay >= previous);
            assert!(delay.as_secs_f64() <= MAX.as_secs_f64() * BACKOFF_CEILING_RATIO + 1e-9);
            previous = delay;
        }
    }

    fn millis(d: Duration) -> f64 {
        d.as_secs_f64() * 1000.0
    }

    #[test]
    fn test_first_attempt_uses_base() {
        let delay = backoff_delay_with_jitter(0, BASE, MAX, 0.0);
        assert!((millis(delay) - 100.0).abs() < 1e-3);
        let delay = backoff_delay_with_jitter(3, BASE, MAX, 0.0);
        assert!((millis(delay) - 800.0).abs() < 1e-3);
    }

    #[test]
    fn test_ceiling_is_ninety_percent_of_max() {
        let delay = backoff_delay_with_jitter(40, BASE, MAX, 0.1);
        assert!((millis(delay) - 9000.0).abs() < 1e-3);
    }

    #[test]
    fn test_backoff_counter_resets() {
        let mut backoff = Backoff::new(BASE, MAX);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
