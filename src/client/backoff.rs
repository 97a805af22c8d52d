//! Exponential reconnection backoff with jitter
//!
//! Delays never shrink between consecutive failures and never exceed the
//! configured ceiling. Jitter adds up to `jitter * nominal` on top of the
//! nominal delay, and the result is clamped to at least the previous delay.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    nominal: Duration,
    last: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_millis(config.initial_delay_ms.max(1));
        let max = Duration::from_millis(config.max_delay_ms).max(initial);
        Self {
            initial,
            max,
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            nominal: initial,
            last: Duration::ZERO,
            attempt: 0,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let mut rng = rand::thread_rng();
        self.next_delay_with(|| rng.gen::<f64>())
    }

    fn next_delay_with(&mut self, mut unit: impl FnMut() -> f64) -> Duration {
        let nominal = self.nominal.as_secs_f64();
        let jittered = nominal * (1.0 + self.jitter * unit().clamp(0.0, 1.0));
        let delay = Duration::from_secs_f64(jittered.min(self.max.as_secs_f64()))
            .max(self.last)
            .min(self.max);

        self.last = delay;
        self.attempt = self.attempt.saturating_add(1);
        self.nominal = Duration::from_secs_f64(
            (nominal * self.multiplier).min(self.max.as_secs_f64()),
        );
        delay
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.nominal = self.initial;
        self.last = Duration::ZERO;
        self.attempt = 0;
    }

    pub fn ceiling(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: u64, max: u64, jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_delays_double_until_ceiling() {
        let mut backoff = Backoff::new(&config(100, 1_000, 0.0));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_jittered_delays_are_monotone_and_bounded() {
        for _ in 0..50 {
            let mut backoff = Backoff::new(&config(50, 2_000, 1.0));
            let mut previous = Duration::ZERO;
            for _ in 0..30 {
                let delay = backoff.next_delay();
                assert!(delay >= previous, "{delay:?} < {previous:?}");
                assert!(delay <= backoff.ceiling());
                previous = delay;
            }
            assert_eq!(previous, backoff.ceiling());
        }
    }

    #[test]
    fn test_jitter_never_shrinks_after_high_draw() {
        // a maximal draw followed by a minimal one must not go backwards
        let mut backoff = Backoff::new(&BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 1.2,
            jitter: 1.0,
        });
        let first = backoff.next_delay_with(|| 1.0);
        let second = backoff.next_delay_with(|| 0.0);
        assert_eq!(first, Duration::from_millis(200));
        assert_eq!(second, first);
    }

    #[test]
    fn test_reset_starts_over() {
        let mut backoff = Backoff::new(&config(100, 1_000, 0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
