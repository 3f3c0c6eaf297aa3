//! Exponential reconnect backoff with jitter (spec §4.3/§6): base 1s,
//! doubling, capped at 30s, plus 10-20% jitter, giving up after 15 attempts.

use std::time::Duration;

use rand::Rng;

use xpose_core::constants::{
    BACKOFF_BASE, BACKOFF_CAP, BACKOFF_JITTER_MAX, BACKOFF_JITTER_MIN, BACKOFF_MULTIPLIER,
    MAX_RECONNECT_ATTEMPTS,
};

/// Tracks how many reconnect attempts have been made and hands back the
/// delay before the next one, or `None` once the attempt budget is spent.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// The delay before the next attempt, advancing internal state. Returns
    /// `None` once `MAX_RECONNECT_ATTEMPTS` has been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.next_delay_with(|min, max| rand::rng().random_range(min..max))
    }

    /// Same as `next_delay`, but with an injectable jitter source so tests
    /// can assert exact bounds without depending on real randomness.
    pub fn next_delay_with(&mut self, jitter: impl FnOnce(f64, f64) -> f64) -> Option<Duration> {
        if self.attempt >= MAX_RECONNECT_ATTEMPTS {
            return None;
        }
        let exponent = self.attempt.min(31);
        self.attempt += 1;

        let base_ms = BACKOFF_BASE.as_millis() as f64;
        let raw_ms = base_ms * (BACKOFF_MULTIPLIER as f64).powi(exponent as i32);
        let capped_ms = raw_ms.min(BACKOFF_CAP.as_millis() as f64);

        let jitter_fraction = jitter(BACKOFF_JITTER_MIN, BACKOFF_JITTER_MAX);
        let with_jitter_ms = capped_ms * (1.0 + jitter_fraction);
        Some(Duration::from_millis(with_jitter_ms.round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_respect_the_cap() {
        let mut backoff = Backoff::new();
        let mut previous = Duration::ZERO;
        for _ in 0..MAX_RECONNECT_ATTEMPTS {
            let delay = backoff.next_delay_with(|_, _| 0.0).unwrap();
            assert!(delay >= previous || delay == BACKOFF_CAP);
            assert!(delay <= BACKOFF_CAP);
            previous = delay;
        }
        assert!(backoff.next_delay_with(|_, _| 0.0).is_none());
    }

    #[test]
    fn first_delay_is_base_plus_jitter() {
        let mut backoff = Backoff::new();
        let delay = backoff.next_delay_with(|min, _max| min).unwrap();
        assert_eq!(delay, Duration::from_millis((BACKOFF_BASE.as_millis() as f64 * 1.10).round() as u64));
    }

    #[test]
    fn jitter_stays_within_the_configured_range() {
        let mut backoff = Backoff::new();
        let low = backoff.next_delay_with(|min, _| min).unwrap();
        backoff.reset();
        let high = backoff.next_delay_with(|_, max| max).unwrap();
        assert!(low <= high);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut backoff = Backoff::new();
        for _ in 0..MAX_RECONNECT_ATTEMPTS {
            assert!(backoff.next_delay_with(|_, _| 0.15).is_some());
        }
        assert!(backoff.next_delay_with(|_, _| 0.15).is_none());
        assert_eq!(backoff.attempts(), MAX_RECONNECT_ATTEMPTS);
    }
}
