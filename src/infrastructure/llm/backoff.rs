//! Retry pacing for provider requests.
//!
//! `Backoff` is a bounded iterator of sleep durations: each failed attempt
//! consumes one delay, doubling from the initial value up to a ceiling, and
//! the caller gives up when the iterator runs dry. Keeping it an iterator
//! leaves the retry *decision* with the caller, which already has the typed
//! error in hand.

use std::time::Duration;

/// Bounded, doubling delay sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    remaining: u32,
    next_ms: u64,
    max_ms: u64,
}

impl Backoff {
    pub fn new(max_retries: u32, initial_ms: u64, max_ms: u64) -> Self {
        Self { remaining: max_retries, next_ms: initial_ms.min(max_ms), max_ms }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.next_ms;
        self.next_ms = self.next_ms.saturating_mul(2).min(self.max_ms);
        Some(Duration::from_millis(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_the_ceiling() {
        let delays: Vec<u64> = Backoff::new(6, 10_000, 300_000)
            .map(|d| u64::try_from(d.as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![10_000, 20_000, 40_000, 80_000, 160_000, 300_000]);
    }

    #[test]
    fn budget_bounds_the_sequence() {
        assert_eq!(Backoff::new(3, 100, 1000).count(), 3);
        assert_eq!(Backoff::new(0, 100, 1000).next(), None);
    }

    #[test]
    fn initial_above_ceiling_is_clamped() {
        let mut backoff = Backoff::new(2, 5_000, 1_000);
        assert_eq!(backoff.next(), Some(Duration::from_millis(1_000)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(1_000)));
        assert_eq!(backoff.next(), None);
    }
}
