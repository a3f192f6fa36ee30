//! Backoff calculation.
//!
//! `delay = min(base * 2^attempt + jitter, cap)` where jitter is a random
//! amount of at most [`JITTER_FACTOR`] of the exponential term.

use std::time::Duration;

/// Upper bound on any computed delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;
/// Maximum jitter as a fraction of the exponential term.
pub const JITTER_FACTOR: f64 = 0.1;

/// Backoff with explicit randomness.
///
/// `attempt` is zero-based; `random` should be in `[0.0, 1.0)`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_delay_with_random(attempt: u32, base_ms: u64, cap_ms: u64, random: f64) -> Duration {
    let exponential = base_ms.saturating_mul(1u64 << attempt.min(31));
    let jitter = (exponential as f64 * JITTER_FACTOR * random.clamp(0.0, 1.0)).round() as u64;
    Duration::from_millis(exponential.saturating_add(jitter).min(cap_ms))
}

/// Backoff with thread-local randomness, capped at [`MAX_BACKOFF_MS`].
#[must_use]
pub fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    backoff_delay_with_random(attempt, base_ms, MAX_BACKOFF_MS, rand::random::<f64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_growth_without_jitter() {
        let delays: Vec<u64> = (0..4)
            .map(|n| backoff_delay_with_random(n, 1000, MAX_BACKOFF_MS, 0.0).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000]);
    }

    #[test]
    fn jitter_is_at_most_ten_percent() {
        let d = backoff_delay_with_random(1, 1000, MAX_BACKOFF_MS, 0.999);
        assert!(d >= Duration::from_millis(2000));
        assert!(d <= Duration::from_millis(2200));
    }

    #[test]
    fn capped_at_thirty_seconds() {
        assert_eq!(
            backoff_delay_with_random(10, 1000, MAX_BACKOFF_MS, 0.5),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        assert_eq!(
            backoff_delay_with_random(200, u64::MAX / 2, MAX_BACKOFF_MS, 1.0),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn random_variant_stays_in_bounds() {
        for _ in 0..100 {
            let d = backoff_delay(2, 100);
            assert!(d >= Duration::from_millis(400));
            assert!(d <= Duration::from_millis(440));
        }
    }
}
