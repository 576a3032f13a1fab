//! Exponential backoff with jitter, isolated as a pure function per the
//! design note in spec §9: `delay(attempt) = min(MAX, BASE * 2^attempt) *
//! U[0.5, 1.0]`.

use rand::Rng;
use std::time::Duration;

const BASE: Duration = Duration::from_secs(1);
const MAX: Duration = Duration::from_secs(30);

/// Compute the reconnect delay for the given attempt count (0-indexed:
/// `attempt == 0` is the first retry after a drop). Jitter is sampled with
/// the supplied RNG so the function stays pure and testable without
/// depending on the process RNG.
pub fn delay_with_rng(attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = BASE.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exp.min(MAX);
    let jitter = rng.random_range(0.5..=1.0);
    capped.mul_f64(jitter)
}

/// Convenience wrapper using the thread-local RNG.
pub fn delay(attempt: u32) -> Duration {
    delay_with_rng(attempt, &mut rand::rng())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_then_caps_at_max() {
        let mut rng = rand::rng();
        // with jitter pinned to 1.0 the cap is exact; approximate by
        // repeated sampling and checking the observed ceiling.
        for attempt in 0..10 {
            let d = delay_with_rng(attempt, &mut rng);
            assert!(d <= MAX, "attempt {attempt} exceeded cap: {d:?}");
        }
    }

    #[test]
    fn delay_never_exceeds_base_times_two_pow_attempt_before_cap() {
        let mut rng = rand::rng();
        for attempt in 0..5 {
            let d = delay_with_rng(attempt, &mut rng);
            let uncapped = BASE.saturating_mul(1u32 << attempt);
            let ceiling = uncapped.min(MAX);
            assert!(d <= ceiling);
        }
    }

    #[test]
    fn delay_has_jitter_floor_of_half_the_ceiling() {
        // Sample many times; every sample must be >= 50% of the ceiling.
        let mut rng = rand::rng();
        let ceiling = BASE.saturating_mul(1 << 3).min(MAX);
        for _ in 0..200 {
            let d = delay_with_rng(3, &mut rng);
            assert!(d.as_secs_f64() >= ceiling.as_secs_f64() * 0.5 - 1e-9);
        }
    }

    #[test]
    fn large_attempt_counts_saturate_instead_of_overflowing() {
        let mut rng = rand::rng();
        let d = delay_with_rng(63, &mut rng);
        assert!(d <= MAX);
    }
}
