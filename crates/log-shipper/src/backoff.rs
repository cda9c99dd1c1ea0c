// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;

/// Computes the next retry delay.
///
/// `previous` is the delay used for the last retry of the same batch, or
/// `None` on the first retry, in which case `base` stands in for it. The
/// previous delay is doubled, clamped to `max`, and the result is drawn
/// uniformly from `[0, clamped)`. A clamped value that rounds down to zero
/// milliseconds yields `base` instead.
pub fn next_delay<R>(
    base: Duration,
    max: Duration,
    previous: Option<Duration>,
    rng: &mut R,
) -> Duration
where
    R: Rng + ?Sized,
{
    let clamped = previous.unwrap_or(base).saturating_mul(2).min(max);

    let clamped_ms = u64::try_from(clamped.as_millis()).unwrap_or(u64::MAX);
    if clamped_ms == 0 {
        return base;
    }
    Duration::from_millis(rng.gen_range(0..clamped_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const BASE: Duration = Duration::from_millis(3_000);
    const MAX: Duration = Duration::from_millis(30_000);

    #[test]
    fn test_first_delay_is_below_twice_base() {
        for seed in 0..50 {
            let delay = next_delay(BASE, MAX, None, &mut StdRng::seed_from_u64(seed));
            assert!(delay < BASE * 2, "{delay:?}");
        }
    }

    #[test]
    fn test_each_delay_stays_below_twice_the_previous() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_millis(1_000_000);
        let mut rng = StdRng::seed_from_u64(3);
        let mut previous = None;
        for _ in 0..6 {
            let delay = next_delay(base, max, previous, &mut rng);
            if let Some(previous) = previous.filter(|p: &Duration| !p.is_zero()) {
                assert!(delay < previous * 2, "{delay:?} after {previous:?}");
            }
            previous = Some(delay);
        }
    }

    #[test]
    fn test_zero_previous_falls_back_to_base() {
        let mut rng = StdRng::seed_from_u64(1);
        let delay = next_delay(BASE, MAX, Some(Duration::ZERO), &mut rng);
        assert_eq!(delay, BASE);
    }

    #[test]
    fn test_sub_millisecond_clamp_uses_base() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Duration::from_micros(200);
        assert_eq!(next_delay(base, base, None, &mut rng), base);
    }

    #[test]
    fn test_clamped_at_max() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..100 {
            let delay = next_delay(BASE, MAX, Some(MAX), &mut rng);
            assert!(delay < MAX, "{delay:?}");
        }
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = next_delay(BASE, MAX, None, &mut StdRng::seed_from_u64(42));
        let b = next_delay(BASE, MAX, None, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn prop_delay_bounded_by_max_and_previous(
            base_ms in 1u64..5_000,
            extra_ms in 0u64..60_000,
            retries in 1usize..20,
            seed in any::<u64>(),
        ) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(base_ms + extra_ms);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut previous: Option<Duration> = None;
            for _ in 0..retries {
                let delay = next_delay(base, max, previous, &mut rng);
                match previous {
                    Some(p) if p.is_zero() => prop_assert_eq!(delay, base),
                    Some(p) => prop_assert!(delay < (p * 2).min(max)),
                    None => prop_assert!(delay < (base * 2).min(max)),
                }
                previous = Some(delay);
            }
        }
    }
}
