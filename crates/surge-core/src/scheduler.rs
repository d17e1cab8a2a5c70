//! Rate Scheduler
//!
//! Turns a profile's rate and burstiness into inter-emission delays. Jitter
//! is a uniform draw in `[-1, 1]` scaled by `burstiness`, so it is zero-mean.
//! A delay that would go negative is floored at zero and the shortfall is
//! subtracted from the following delays, which keeps the long-run mean at
//! exactly `1 / rate` even when `burstiness > 1`.

use crate::profile::Profile;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Mixed into the campaign seed so scheduler draws are independent of the
/// factory's stream.
const SCHEDULER_SEED_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

pub struct RateScheduler {
    rng: StdRng,
    nominal_secs: f64,
    burstiness: f64,
    /// Seconds already "spent" by earlier floored delays.
    deficit: f64,
}

impl RateScheduler {
    pub fn new(profile: &Profile, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed ^ SCHEDULER_SEED_SALT),
            nominal_secs: profile.nominal_interval().as_secs_f64(),
            burstiness: profile.burstiness(),
            deficit: 0.0,
        }
    }

    pub fn nominal(&self) -> Duration {
        Duration::from_secs_f64(self.nominal_secs)
    }

    /// Next delay before emitting a unit. Never negative.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = if self.burstiness > 0.0 {
            self.burstiness * self.rng.random_range(-1.0..=1.0)
        } else {
            0.0
        };
        let raw = self.nominal_secs * (1.0 + jitter) - self.deficit;
        if !raw.is_finite() {
            self.deficit = 0.0;
            return self.nominal();
        }
        if raw < 0.0 {
            self.deficit = -raw;
            Duration::ZERO
        } else {
            self.deficit = 0.0;
            Duration::try_from_secs_f64(raw).unwrap_or(Duration::MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::tests::spec;
    use crate::profile::validate;

    fn mean_delay(rate: f64, burstiness: f64, n: usize) -> f64 {
        let mut s = spec("sched");
        s.target_rate_per_second = rate;
        s.burstiness = burstiness;
        let profile = validate(s).unwrap();
        let mut scheduler = RateScheduler::new(&profile, 11);
        let total: f64 = (0..n).map(|_| scheduler.next_delay().as_secs_f64()).sum();
        total / n as f64
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let mut s = spec("flat");
        s.burstiness = 0.0;
        let profile = validate(s).unwrap();
        let mut scheduler = RateScheduler::new(&profile, 0);
        for _ in 0..100 {
            let delay = scheduler.next_delay();
            assert!(delay.abs_diff(Duration::from_millis(20)) <= Duration::from_nanos(1));
        }
    }

    #[test]
    fn test_mean_converges_to_nominal() {
        for (rate, burstiness) in [(50.0, 0.2), (1000.0, 0.9), (10.0, 1.0), (200.0, 2.5)] {
            let mean = mean_delay(rate, burstiness, 50_000);
            let nominal = 1.0 / rate;
            let rel = (mean - nominal).abs() / nominal;
            assert!(rel < 0.03, "rate {rate} burst {burstiness}: mean {mean} rel {rel}");
        }
    }

    #[test]
    fn test_extreme_burstiness_stays_finite() {
        let mut s = spec("wild");
        s.target_rate_per_second = 0.01;
        s.burstiness = crate::profile::MAX_BURSTINESS;
        let profile = validate(s).unwrap();
        let mut scheduler = RateScheduler::new(&profile, 3);
        for _ in 0..10_000 {
            let _ = scheduler.next_delay();
        }

        // past validation the draw must still not panic
        scheduler.burstiness = f64::MAX;
        for _ in 0..1000 {
            let _ = scheduler.next_delay();
        }
    }

    #[test]
    fn test_high_burstiness_produces_zero_delays() {
        let mut s = spec("bursty");
        s.burstiness = 3.0;
        let profile = validate(s).unwrap();
        let mut scheduler = RateScheduler::new(&profile, 5);
        let delays: Vec<Duration> = (0..1000).map(|_| scheduler.next_delay()).collect();
        assert!(delays.iter().any(|d| d.is_zero()));
        assert!(delays.iter().any(|d| *d > Duration::from_millis(20)));
    }
}
