//! Random module methods

use std::time::{SystemTime, UNIX_EPOCH};

/// Random module: a small linear congruential generator. Not
/// cryptographic; seeded from the clock by default.
#[derive(Debug, Clone)]
pub struct RandomLib {
    state: u64,
}

impl RandomLib {
    /// Create a generator seeded from the system clock.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);
        Self::with_seed(seed)
    }

    /// Create a generator with an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: seed | 1,
        }
    }

    /// Random.random() - uniform in [0, 1)
    pub fn random(&mut self) -> f64 {
        self.next() as f64 / (u64::MAX as f64 + 1.0)
    }

    /// Random.range(lo, hi) - uniform integer in [lo, hi] inclusive
    pub fn range(&mut self, lo: i64, hi: i64) -> i64 {
        if hi <= lo {
            return lo;
        }
        let span = (hi - lo + 1) as u64;
        lo + (self.next() % span) as i64
    }

    fn next(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }
}

impl Default for RandomLib {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_in_unit_interval() {
        let mut rng = RandomLib::with_seed(42);
        for _ in 0..100 {
            let x = rng.random();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn test_range_inclusive() {
        let mut rng = RandomLib::with_seed(7);
        for _ in 0..100 {
            let n = rng.range(1, 6);
            assert!((1..=6).contains(&n));
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = RandomLib::with_seed(99);
        let mut b = RandomLib::with_seed(99);
        for _ in 0..10 {
            assert_eq!(a.range(0, 1000), b.range(0, 1000));
        }
    }
}
