//! Deterministic PRNG for simulation use (start-up jitter, etc.).
//!
//! Uses the SplitMix64 algorithm: fast, 8 bytes of state, and trivially
//! serializable for snapshots.

use std::time::Duration;

/// SplitMix64 pseudo-random number generator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    /// Create a new RNG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate the next `u64` in the sequence.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform duration in `[min, max]` at millisecond resolution.
    ///
    /// Returns `min` when the range is empty or inverted.
    pub fn duration_between(&mut self, min: Duration, max: Duration) -> Duration {
        let lo = min.as_millis() as u64;
        let hi = max.as_millis() as u64;
        if hi <= lo {
            return min;
        }
        let span = hi - lo + 1;
        Duration::from_millis(lo + self.next_u64() % span)
    }

    /// Get the internal state (for hashing/serialization).
    pub fn state(&self) -> u64 {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let mut a = SimRng::new(42);
        let mut b = SimRng::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn different_seeds_differ() {
        let mut a = SimRng::new(1);
        let mut b = SimRng::new(2);
        assert_ne!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn duration_between_stays_in_range() {
        let mut rng = SimRng::new(7);
        let min = Duration::from_secs(30);
        let max = Duration::from_secs(45);
        for _ in 0..1000 {
            let d = rng.duration_between(min, max);
            assert!(d >= min && d <= max, "{d:?} out of range");
        }
    }

    #[test]
    fn duration_between_inverted_range_returns_min() {
        let mut rng = SimRng::new(7);
        let d = rng.duration_between(Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn serialization_round_trip() {
        let mut rng = SimRng::new(42);
        for _ in 0..50 {
            rng.next_u64();
        }

        let json = serde_json::to_string(&rng).unwrap();
        let mut restored: SimRng = serde_json::from_str(&json).unwrap();
        assert_eq!(rng, restored);
        for _ in 0..10 {
            assert_eq!(rng.next_u64(), restored.next_u64());
        }
    }
}
