//! Simulation state and desync hashing.

use std::time::Duration;

use crate::fixed::{Fixed64, Ticks};

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Mutable simulation bookkeeping tracked by the engine.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct SimState {
    /// Incremented by 1 at the end of every `Engine::update`.
    pub tick: Ticks,

    /// Total simulated time passed to `Engine::update`.
    pub elapsed: Duration,
}

impl SimState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&mut self, dt: Duration) {
        self.tick += 1;
        self.elapsed += dt;
    }
}

// ---------------------------------------------------------------------------
// Tick report
// ---------------------------------------------------------------------------

/// What one `Engine::update` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// The tick that was just run.
    pub tick: Ticks,
    /// Graph changes drained in pre-tick.
    pub graph_changes: usize,
    /// Successful pump transfers.
    pub transfers: usize,
    /// Active cycles run.
    pub active_cycles: usize,
    /// Reinforcement transitions.
    pub reinforce_transitions: usize,
    /// Nodes whose persisted state was written this tick.
    pub saves_dispatched: usize,
    pub state_hash: u64,
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A deterministic hash of simulation state for desync detection.
///
/// Uses FNV-1a (64-bit). Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write(&[v as u8]);
    }

    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_state_advances() {
        let mut state = SimState::new();
        state.advance(Duration::from_millis(250));
        state.advance(Duration::from_millis(250));
        assert_eq!(state.tick, 2);
        assert_eq!(state.elapsed, Duration::from_millis(500));
    }

    #[test]
    fn state_hash_deterministic() {
        let mut h1 = StateHash::new();
        h1.write_u64(42);
        h1.write_fixed64(Fixed64::from_num(1.5));

        let mut h2 = StateHash::new();
        h2.write_u64(42);
        h2.write_fixed64(Fixed64::from_num(1.5));

        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn state_hash_order_matters() {
        let mut h1 = StateHash::new();
        h1.write_u32(1);
        h1.write_bool(true);

        let mut h2 = StateHash::new();
        h2.write_bool(true);
        h2.write_u32(1);

        assert_ne!(h1.finish(), h2.finish());
    }
}
