//! # Logical Clock
//!
//! Lamport clock shared by every process in the cluster. Each process owns
//! exactly one instance, guarded by the same lock as the rest of its state.
//!
//! ## Rules
//!
//! - Before emitting any message: [`LogicalClock::tick`]
//! - On every inbound message carrying clock `c`: [`LogicalClock::observe`],
//!   which sets `local = max(local, c) + 1`
//!
//! The clock never decreases. It gives humans a causal partial order to read
//! in logs; nothing reorders messages based on it.

/// Lamport-style logical clock backed by a 64-bit counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalClock {
    time: u64,
}

impl LogicalClock {
    /// Create a clock starting at 0.
    pub fn new() -> Self {
        Self { time: 0 }
    }

    /// Current value without advancing.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Advance for a local send event and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.time = self.time.saturating_add(1);
        self.time
    }

    /// Merge a remote clock value and return the new local value.
    pub fn observe(&mut self, remote: u64) -> u64 {
        self.time = self.time.max(remote).saturating_add(1);
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn tick_increments_by_one() {
        let mut clock = LogicalClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.time(), 2);
    }

    #[test]
    fn observe_jumps_past_remote() {
        let mut clock = LogicalClock::new();
        clock.tick();
        assert_eq!(clock.observe(10), 11);
        // a stale remote value still advances the clock
        assert_eq!(clock.observe(3), 12);
    }

    #[test]
    fn random_sequences_stay_strictly_increasing() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut clock = LogicalClock::new();
        let mut highest_seen = 0u64;

        for _ in 0..10_000 {
            let before = clock.time();
            let after = if rng.gen_bool(0.5) {
                clock.tick()
            } else {
                let remote = rng.gen_range(0..50_000);
                highest_seen = highest_seen.max(remote);
                clock.observe(remote)
            };
            assert!(after > before);
            assert!(after > highest_seen);
        }
    }
}
