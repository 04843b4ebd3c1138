//! Per-clock RNG. Every `LocalClock` owns one; `seed_all` reseeds the
//! master's and every worker's deterministically from a single seed.

use rand::{rngs::StdRng, SeedableRng};

/// Thin wrapper so call sites depend on `ClockRng`, not directly on `rand`'s
/// choice of generator; swapping the algorithm stays internal to this file.
#[derive(Debug, Clone)]
pub struct ClockRng(StdRng);

/// Derives a worker's seed from a shared run seed and its index (0 =
/// master), so `seed_all(s)` reproduces the same per-worker streams across
/// runs.
pub fn derive_seed(seed: u64, worker_index: usize) -> u64 {
    seed ^ (worker_index as u64).wrapping_mul(0x9E3779B97F4A7C15)
}

impl ClockRng {
    pub fn from_seed(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }

    pub fn for_worker(seed: u64, worker_index: usize) -> Self {
        Self::from_seed(derive_seed(seed, worker_index))
    }

    pub fn reseed(&mut self, seed: u64) {
        self.0 = StdRng::seed_from_u64(seed);
    }

    pub fn inner(&mut self) -> &mut StdRng {
        &mut self.0
    }
}

impl Default for ClockRng {
    fn default() -> Self {
        Self::from_seed(0)
    }
}
