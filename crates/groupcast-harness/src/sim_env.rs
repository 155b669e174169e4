//! Seeded environment for reproducible runs.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use groupcast_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall clock reported at simulation start: 2024-01-01T00:00:00Z.
pub const SIM_EPOCH_MILLIS: u64 = 1_704_067_200_000;

/// Deterministic [`Environment`].
///
/// Randomness comes from a ChaCha20 stream seeded at construction, so the
/// same seed mints the same key ids and distribution ids. Time follows
/// tokio's clock: under `#[tokio::test(start_paused = true)]` it only moves
/// when the test advances it or every task is idle.
///
/// Clones share the RNG stream.
#[derive(Clone)]
pub struct SimEnv {
    seed: u64,
    rng: Arc<Mutex<ChaCha20Rng>>,
    start: tokio::time::Instant,
}

impl SimEnv {
    /// Environment seeded with `0`.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            start: tokio::time::Instant::now(),
        }
    }

    /// Seed this environment was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Simulated time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        tokio::time::Instant::now() - self.start
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("seed", &self.seed).finish_non_exhaustive()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        SIM_EPOCH_MILLIS + self.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let a = SimEnv::with_seed(7);
        let b = SimEnv::with_seed(7);
        assert_eq!(a.random_u128(), b.random_u128());
        assert_eq!(a.random_u32(), b.random_u32());
    }

    #[test]
    fn clones_share_the_stream() {
        let a = SimEnv::with_seed(7);
        let b = a.clone();
        assert_ne!(a.random_u128(), b.random_u128());
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_follows_paused_time() {
        let env = SimEnv::new();
        assert_eq!(env.wall_clock_millis(), SIM_EPOCH_MILLIS);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(env.wall_clock_millis(), SIM_EPOCH_MILLIS + 3_000);
    }
}
