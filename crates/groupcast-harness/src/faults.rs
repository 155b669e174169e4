//! Fault injection shared by the simulated transports.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use groupcast_core::{TransportError, UserId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Decision for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// Deliver after the configured delay
    Deliver(Duration),
    /// Fail with the given error
    Fail,
}

struct FaultState {
    unreachable: HashSet<UserId>,
    drop_rate: f64,
    delay: Duration,
    rng: ChaCha20Rng,
    dropped: usize,
}

/// Configurable failures: unreachable recipients, random drops, send delay.
///
/// Drops are drawn from a seeded RNG so a run is reproducible as long as
/// sends are decided in the same order.
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    /// No faults.
    pub fn none() -> Self {
        Self::with_seed(0)
    }

    /// No faults, drops drawn from `seed` once enabled.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Mutex::new(FaultState {
                unreachable: HashSet::new(),
                drop_rate: 0.0,
                delay: Duration::ZERO,
                rng: ChaCha20Rng::seed_from_u64(seed),
                dropped: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every send to `user` fail.
    pub fn make_unreachable(&self, user: &UserId) {
        self.lock().unreachable.insert(user.clone());
    }

    /// Undo [`Self::make_unreachable`].
    pub fn heal(&self, user: &UserId) {
        self.lock().unreachable.remove(user);
    }

    /// Undo every unreachable mark and stop dropping.
    pub fn heal_all(&self) {
        let mut state = self.lock();
        state.unreachable.clear();
        state.drop_rate = 0.0;
    }

    /// Drop each send with probability `rate`.
    pub fn set_drop_rate(&self, rate: f64) {
        self.lock().drop_rate = rate.clamp(0.0, 1.0);
    }

    /// Delay every successful send by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = delay;
    }

    /// Sends dropped at random so far.
    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }

    /// Decide the fate of a send to `recipient`.
    pub fn decide(&self, recipient: &UserId) -> FaultDecision {
        let mut state = self.lock();
        if state.unreachable.contains(recipient) {
            return FaultDecision::Fail;
        }
        if state.drop_rate > 0.0 {
            let rate = state.drop_rate;
            if state.rng.gen_bool(rate) {
                state.dropped += 1;
                return FaultDecision::Fail;
            }
        }
        FaultDecision::Deliver(state.delay)
    }

    /// Error reported for a failed send.
    pub fn error_for(recipient: &UserId) -> TransportError {
        TransportError::Unreachable(recipient.clone())
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for FaultInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjector").finish_non_exhaustive()
    }
}
