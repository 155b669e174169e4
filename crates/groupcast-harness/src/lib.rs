//! Deterministic test harness for groupcast.
//!
//! In-memory implementations of every collaborator trait, with knobs for
//! the failures a real deployment sees: unreachable peers, dropped sends,
//! slow reads, offline stores, failing key writes. Time follows tokio's
//! clock and randomness a seeded ChaCha20 stream, so a test run is
//! reproducible from its seed.
//!
//! [`Fixture`] wires the whole system together over a [`PeerTransport`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod faults;
pub mod fixture;
pub mod repository;
pub mod sim_env;
pub mod sim_transport;
pub mod store;

pub use cipher::FailingEncryptionService;
pub use faults::{FaultDecision, FaultInjector};
pub use fixture::Fixture;
pub use repository::{
    MemoryChatRepository, MemoryMessageRepository, RecordingHistorySink, chat, users,
};
pub use sim_env::{SIM_EPOCH_MILLIS, SimEnv};
pub use sim_transport::{LedgerTransport, PeerTransport};
pub use store::FlakyKeyStore;
