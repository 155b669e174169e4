//! Groupcast Core
//!
//! Sender key lifecycle and scalable fan-out for group messaging.
//!
//! # Components
//!
//! ```text
//!                       send request
//!                            │
//!                            ▼
//!                 GroupMessageDistributor ──► MessageDeliveryOptimizer
//!                  │                  │
//!       per-recipient encrypt     per-recipient send
//!                  ▼                  ▼
//!        GroupEncryptionManager    Transport
//!                  │
//!                  ▼
//!   GroupEncryptionService ──► SenderKeyStore
//!
//!   GroupHistoryManager ──► MessageRepository ──► HistorySink
//! ```
//!
//! - [`GroupEncryptionManager`]: per-group key state, rotation on membership
//!   change, encrypt/decrypt delegation, distribution messages
//! - [`GroupMessageDistributor`]: strategy selection by recipient count and
//!   isolated per-recipient delivery
//! - [`MessageDeliveryOptimizer`]: ordering, batch sizing and rate limits
//! - [`GroupHistoryManager`]: paged backlog sync for new members
//!
//! External systems (key storage, transports, chat and message stores) are
//! reached only through the traits in [`store`], [`cipher`], [`transport`]
//! and [`repository`]. Time and randomness come from an [`Environment`], so
//! tests can run with a seeded RNG and a controlled clock.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cipher;
pub mod config;
pub mod distribution;
pub mod encryption;
pub mod env;
pub mod error;
pub mod history;
pub mod optimizer;
pub mod repository;
pub mod store;
pub mod transport;
pub mod types;

pub use cipher::{GroupEncryptionService, SenderKeyCipher};
pub use config::{
    DistributorConfig, EncryptionConfig, HistoryConfig, MAX_KEY_ROTATIONS, OptimizerConfig,
};
pub use distribution::{
    DistributionProgress, DistributionResult, DistributionStatus, DistributionStrategy,
    GroupMessageDistributor,
};
pub use encryption::GroupEncryptionManager;
pub use env::{Environment, SystemEnv};
pub use error::{
    CipherError, DeliveryError, DistributionError, EncryptionError, HistoryError, RepositoryError,
    StoreError, TransportError,
};
pub use history::{GroupHistoryManager, HistorySyncResult};
pub use optimizer::{MessageDeliveryOptimizer, PeerMetrics, RateLimit};
pub use repository::{ChatRepository, HistorySink, MessageRepository};
pub use store::{MemorySenderKeyStore, SenderKeyStore};
pub use transport::{DeliveryEnvelope, DeliveryHandle, Transport};
pub use types::{
    Chat, DEFAULT_DEVICE_ID, DISTRIBUTION_MESSAGE_VERSION, DeviceId, DistributionId,
    EncryptionContext, GroupEncryptionInfo, GroupEncryptionStatus, GroupId, Message,
    NetworkConditions, SenderKeyDistributionMessage, SenderKeyIdentity, UserId,
};
