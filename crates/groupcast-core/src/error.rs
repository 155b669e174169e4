//! Error types for group encryption and fan-out.
//!
//! One enum per layer. Collaborator errors (store, transport, repository)
//! are wrapped by the layer that observes them. Per-recipient failures are
//! [`DeliveryError`] values that get counted, never propagated.

use std::time::Duration;

use groupcast_crypto::SenderKeyError;
use thiserror::Error;

use crate::types::{DistributionId, GroupId, SenderKeyIdentity, UserId};

/// Errors from a [`crate::SenderKeyStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend unavailable or its lock poisoned
    #[error("sender key store unavailable: {0}")]
    Unavailable(String),

    /// Stored bytes could not be encoded or decoded
    #[error("sender key record corrupt: {0}")]
    Corrupt(String),
}

/// Errors from a [`crate::GroupEncryptionService`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// No sender key is stored for the identity
    #[error("no sender key for {0}")]
    NoSenderKey(SenderKeyIdentity),

    /// Key material rejected the operation
    #[error("sender key error: {0}")]
    SenderKey(#[from] SenderKeyError),

    /// Store failed underneath the cipher
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Key kept being rotated or removed while the cipher used it
    #[error("sender key for {0} changed during use")]
    KeyChanged(SenderKeyIdentity),
}

/// Errors from a [`crate::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Recipient has no reachable endpoint
    #[error("recipient unreachable: {0}")]
    Unreachable(UserId),

    /// Send was attempted and rejected
    #[error("send rejected: {0}")]
    Rejected(String),

    /// Underlying channel closed
    #[error("transport closed")]
    Closed,
}

/// Errors from chat and message repositories.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// Backend unavailable
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Errors from [`crate::GroupEncryptionManager`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncryptionError {
    /// Operation requires an initialized group
    #[error("group encryption not initialized: {0}")]
    NotInitialized(GroupId),

    /// Rotation ceiling reached
    #[error("key rotation limit reached for {group_id}: {limit} rotations")]
    RotationLimitExceeded {
        /// Group that hit the ceiling
        group_id: GroupId,
        /// Configured ceiling
        limit: u32,
    },

    /// No key record for the identity
    #[error("sender key not found: {0}")]
    SenderKeyNotFound(SenderKeyIdentity),

    /// Distribution message rejected
    #[error("invalid sender key distribution: {0}")]
    InvalidDistribution(String),

    /// Store failure
    #[error("store error: {0}")]
    Storage(#[from] StoreError),

    /// Encryption service failure
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

impl EncryptionError {
    /// Returns true if the caller should (re)initialize before retrying.
    pub fn requires_initialization(&self) -> bool {
        matches!(self, Self::NotInitialized(_))
    }

    /// Returns true if the error reflects broken key material rather than
    /// caller misuse; such errors mark the group unhealthy.
    pub fn is_key_error(&self) -> bool {
        match self {
            Self::Cipher(CipherError::KeyChanged(_)) => false,
            Self::Storage(_) | Self::Cipher(_) | Self::SenderKeyNotFound(_) => true,
            _ => false,
        }
    }
}

/// Why a single recipient was not delivered. Counted, never thrown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Per-recipient encryption failed
    #[error("encryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    /// Envelope could not be encoded
    #[error("envelope encoding failed: {0}")]
    Encoding(String),

    /// Transport rejected the send
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// Send did not complete in time
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// Distribution was cancelled before this recipient was attempted
    #[error("distribution cancelled")]
    Cancelled,

    /// Delivery task ended without reporting an outcome
    #[error("delivery task failed: {0}")]
    Task(String),
}

impl DeliveryError {
    /// Returns true if a retry may succeed without caller intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_) | Self::Cancelled | Self::Task(_))
    }
}

/// Errors from [`crate::GroupMessageDistributor`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DistributionError {
    /// Group does not exist; the only error that aborts a distribution
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    /// No distribution with this id
    #[error("distribution not found: {0}")]
    DistributionNotFound(DistributionId),

    /// Distribution already completed or cancelled
    #[error("distribution already terminal: {0}")]
    AlreadyTerminal(DistributionId),

    /// Distribution still running
    #[error("distribution still in progress: {0}")]
    StillInProgress(DistributionId),

    /// Chat repository failed
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Errors from [`crate::GroupHistoryManager`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// Chat does not exist
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    /// User is not a participant of the chat
    #[error("{user_id} is not a member of {group_id}")]
    NotAMember {
        /// Chat
        group_id: GroupId,
        /// User
        user_id: UserId,
    },

    /// Repository failed
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// A page read did not complete in time
    #[error("page read at offset {offset} timed out after {timeout:?}")]
    Timeout {
        /// Offset of the page
        offset: usize,
        /// Configured page timeout
        timeout: Duration,
    },

    /// Sink rejected a page
    #[error("history sink failed: {0}")]
    Sink(String),
}

impl HistoryError {
    /// Returns true if the sync may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Repository(_) | Self::Sink(_))
    }
}
