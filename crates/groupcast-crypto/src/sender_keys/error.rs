//! Error types for sender key operations

use thiserror::Error;

/// Errors from sender key operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SenderKeyError {
    /// Message was encrypted under a different sender key (rotated away or
    /// never distributed to us)
    #[error("key id mismatch: record holds {expected}, message uses {actual}")]
    KeyIdMismatch {
        /// Key id held by the local record
        expected: u32,
        /// Key id carried by the message
        actual: u32,
    },

    /// Chain is past the requested generation and the message key was not
    /// retained (already consumed or evicted)
    #[error("ratchet too far behind: at generation {current}, need {requested}")]
    RatchetTooFarBehind {
        /// Current chain generation
        current: u32,
        /// Requested generation
        requested: u32,
    },

    /// Requested generation is further ahead than the skip window allows
    #[error("generation {requested} is more than {max_skip} ahead of {current}")]
    TooFarAhead {
        /// Current chain generation
        current: u32,
        /// Requested generation
        requested: u32,
        /// Configured skip window
        max_skip: u32,
    },

    /// Decryption failed (authentication tag mismatch)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },

    /// Chain generation would overflow
    #[error("chain generation overflow at {current}")]
    GenerationOverflow {
        /// Current generation when overflow was detected
        current: u32,
    },

    /// Record or distribution bytes could not be encoded or decoded
    #[error("serialization failed: {reason}")]
    Serialization {
        /// Codec error message
        reason: String,
    },
}

impl SenderKeyError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// Fatal errors indicate tampering, corruption or exhaustion.
    /// The rest can be repaired by fetching a fresh distribution.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::DecryptionFailed { .. }
            | Self::GenerationOverflow { .. }
            | Self::Serialization { .. } => true,

            Self::KeyIdMismatch { .. }
            | Self::RatchetTooFarBehind { .. }
            | Self::TooFarAhead { .. } => false,
        }
    }
}
