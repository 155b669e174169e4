//! Sender chain for forward-secure message key derivation
//!
//! # Security Properties
//!
//! - Forward Secrecy: old chain keys are overwritten when advancing
//! - Key Uniqueness: each generation produces a unique message key
//! - Determinism: same seed always produces the same key sequence

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use super::error::SenderKeyError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = &[0x02];

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = &[0x01];

/// Maximum number of generations a receiver will skip to catch up.
pub const MAX_SKIP: u32 = 2000;

/// A message key derived from the chain.
///
/// Used for a single encryption or decryption, then discarded.
#[derive(Clone, Serialize, Deserialize)]
pub struct MessageKey {
    key: [u8; 32],
    generation: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Chain generation this key was derived from.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey").field("generation", &self.generation).finish_non_exhaustive()
    }
}

/// Forward-secure symmetric chain owned by one sender identity.
///
/// Each [`advance()`](Self::advance) call derives a message key from the
/// current chain key, derives the next chain key, and overwrites the old one.
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderChain {
    chain_key: [u8; 32],
    generation: u32,
}

impl SenderChain {
    /// Create a chain from a seed. The seed becomes the chain key at
    /// generation 0.
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { chain_key: *seed, generation: 0 }
    }

    /// Restore a chain positioned at `generation`.
    ///
    /// Used when importing a distribution: the receiver starts exactly where
    /// the sender currently is and cannot derive earlier keys.
    pub fn from_parts(chain_key: [u8; 32], generation: u32) -> Self {
        Self { chain_key, generation }
    }

    /// Current generation number.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Current chain key. Only exported into distributions.
    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    /// Advance the chain and return the message key for the current
    /// generation.
    pub fn advance(&mut self) -> Result<MessageKey, SenderKeyError> {
        if self.generation == u32::MAX {
            return Err(SenderKeyError::GenerationOverflow { current: self.generation });
        }

        let message_key = self.derive(MESSAGE_LABEL);
        let next_chain_key = self.derive(CHAIN_LABEL);

        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current = self.generation;
        self.generation += 1;

        Ok(MessageKey { key: message_key, generation: current })
    }

    /// Advance the chain up to and including `target`.
    ///
    /// Returns the key for `target` along with the keys of every generation
    /// skipped on the way, so the caller can retain them for out-of-order
    /// delivery.
    pub fn advance_to(
        &mut self,
        target: u32,
    ) -> Result<(MessageKey, Vec<MessageKey>), SenderKeyError> {
        if target < self.generation {
            return Err(SenderKeyError::RatchetTooFarBehind {
                current: self.generation,
                requested: target,
            });
        }

        let skip = target - self.generation;
        if skip > MAX_SKIP {
            return Err(SenderKeyError::TooFarAhead {
                current: self.generation,
                requested: target,
                max_skip: MAX_SKIP,
            });
        }

        let mut skipped = Vec::with_capacity(skip as usize);
        loop {
            let key = self.advance()?;
            if key.generation() == target {
                return Ok((key, skipped));
            }
            skipped.push(key);
        }
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for SenderChain {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

impl std::fmt::Debug for SenderChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderChain").field("generation", &self.generation).finish_non_exhaustive()
    }
}
