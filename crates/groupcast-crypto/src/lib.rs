//! Groupcast Cryptographic Primitives
//!
//! Sender key building blocks for group messaging. Pure functions with
//! deterministic outputs. Callers provide random bytes so tests can run
//! deterministically.
//!
//! # Key Lifecycle
//!
//! Every (group, sender, device) identity owns one [`SenderKeyRecord`]. A
//! record is minted from caller-supplied entropy and a key id. Its chain
//! produces one-time message keys; advancing the chain on every message
//! provides forward secrecy within a key id. Rotating a sender key means
//! minting a new record with a new key id, which invalidates every
//! distribution of the old one.
//!
//! ```text
//! Entropy (32 bytes) + key id
//!        │
//!        ▼
//! HKDF → Chain Seed
//!        │
//!        ▼
//! Sender Chain → Message Keys
//!        │
//!        ▼
//! AEAD (bound to group/sender/device) → Ciphertext
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Rotation: a new key id invalidates all previous distributions
//! - Chain advancement: old chain keys are zeroized after deriving the next
//! - Distributions export the chain at its current generation only, so a
//!   newly joined member cannot derive keys for earlier messages
//!
//! Sender Isolation:
//! - Each identity has an independent chain
//! - The AEAD associated data binds ciphertext to group, sender and device
//!
//! Authenticity:
//! - XChaCha20-Poly1305 AEAD rejects tampered or misrouted ciphertext

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod sender_keys;

pub use sender_keys::{
    DistributionKey, EncryptedGroupMessage, MAX_SENT_KEYS, MAX_SKIPPED_KEYS, MessageKey,
    NONCE_RANDOM_SIZE, SenderChain, SenderKeyError, SenderKeyRecord, decrypt_message,
    derive_chain_seed, encrypt_message,
};
