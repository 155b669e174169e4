//! Sender Keys: per-sender symmetric encryption for group fan-out
//!
//! One sender key encrypts a message once per recipient envelope without any
//! pairwise session setup, which is what makes large-group fan-out affordable.
//!
//! # Architecture
//!
//! ```text
//! Entropy + key id
//!        │
//!        ▼ HKDF-Expand
//! ChainSeed
//!        │
//!        ▼ Initialize
//! SenderChain
//!        │
//!        ▼ Advance
//! MessageKey[generation]
//!        │
//!        ▼ Encrypt (aad = group/sender/device)
//! XChaCha20-Poly1305 Ciphertext
//! ```

pub mod derivation;
pub mod encryption;
pub mod error;
pub mod ratchet;
pub mod record;

pub use derivation::derive_chain_seed;
pub use encryption::{EncryptedGroupMessage, NONCE_RANDOM_SIZE, decrypt_message, encrypt_message};
pub use error::SenderKeyError;
pub use ratchet::{MessageKey, SenderChain};
pub use record::{DistributionKey, MAX_SENT_KEYS, MAX_SKIPPED_KEYS, SenderKeyRecord};
