//! Sender key record: the persisted state of one (group, sender, device)
//! identity.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::{
    derivation::derive_chain_seed,
    encryption::{EncryptedGroupMessage, NONCE_RANDOM_SIZE, decrypt_message, encrypt_message},
    error::SenderKeyError,
    ratchet::{MessageKey, SenderChain},
};

/// Upper bound on skipped message keys kept for out-of-order delivery.
/// Oldest keys are evicted first.
pub const MAX_SKIPPED_KEYS: usize = 2000;

/// Upper bound on the owner's own sent message keys kept for read-back.
pub const MAX_SENT_KEYS: usize = 32;

/// Key material exported to a recipient in a distribution message.
///
/// Carries the chain at its *current* generation, never an earlier one.
#[derive(Clone, Serialize, Deserialize)]
pub struct DistributionKey {
    /// Sender key id
    pub key_id: u32,
    /// Generation the chain key is positioned at
    pub generation: u32,
    /// Chain key at `generation`
    pub chain_key: [u8; 32],
}

impl DistributionKey {
    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SenderKeyError> {
        let mut buf = Vec::with_capacity(64);
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SenderKeyError::Serialization { reason: e.to_string() })?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SenderKeyError> {
        ciborium::from_reader(bytes)
            .map_err(|e| SenderKeyError::Serialization { reason: e.to_string() })
    }
}

impl Drop for DistributionKey {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

impl std::fmt::Debug for DistributionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionKey")
            .field("key_id", &self.key_id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Sender key state for one identity.
///
/// # Invariants
///
/// - `skipped` never exceeds [`MAX_SKIPPED_KEYS`], `sent` never exceeds
///   [`MAX_SENT_KEYS`]
/// - every retained key has a generation below `chain.generation()`
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderKeyRecord {
    key_id: u32,
    chain: SenderChain,
    skipped: VecDeque<MessageKey>,
    sent: VecDeque<MessageKey>,
}

impl SenderKeyRecord {
    /// Mint a fresh record from secure entropy.
    pub fn generate(key_id: u32, entropy: &[u8; 32]) -> Self {
        let seed = derive_chain_seed(entropy, key_id);
        Self {
            key_id,
            chain: SenderChain::new(&seed),
            skipped: VecDeque::new(),
            sent: VecDeque::new(),
        }
    }

    /// Build a receiving record from a peer's distribution.
    pub fn from_distribution(distribution: &DistributionKey) -> Self {
        Self {
            key_id: distribution.key_id,
            chain: SenderChain::from_parts(distribution.chain_key, distribution.generation),
            skipped: VecDeque::new(),
            sent: VecDeque::new(),
        }
    }

    /// Sender key id.
    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    /// Next generation the chain will produce.
    pub fn generation(&self) -> u32 {
        self.chain.generation()
    }

    /// Number of message keys currently retained.
    pub fn retained_keys(&self) -> usize {
        self.skipped.len() + self.sent.len()
    }

    /// Export the chain at its current position for distribution.
    pub fn distribution_key(&self) -> DistributionKey {
        DistributionKey {
            key_id: self.key_id,
            generation: self.chain.generation(),
            chain_key: *self.chain.chain_key(),
        }
    }

    /// Encrypt as the owner of this record.
    ///
    /// The message key is retained so the sending device can read its own
    /// message back.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        associated_data: &[u8],
        random_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<EncryptedGroupMessage, SenderKeyError> {
        let message_key = self.chain.advance()?;
        let encrypted =
            encrypt_message(plaintext, associated_data, &message_key, self.key_id, random_suffix);
        retain(&mut self.sent, message_key, MAX_SENT_KEYS);
        Ok(encrypted)
    }

    /// Decrypt a message produced under this record's key id.
    ///
    /// Messages ahead of the chain advance it, retaining skipped keys. Messages
    /// behind it consume a retained key.
    pub fn decrypt(
        &mut self,
        encrypted: &EncryptedGroupMessage,
        associated_data: &[u8],
    ) -> Result<Vec<u8>, SenderKeyError> {
        if encrypted.key_id != self.key_id {
            return Err(SenderKeyError::KeyIdMismatch {
                expected: self.key_id,
                actual: encrypted.key_id,
            });
        }

        if encrypted.generation < self.chain.generation() {
            let current = self.chain.generation();
            for keys in [&mut self.sent, &mut self.skipped] {
                if let Some(position) =
                    keys.iter().position(|k| k.generation() == encrypted.generation)
                {
                    let plaintext = decrypt_message(encrypted, associated_data, &keys[position])?;
                    keys.remove(position);
                    return Ok(plaintext);
                }
            }
            return Err(SenderKeyError::RatchetTooFarBehind {
                current,
                requested: encrypted.generation,
            });
        }

        let (message_key, skipped) = self.chain.advance_to(encrypted.generation)?;
        for key in skipped {
            retain(&mut self.skipped, key, MAX_SKIPPED_KEYS);
        }
        decrypt_message(encrypted, associated_data, &message_key)
    }

    /// Encode as CBOR for persistent stores.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SenderKeyError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SenderKeyError::Serialization { reason: e.to_string() })?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SenderKeyError> {
        ciborium::from_reader(bytes)
            .map_err(|e| SenderKeyError::Serialization { reason: e.to_string() })
    }
}

fn retain(keys: &mut VecDeque<MessageKey>, key: MessageKey, bound: usize) {
    keys.push_back(key);
    while keys.len() > bound {
        keys.pop_front();
    }
}

impl std::fmt::Debug for SenderKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyRecord")
            .field("key_id", &self.key_id)
            .field("generation", &self.chain.generation())
            .field("retained", &self.retained_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AAD: &[u8] = b"group/alice/1";

    fn record() -> SenderKeyRecord {
        SenderKeyRecord::generate(7, &[0x42; 32])
    }

    #[test]
    fn owner_can_read_back_own_message() {
        let mut alice = record();
        let encrypted = alice.encrypt(b"hi", AAD, [1; NONCE_RANDOM_SIZE]).unwrap();

        assert_eq!(alice.decrypt(&encrypted, AAD).unwrap(), b"hi");
        assert_eq!(alice.retained_keys(), 0);
    }

    #[test]
    fn receiver_decrypts_from_distribution() {
        let mut alice = record();
        let mut bob = SenderKeyRecord::from_distribution(&alice.distribution_key());

        let encrypted = alice.encrypt(b"hello bob", AAD, [2; NONCE_RANDOM_SIZE]).unwrap();
        assert_eq!(bob.decrypt(&encrypted, AAD).unwrap(), b"hello bob");
    }

    #[test]
    fn late_joiner_cannot_read_earlier_messages() {
        let mut alice = record();
        let before = alice.encrypt(b"history", AAD, [3; NONCE_RANDOM_SIZE]).unwrap();

        let mut carol = SenderKeyRecord::from_distribution(&alice.distribution_key());
        let result = carol.decrypt(&before, AAD);
        assert!(matches!(result, Err(SenderKeyError::RatchetTooFarBehind { .. })));
    }

    #[test]
    fn out_of_order_delivery_uses_retained_keys() {
        let mut alice = record();
        let mut bob = SenderKeyRecord::from_distribution(&alice.distribution_key());

        let m0 = alice.encrypt(b"m0", AAD, [0; NONCE_RANDOM_SIZE]).unwrap();
        let m1 = alice.encrypt(b"m1", AAD, [1; NONCE_RANDOM_SIZE]).unwrap();
        let m2 = alice.encrypt(b"m2", AAD, [2; NONCE_RANDOM_SIZE]).unwrap();

        assert_eq!(bob.decrypt(&m2, AAD).unwrap(), b"m2");
        assert_eq!(bob.decrypt(&m0, AAD).unwrap(), b"m0");
        assert_eq!(bob.decrypt(&m1, AAD).unwrap(), b"m1");

        // replay of a consumed key fails
        assert!(bob.decrypt(&m1, AAD).is_err());
    }

    #[test]
    fn rotated_key_id_is_rejected() {
        let mut old = record();
        let mut rotated = SenderKeyRecord::generate(8, &[0x43; 32]);

        let encrypted = rotated.encrypt(b"new epoch", AAD, [0; NONCE_RANDOM_SIZE]).unwrap();
        assert!(matches!(
            old.decrypt(&encrypted, AAD),
            Err(SenderKeyError::KeyIdMismatch { expected: 7, actual: 8 })
        ));
    }

    #[test]
    fn sent_keys_are_bounded() {
        let mut alice = record();
        for _ in 0..(MAX_SENT_KEYS + 10) {
            alice.encrypt(b"x", AAD, [0; NONCE_RANDOM_SIZE]).unwrap();
        }
        assert_eq!(alice.retained_keys(), MAX_SENT_KEYS);
    }

    #[test]
    fn skipped_keys_are_bounded() {
        let mut alice = record();
        let mut bob = SenderKeyRecord::from_distribution(&alice.distribution_key());

        let mut sent = Vec::new();
        for _ in 0..3500 {
            sent.push(alice.encrypt(b"x", AAD, [0; NONCE_RANDOM_SIZE]).unwrap());
        }

        // two jumps, each inside the chain skip window
        bob.decrypt(&sent[1500], AAD).unwrap();
        bob.decrypt(&sent[3499], AAD).unwrap();

        assert_eq!(bob.retained_keys(), MAX_SKIPPED_KEYS);
        // the most recent skipped generations survive eviction
        assert_eq!(bob.decrypt(&sent[3498], AAD).unwrap(), b"x");
    }

    #[test]
    fn record_survives_cbor_roundtrip() {
        let mut alice = record();
        alice.encrypt(b"one", AAD, [0; NONCE_RANDOM_SIZE]).unwrap();

        let mut restored = SenderKeyRecord::from_bytes(&alice.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.key_id(), 7);
        assert_eq!(restored.generation(), 1);

        let encrypted = restored.encrypt(b"two", AAD, [1; NONCE_RANDOM_SIZE]).unwrap();
        assert_eq!(encrypted.generation, 1);
    }
}
