//! Message encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure; random bytes are provided by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use serde::{Deserialize, Serialize};

use super::{error::SenderKeyError, ratchet::MessageKey};

/// Size of the random suffix in the nonce (16 bytes)
pub const NONCE_RANDOM_SIZE: usize = 16;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// An encrypted group message with the metadata needed to pick the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedGroupMessage {
    /// Sender key id the message was encrypted under
    pub key_id: u32,
    /// Chain generation of the message key
    pub generation: u32,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; 24],
    /// Ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedGroupMessage {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE)
    }

    /// Encode as CBOR for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SenderKeyError> {
        let mut buf = Vec::with_capacity(self.ciphertext.len() + 48);
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

/// Encrypt `plaintext` with a one-time message key.
///
/// `associated_data` is authenticated but not encrypted; callers bind the
/// (group, sender, device) identity here so ciphertext cannot be replayed
/// under another identity.
pub fn encrypt_message(
    plaintext: &[u8],
    associated_data: &[u8],
    message_key: &MessageKey,
    key_id: u32,
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> EncryptedGroupMessage {
    let nonce = build_nonce(key_id, message_key.generation(), random_suffix);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let Ok(ciphertext) = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: associated_data })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    EncryptedGroupMessage { key_id, generation: message_key.generation(), nonce, ciphertext }
}

/// Decrypt a message with the key for its generation.
///
/// # Errors
///
/// - `DecryptionFailed`: wrong key, wrong associated data, or tampering
pub fn decrypt_message(
    encrypted: &EncryptedGroupMessage,
    associated_data: &[u8],
    message_key: &MessageKey,
) -> Result<Vec<u8>, SenderKeyError> {
    if message_key.generation() != encrypted.generation {
        return Err(SenderKeyError::DecryptionFailed {
            reason: format!(
                "generation mismatch: key is {}, message is {}",
                message_key.generation(),
                encrypted.generation
            ),
        });
    }

    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    cipher
        .decrypt(
            XNonce::from_slice(&encrypted.nonce),
            Payload { msg: &encrypted.ciphertext, aad: associated_data },
        )
        .map_err(|_| SenderKeyError::DecryptionFailed {
            reason: "authentication failed".to_string(),
        })
}

/// Build a 24-byte nonce.
///
/// Layout: `key_id` (4, BE) || generation (4, BE) || random (16).
fn build_nonce(key_id: u32, generation: u32, random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..4].copy_from_slice(&key_id.to_be_bytes());
    nonce[4..8].copy_from_slice(&generation.to_be_bytes());
    nonce[8..24].copy_from_slice(&random_suffix);
    nonce
}

#[cfg(test)]
mod tests {
    use super::{super::ratchet::SenderChain, *};

    fn key_at(generation: u32) -> MessageKey {
        let mut chain = SenderChain::new(&[0x11; 32]);
        let (key, _) = chain.advance_to(generation).unwrap();
        key
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = key_at(0);
        let encrypted = encrypt_message(b"hello", b"ctx", &key, 9, [0xAB; NONCE_RANDOM_SIZE]);

        assert_eq!(encrypted.key_id, 9);
        assert_eq!(encrypted.generation, 0);
        assert_eq!(decrypt_message(&encrypted, b"ctx", &key).unwrap(), b"hello");
    }

    #[test]
    fn wrong_associated_data_fails() {
        let key = key_at(2);
        let encrypted = encrypt_message(b"hello", b"group-a", &key, 1, [0; NONCE_RANDOM_SIZE]);

        let result = decrypt_message(&encrypted, b"group-b", &key);
        assert!(matches!(result, Err(SenderKeyError::DecryptionFailed { .. })));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = key_at(0);
        let mut encrypted = encrypt_message(b"original", b"", &key, 1, [0; NONCE_RANDOM_SIZE]);
        encrypted.ciphertext[0] ^= 0xFF;

        assert!(decrypt_message(&encrypted, b"", &key).is_err());
    }

    #[test]
    fn generation_mismatch_fails_before_aead() {
        let encrypted = encrypt_message(b"m", b"", &key_at(0), 1, [0; NONCE_RANDOM_SIZE]);
        let result = decrypt_message(&encrypted, b"", &key_at(1));
        assert!(
            matches!(result, Err(SenderKeyError::DecryptionFailed { reason }) if reason.contains("generation"))
        );
    }

    #[test]
    fn ciphertext_carries_tag() {
        let encrypted = encrypt_message(b"twelve bytes", b"", &key_at(0), 1, [0; NONCE_RANDOM_SIZE]);
        assert_eq!(encrypted.ciphertext.len(), 12 + POLY1305_TAG_SIZE);
        assert_eq!(encrypted.plaintext_len(), 12);
    }

    #[test]
    fn nonce_structure() {
        let nonce = build_nonce(0x0102_0304, 0x0506_0708, [0xAB; NONCE_RANDOM_SIZE]);
        assert_eq!(&nonce[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&nonce[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&nonce[8..24], &[0xAB; 16]);
    }

    #[test]
    fn cbor_encoding_survives_transport() {
        let encrypted = encrypt_message(b"payload", b"", &key_at(3), 77, [5; NONCE_RANDOM_SIZE]);
        let decoded = EncryptedGroupMessage::from_bytes(&encrypted.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, encrypted);
    }
}
