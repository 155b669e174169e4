//! Property-based tests for sender key records
//!
//! 1. **Round-trip**: a distributed receiver decrypts every message sent after
//!    the distribution
//! 2. **Forward secrecy**: a receiver never decrypts messages sent before it
//!    received the key
//! 3. **Isolation**: ciphertext is bound to its associated data

use groupcast_crypto::{NONCE_RANDOM_SIZE, SenderKeyError, SenderKeyRecord};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_distributed_receiver_reads_everything_after_join(
        entropy in any::<[u8; 32]>(),
        key_id in any::<u32>(),
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..20),
    ) {
        let mut sender = SenderKeyRecord::generate(key_id, &entropy);
        let mut receiver = SenderKeyRecord::from_distribution(&sender.distribution_key());

        for (i, plaintext) in messages.iter().enumerate() {
            let encrypted = sender.encrypt(plaintext, b"aad", [i as u8; NONCE_RANDOM_SIZE])?;
            prop_assert_eq!(&receiver.decrypt(&encrypted, b"aad")?, plaintext);
        }
    }

    #[test]
    fn prop_receiver_cannot_read_before_join(
        entropy in any::<[u8; 32]>(),
        sent_before in 1usize..10,
    ) {
        let mut sender = SenderKeyRecord::generate(1, &entropy);
        let mut history = Vec::new();
        for i in 0..sent_before {
            history.push(sender.encrypt(b"old", b"aad", [i as u8; NONCE_RANDOM_SIZE])?);
        }

        let mut receiver = SenderKeyRecord::from_distribution(&sender.distribution_key());
        for encrypted in &history {
            let result = receiver.decrypt(encrypted, b"aad");
            prop_assert!(
                matches!(result, Err(SenderKeyError::RatchetTooFarBehind { .. })),
                "history message decrypted after join"
            );
        }
    }

    #[test]
    fn prop_associated_data_is_binding(
        entropy in any::<[u8; 32]>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..64),
        aad_a in prop::collection::vec(any::<u8>(), 1..32),
        aad_b in prop::collection::vec(any::<u8>(), 1..32),
    ) {
        prop_assume!(aad_a != aad_b);

        let mut sender = SenderKeyRecord::generate(3, &entropy);
        let mut receiver = SenderKeyRecord::from_distribution(&sender.distribution_key());

        let encrypted = sender.encrypt(&plaintext, &aad_a, [0; NONCE_RANDOM_SIZE])?;
        prop_assert!(receiver.decrypt(&encrypted, &aad_b).is_err());
    }
}
