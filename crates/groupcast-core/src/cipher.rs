//! Group encryption service.
//!
//! [`GroupEncryptionService`] is the opaque encrypt/decrypt capability the
//! manager delegates to. [`SenderKeyCipher`] is the default implementation:
//! it loads the identity's [`groupcast_crypto::SenderKeyRecord`], advances it,
//! and writes it back.
//!
//! The write-back is conditional on the stored record being unchanged, so a
//! rotation that commits while a message is being encrypted is never
//! overwritten by the advanced old key. The encryption is redone under the
//! new key instead.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_trait::async_trait;
use groupcast_crypto::{EncryptedGroupMessage, NONCE_RANDOM_SIZE};
use tokio::sync::Mutex;

use crate::{
    env::Environment,
    error::CipherError,
    store::SenderKeyStore,
    types::{EncryptionContext, SenderKeyIdentity},
};

/// Opaque group encryption keyed by (group, sender, device).
#[async_trait]
pub trait GroupEncryptionService: Send + Sync + 'static {
    /// Encrypt `plaintext` with the context identity's sender key.
    async fn encrypt_group_message(
        &self,
        context: &EncryptionContext,
        plaintext: &[u8],
    ) -> Result<EncryptedGroupMessage, CipherError>;

    /// Decrypt a message produced under the context identity's sender key.
    async fn decrypt_group_message(
        &self,
        context: &EncryptionContext,
        message: &EncryptedGroupMessage,
    ) -> Result<Vec<u8>, CipherError>;
}

/// Attempts per encryption before giving up on a key that keeps changing.
const MAX_KEY_CHANGES: usize = 3;

/// Sender key cipher backed by a [`SenderKeyStore`].
///
/// Load-modify-store is serialized per identity through a fixed array of
/// lock stripes, so two sends from one identity never reuse a generation
/// while sends from different identities rarely contend.
pub struct SenderKeyCipher<E: Environment> {
    env: E,
    store: Arc<dyn SenderKeyStore>,
    stripes: Box<[Mutex<()>]>,
}

impl<E: Environment> SenderKeyCipher<E> {
    /// Create a cipher with `stripes` identity locks (at least one).
    pub fn new(env: E, store: Arc<dyn SenderKeyStore>, stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self { env, store, stripes }
    }

    fn stripe(&self, identity: &SenderKeyIdentity) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        let index = (hasher.finish() % self.stripes.len() as u64) as usize;
        &self.stripes[index]
    }
}

impl<E: Environment> std::fmt::Debug for SenderKeyCipher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeyCipher").field("stripes", &self.stripes.len()).finish_non_exhaustive()
    }
}

#[async_trait]
impl<E: Environment> GroupEncryptionService for SenderKeyCipher<E> {
    async fn encrypt_group_message(
        &self,
        context: &EncryptionContext,
        plaintext: &[u8],
    ) -> Result<EncryptedGroupMessage, CipherError> {
        let identity = context.identity();
        let associated_data = context.associated_data();
        let _guard = self.stripe(&identity).lock().await;

        for _ in 0..MAX_KEY_CHANGES {
            let mut record = self
                .store
                .load_sender_key(&identity)
                .await?
                .ok_or_else(|| CipherError::NoSenderKey(identity.clone()))?;
            let (key_id, generation) = (record.key_id(), record.generation());

            let mut random = [0u8; NONCE_RANDOM_SIZE];
            self.env.random_bytes(&mut random);

            let encrypted = record.encrypt(plaintext, &associated_data, random)?;
            if self.store.replace_sender_key(&identity, key_id, generation, &record).await? {
                return Ok(encrypted);
            }
            tracing::debug!(identity = %identity, key_id, "Sender key changed during encrypt, retrying");
        }

        Err(CipherError::KeyChanged(identity))
    }

    async fn decrypt_group_message(
        &self,
        context: &EncryptionContext,
        message: &EncryptedGroupMessage,
    ) -> Result<Vec<u8>, CipherError> {
        let identity = context.identity();
        let _guard = self.stripe(&identity).lock().await;

        let mut record = self
            .store
            .load_sender_key(&identity)
            .await?
            .ok_or_else(|| CipherError::NoSenderKey(identity.clone()))?;

        let (key_id, generation) = (record.key_id(), record.generation());

        let plaintext = record.decrypt(message, &context.associated_data())?;
        if !self.store.replace_sender_key(&identity, key_id, generation, &record).await? {
            tracing::debug!(identity = %identity, key_id, "Sender key changed during decrypt");
        }
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use groupcast_crypto::{SenderKeyError, SenderKeyRecord};

    use super::*;
    use crate::{
        env::SystemEnv,
        error::StoreError,
        store::MemorySenderKeyStore,
        types::{DEFAULT_DEVICE_ID, DeviceId, GroupId},
    };

    fn context(sender: &str) -> EncryptionContext {
        EncryptionContext::new("g".into(), sender.into(), DEFAULT_DEVICE_ID)
    }

    async fn cipher_with_key(sender: &str) -> SenderKeyCipher<SystemEnv> {
        let store = Arc::new(MemorySenderKeyStore::new());
        store
            .store_sender_key(&context(sender).identity(), &SenderKeyRecord::generate(9, &[4u8; 32]))
            .await
            .unwrap();
        SenderKeyCipher::new(SystemEnv::new(), store, 4)
    }

    #[tokio::test]
    async fn owner_reads_own_message() {
        let cipher = cipher_with_key("alice").await;
        let ctx = context("alice");

        let encrypted = cipher.encrypt_group_message(&ctx, b"hi").await.unwrap();
        let plaintext = cipher.decrypt_group_message(&ctx, &encrypted).await.unwrap();

        assert_eq!(plaintext, b"hi");
    }

    #[tokio::test]
    async fn each_send_uses_a_new_generation() {
        let cipher = cipher_with_key("alice").await;
        let ctx = context("alice");

        let first = cipher.encrypt_group_message(&ctx, b"a").await.unwrap();
        let second = cipher.encrypt_group_message(&ctx, b"a").await.unwrap();

        assert_eq!(second.generation, first.generation + 1);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[tokio::test]
    async fn missing_key_is_reported() {
        let cipher = cipher_with_key("alice").await;

        let result = cipher.encrypt_group_message(&context("bob"), b"x").await;
        assert!(matches!(result, Err(CipherError::NoSenderKey(_))));
    }

    #[tokio::test]
    async fn ciphertext_is_bound_to_device() {
        let cipher = cipher_with_key("alice").await;
        let encrypted = cipher.encrypt_group_message(&context("alice"), b"hi").await.unwrap();

        // Same key stored under device 2 still must not open a device 1 message
        let other = EncryptionContext::new("g".into(), "alice".into(), DeviceId(2));
        let record = cipher.store.load_sender_key(&context("alice").identity()).await.unwrap().unwrap();
        cipher.store.store_sender_key(&other.identity(), &record).await.unwrap();

        let result = cipher.decrypt_group_message(&other, &encrypted).await;
        assert!(matches!(result, Err(CipherError::SenderKey(SenderKeyError::DecryptionFailed { .. }))));
    }

    /// Commits a rotation between the cipher's first load and its
    /// write-back.
    struct RotatingStore {
        inner: MemorySenderKeyStore,
        rotation: Mutex<Option<SenderKeyRecord>>,
    }

    #[async_trait]
    impl SenderKeyStore for RotatingStore {
        async fn store_sender_key(
            &self,
            identity: &SenderKeyIdentity,
            record: &SenderKeyRecord,
        ) -> Result<(), StoreError> {
            self.inner.store_sender_key(identity, record).await
        }

        async fn load_sender_key(
            &self,
            identity: &SenderKeyIdentity,
        ) -> Result<Option<SenderKeyRecord>, StoreError> {
            let loaded = self.inner.load_sender_key(identity).await?;
            let rotation = self.rotation.lock().await.take();
            if let Some(rotated) = rotation {
                self.inner.store_sender_key(identity, &rotated).await?;
            }
            Ok(loaded)
        }

        async fn replace_sender_key(
            &self,
            identity: &SenderKeyIdentity,
            expected_key_id: u32,
            expected_generation: u32,
            record: &SenderKeyRecord,
        ) -> Result<bool, StoreError> {
            self.inner.replace_sender_key(identity, expected_key_id, expected_generation, record).await
        }

        async fn remove_sender_key(&self, identity: &SenderKeyIdentity) -> Result<(), StoreError> {
            self.inner.remove_sender_key(identity).await
        }

        async fn remove_all_sender_keys_for_group(&self, group_id: &GroupId) -> Result<(), StoreError> {
            self.inner.remove_all_sender_keys_for_group(group_id).await
        }

        async fn sender_key_count(&self, group_id: &GroupId) -> Result<usize, StoreError> {
            self.inner.sender_key_count(group_id).await
        }
    }

    #[tokio::test]
    async fn rotation_during_encrypt_is_not_reverted() {
        let identity = context("alice").identity();
        let store = Arc::new(RotatingStore {
            inner: MemorySenderKeyStore::new(),
            rotation: Mutex::new(Some(SenderKeyRecord::generate(10, &[5u8; 32]))),
        });
        store.inner.store_sender_key(&identity, &SenderKeyRecord::generate(9, &[4u8; 32])).await.unwrap();
        let cipher = SenderKeyCipher::new(SystemEnv::new(), Arc::clone(&store) as Arc<dyn SenderKeyStore>, 4);

        let encrypted = cipher.encrypt_group_message(&context("alice"), b"x").await.unwrap();

        assert_eq!(encrypted.key_id, 10);
        let stored = store.inner.load_sender_key(&identity).await.unwrap().unwrap();
        assert_eq!(stored.key_id(), 10);
        assert_eq!(stored.generation(), 1);
    }

    #[tokio::test]
    async fn concurrent_sends_never_share_a_generation() {
        let cipher = Arc::new(cipher_with_key("alice").await);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let cipher = Arc::clone(&cipher);
            tasks.spawn(async move {
                cipher.encrypt_group_message(&context("alice"), b"x").await.unwrap().generation
            });
        }

        let mut generations = Vec::new();
        while let Some(generation) = tasks.join_next().await {
            generations.push(generation.unwrap());
        }
        generations.sort_unstable();
        generations.dedup();
        assert_eq!(generations.len(), 32);
    }
}
