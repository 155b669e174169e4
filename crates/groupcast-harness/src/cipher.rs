//! Encryption services that misbehave on purpose.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use groupcast_core::{CipherError, EncryptionContext, GroupEncryptionService, StoreError};
use groupcast_crypto::EncryptedGroupMessage;

/// Fails every call as if the key store were down.
#[derive(Debug, Default)]
pub struct FailingEncryptionService {
    calls: AtomicUsize,
}

impl FailingEncryptionService {
    /// New service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self) -> CipherError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        CipherError::Store(StoreError::Unavailable("injected failure".into()))
    }
}

#[async_trait]
impl GroupEncryptionService for FailingEncryptionService {
    async fn encrypt_group_message(
        &self,
        _context: &EncryptionContext,
        _plaintext: &[u8],
    ) -> Result<EncryptedGroupMessage, CipherError> {
        Err(self.fail())
    }

    async fn decrypt_group_message(
        &self,
        _context: &EncryptionContext,
        _message: &EncryptedGroupMessage,
    ) -> Result<Vec<u8>, CipherError> {
        Err(self.fail())
    }
}
