//! Sender key store that fails writes on demand.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use groupcast_core::{
    GroupId, MemorySenderKeyStore, SenderKeyIdentity, SenderKeyStore, StoreError,
};
use groupcast_crypto::SenderKeyRecord;

const NEVER: usize = usize::MAX;

/// [`MemorySenderKeyStore`] whose nth write from now fails once.
///
/// Stores, replacements and removals count as writes; loads never fail. A
/// failed write does not reach the inner store.
#[derive(Debug)]
pub struct FlakyKeyStore {
    inner: MemorySenderKeyStore,
    writes: AtomicUsize,
    fail_at: AtomicUsize,
}

impl Default for FlakyKeyStore {
    fn default() -> Self {
        Self { inner: MemorySenderKeyStore::new(), writes: AtomicUsize::new(0), fail_at: AtomicUsize::new(NEVER) }
    }
}

impl FlakyKeyStore {
    /// Store that never fails until told to.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th write from now (1 is the next write).
    pub fn fail_nth_write(&self, n: usize) {
        let target = self.writes.load(Ordering::SeqCst) + n.max(1);
        self.fail_at.store(target, Ordering::SeqCst);
    }

    /// Writes attempted so far, failed ones included.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn write(&self) -> Result<(), StoreError> {
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at.compare_exchange(attempt, NEVER, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            return Err(StoreError::Unavailable(format!("injected failure on write {attempt}")));
        }
        Ok(())
    }
}

#[async_trait]
impl SenderKeyStore for FlakyKeyStore {
    async fn store_sender_key(
        &self,
        identity: &SenderKeyIdentity,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError> {
        self.write()?;
        self.inner.store_sender_key(identity, record).await
    }

    async fn load_sender_key(
        &self,
        identity: &SenderKeyIdentity,
    ) -> Result<Option<SenderKeyRecord>, StoreError> {
        self.inner.load_sender_key(identity).await
    }

    async fn replace_sender_key(
        &self,
        identity: &SenderKeyIdentity,
        expected_key_id: u32,
        expected_generation: u32,
        record: &SenderKeyRecord,
    ) -> Result<bool, StoreError> {
        self.write()?;
        self.inner.replace_sender_key(identity, expected_key_id, expected_generation, record).await
    }

    async fn remove_sender_key(&self, identity: &SenderKeyIdentity) -> Result<(), StoreError> {
        self.write()?;
        self.inner.remove_sender_key(identity).await
    }

    async fn remove_all_sender_keys_for_group(&self, group_id: &GroupId) -> Result<(), StoreError> {
        self.write()?;
        self.inner.remove_all_sender_keys_for_group(group_id).await
    }

    async fn sender_key_count(&self, group_id: &GroupId) -> Result<usize, StoreError> {
        self.inner.sender_key_count(group_id).await
    }
}
