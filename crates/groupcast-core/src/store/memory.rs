#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use groupcast_crypto::SenderKeyRecord;

use super::SenderKeyStore;
use crate::{
    error::StoreError,
    types::{DeviceId, GroupId, SenderKeyIdentity, UserId},
};

type GroupKeys = HashMap<(UserId, DeviceId), SenderKeyRecord>;

/// In-memory sender key store.
///
/// Records are grouped by group id so removing a whole group is O(1) in the
/// number of other groups. Clones share the same underlying map. A poisoned
/// lock surfaces as [`StoreError::Unavailable`] rather than a panic.
#[derive(Clone, Default)]
pub struct MemorySenderKeyStore {
    inner: Arc<Mutex<HashMap<GroupId, GroupKeys>>>,
}

impl MemorySenderKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<GroupId, GroupKeys>>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Unavailable("sender key map poisoned".into()))
    }
}

impl std::fmt::Debug for MemorySenderKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySenderKeyStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl SenderKeyStore for MemorySenderKeyStore {
    async fn store_sender_key(
        &self,
        identity: &SenderKeyIdentity,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError> {
        let mut groups = self.lock()?;
        groups
            .entry(identity.group_id.clone())
            .or_default()
            .insert((identity.sender_id.clone(), identity.device_id), record.clone());
        Ok(())
    }

    async fn load_sender_key(
        &self,
        identity: &SenderKeyIdentity,
    ) -> Result<Option<SenderKeyRecord>, StoreError> {
        let groups = self.lock()?;
        Ok(groups
            .get(&identity.group_id)
            .and_then(|keys| keys.get(&(identity.sender_id.clone(), identity.device_id)))
            .cloned())
    }

    async fn replace_sender_key(
        &self,
        identity: &SenderKeyIdentity,
        expected_key_id: u32,
        expected_generation: u32,
        record: &SenderKeyRecord,
    ) -> Result<bool, StoreError> {
        let mut groups = self.lock()?;
        let Some(current) = groups
            .get_mut(&identity.group_id)
            .and_then(|keys| keys.get_mut(&(identity.sender_id.clone(), identity.device_id)))
        else {
            return Ok(false);
        };
        if current.key_id() != expected_key_id || current.generation() != expected_generation {
            return Ok(false);
        }

        *current = record.clone();
        Ok(true)
    }

    async fn remove_sender_key(&self, identity: &SenderKeyIdentity) -> Result<(), StoreError> {
        let mut groups = self.lock()?;
        if let Some(keys) = groups.get_mut(&identity.group_id) {
            keys.remove(&(identity.sender_id.clone(), identity.device_id));
            if keys.is_empty() {
                groups.remove(&identity.group_id);
            }
        }
        Ok(())
    }

    async fn remove_all_sender_keys_for_group(&self, group_id: &GroupId) -> Result<(), StoreError> {
        self.lock()?.remove(group_id);
        Ok(())
    }

    async fn sender_key_count(&self, group_id: &GroupId) -> Result<usize, StoreError> {
        Ok(self.lock()?.get(group_id).map_or(0, HashMap::len))
    }
}
