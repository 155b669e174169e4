//! Sender key persistence.
//!
//! One [`SenderKeyRecord`] per (group, sender, device) identity. The manager
//! and the cipher share the store; the cipher serializes load-modify-store
//! per identity, so implementations only need per-call atomicity.

mod memory;

use async_trait::async_trait;
use groupcast_crypto::SenderKeyRecord;
pub use memory::MemorySenderKeyStore;

use crate::{
    error::StoreError,
    types::{GroupId, SenderKeyIdentity},
};

/// Persists sender key material.
#[async_trait]
pub trait SenderKeyStore: Send + Sync + 'static {
    /// Store a record, replacing any previous record for the identity.
    async fn store_sender_key(
        &self,
        identity: &SenderKeyIdentity,
        record: &SenderKeyRecord,
    ) -> Result<(), StoreError>;

    /// Load the record for an identity. `None` if absent.
    async fn load_sender_key(
        &self,
        identity: &SenderKeyIdentity,
    ) -> Result<Option<SenderKeyRecord>, StoreError>;

    /// Replace the record only if the stored one is still `expected_key_id`
    /// at `expected_generation`.
    ///
    /// Returns `false` and leaves the store untouched if the record was
    /// rotated, advanced or removed since the caller loaded it.
    async fn replace_sender_key(
        &self,
        identity: &SenderKeyIdentity,
        expected_key_id: u32,
        expected_generation: u32,
        record: &SenderKeyRecord,
    ) -> Result<bool, StoreError>;

    /// Remove one identity's record. Removing an absent record is a no-op.
    async fn remove_sender_key(&self, identity: &SenderKeyIdentity) -> Result<(), StoreError>;

    /// Remove every record belonging to a group.
    async fn remove_all_sender_keys_for_group(&self, group_id: &GroupId) -> Result<(), StoreError>;

    /// Number of records stored for a group.
    async fn sender_key_count(&self, group_id: &GroupId) -> Result<usize, StoreError>;
}
