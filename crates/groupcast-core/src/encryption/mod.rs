//! Group Encryption Manager
//!
//! Owns per-group encryption metadata and the sender key lifecycle. Every
//! membership change rotates the remaining members' keys so new members
//! cannot read history and removed members cannot read what follows.
//!
//! # State Machine
//!
//! ```text
//!   UNINITIALIZED ──initialize──► INITIALIZED ──cleanup──► UNINITIALIZED
//!                                   │      ▲
//!                                   └──────┘
//!                          add / remove / rotate
//! ```
//!
//! All operations except initialize and cleanup require INITIALIZED.
//!
//! # Concurrency
//!
//! Each group has its own async mutex in an owned registry. The registry lock
//! is held only to find, insert or evict a slot, so unrelated groups never
//! contend. Encryption itself runs outside the group lock; the cipher only
//! writes a key back if no rotation replaced it meanwhile.
//!
//! A lifecycle call that fails part way rolls its key writes back, and its
//! metadata and device tracking are applied only once every write landed.
//! Slots of uninitialized groups nobody observes are evicted.

mod journal;
mod slot;

use std::{collections::HashMap, sync::Arc};

use groupcast_crypto::{DistributionKey, EncryptedGroupMessage, SenderKeyRecord};
use tokio::sync::{Mutex, RwLock, watch};
use zeroize::Zeroize;

use self::{journal::KeyJournal, slot::GroupSlot};
use crate::{
    cipher::{GroupEncryptionService, SenderKeyCipher},
    config::EncryptionConfig,
    env::Environment,
    error::{CipherError, EncryptionError, StoreError},
    store::SenderKeyStore,
    types::{
        DEFAULT_DEVICE_ID, DISTRIBUTION_MESSAGE_VERSION, DeviceId, EncryptionContext,
        GroupEncryptionInfo, GroupEncryptionStatus, GroupId, SenderKeyDistributionMessage,
        SenderKeyIdentity, UserId,
    },
};

/// Sender key lifecycle per group.
pub struct GroupEncryptionManager<E: Environment> {
    env: E,
    config: EncryptionConfig,
    store: Arc<dyn SenderKeyStore>,
    service: Arc<dyn GroupEncryptionService>,
    groups: RwLock<HashMap<GroupId, Arc<Mutex<GroupSlot>>>>,
}

impl<E: Environment> GroupEncryptionManager<E> {
    /// Create a manager delegating encryption to `service`.
    ///
    /// `store` must be the store `service` reads keys from.
    pub fn new(
        env: E,
        store: Arc<dyn SenderKeyStore>,
        service: Arc<dyn GroupEncryptionService>,
        config: EncryptionConfig,
    ) -> Self {
        Self { env, config, store, service, groups: RwLock::new(HashMap::new()) }
    }

    /// Create a manager backed by a [`SenderKeyCipher`] over `store`.
    pub fn with_sender_key_cipher(
        env: E,
        store: Arc<dyn SenderKeyStore>,
        config: EncryptionConfig,
    ) -> Self {
        let cipher = SenderKeyCipher::new(env.clone(), Arc::clone(&store), config.key_lock_stripes);
        Self::new(env, store, Arc::new(cipher), config)
    }

    /// Set up sender keys for a new group.
    ///
    /// Idempotent: an initialized group is left untouched. Otherwise every
    /// member, creator first, gets a key on the default device.
    /// `member_count` reports `member_ids.len()` even if the creator is not
    /// listed.
    pub async fn initialize_group_encryption(
        &self,
        group_id: &GroupId,
        member_ids: &[UserId],
        creator_id: &UserId,
    ) -> Result<(), EncryptionError> {
        let registered = self.slot(group_id).await;
        let mut slot = registered.lock().await;

        if let Some(info) = &slot.info {
            tracing::debug!(
                group_id = %group_id,
                rotations = info.key_rotation_count,
                "Group encryption already initialized"
            );
            return Ok(());
        }

        let mut members = Vec::with_capacity(member_ids.len() + 1);
        members.push(creator_id.clone());
        for member in member_ids {
            if !members.contains(member) {
                members.push(member.clone());
            }
        }

        let identities: Vec<SenderKeyIdentity> = members
            .iter()
            .map(|member| SenderKeyIdentity::new(group_id.clone(), member.clone(), DEFAULT_DEVICE_ID))
            .collect();
        let mut journal = KeyJournal::new(self.store.as_ref());
        if let Err(e) = self.mint_each(&mut journal, &identities).await {
            journal.roll_back().await;
            let error = self.record_failure(&mut slot, e.into());
            drop(slot);
            drop(registered);
            self.evict_if_idle(group_id).await;
            return Err(error);
        }
        track_all(&mut slot, &identities);

        let now = self.env.wall_clock_millis();
        slot.info = Some(GroupEncryptionInfo {
            group_id: group_id.clone(),
            creator_id: creator_id.clone(),
            member_count: member_ids.len(),
            key_rotation_count: 0,
            last_key_rotation: now,
            created_at: now,
            is_initialized: true,
        });
        slot.last_key_error = None;
        slot.publish(now);

        tracing::info!(
            group_id = %group_id,
            creator_id = %creator_id,
            members = member_ids.len(),
            "Group encryption initialized"
        );
        Ok(())
    }

    /// Add members: mint their keys, then rotate the existing members' keys.
    pub async fn add_members_to_group_encryption(
        &self,
        group_id: &GroupId,
        new_member_ids: &[UserId],
        existing_member_ids: &[UserId],
    ) -> Result<(), EncryptionError> {
        let slot = self.existing_slot(group_id).await?;
        let mut slot = slot.lock().await;
        self.check_rotation_allowed(group_id, &slot)?;

        let mut rekeyed: Vec<SenderKeyIdentity> = new_member_ids
            .iter()
            .map(|member| SenderKeyIdentity::new(group_id.clone(), member.clone(), DEFAULT_DEVICE_ID))
            .collect();
        rekeyed.extend(identities_of(&slot, group_id, existing_member_ids));

        let mut journal = KeyJournal::new(self.store.as_ref());
        if let Err(e) = self.mint_each(&mut journal, &rekeyed).await {
            journal.roll_back().await;
            return Err(self.record_failure(&mut slot, e.into()));
        }

        track_all(&mut slot, &rekeyed);
        let rotations = self.complete_rotation(&mut slot, |info| {
            info.member_count += new_member_ids.len();
        });

        tracing::info!(
            group_id = %group_id,
            added = new_member_ids.len(),
            rotations,
            "Members added, sender keys rotated"
        );
        Ok(())
    }

    /// Remove members: delete their keys, then rotate the remaining members'
    /// keys.
    pub async fn remove_members_from_group_encryption(
        &self,
        group_id: &GroupId,
        removed_member_ids: &[UserId],
        remaining_member_ids: &[UserId],
    ) -> Result<(), EncryptionError> {
        let slot = self.existing_slot(group_id).await?;
        let mut slot = slot.lock().await;
        self.check_rotation_allowed(group_id, &slot)?;

        let removed = identities_of(&slot, group_id, removed_member_ids);
        let rekeyed = identities_of(&slot, group_id, remaining_member_ids);

        let mut journal = KeyJournal::new(self.store.as_ref());
        let outcome = match remove_each(&mut journal, &removed).await {
            Ok(()) => self.mint_each(&mut journal, &rekeyed).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            journal.roll_back().await;
            return Err(self.record_failure(&mut slot, e.into()));
        }

        for member in removed_member_ids {
            slot.devices.remove(member);
        }
        track_all(&mut slot, &rekeyed);
        let rotations = self.complete_rotation(&mut slot, |info| {
            info.member_count = remaining_member_ids.len();
        });

        tracing::info!(
            group_id = %group_id,
            removed = removed_member_ids.len(),
            rotations,
            "Members removed, sender keys rotated"
        );
        Ok(())
    }

    /// Mint fresh keys for every device of `member_ids`.
    ///
    /// Fails with [`EncryptionError::RotationLimitExceeded`] once the group
    /// has rotated `max_key_rotations` times.
    pub async fn rotate_sender_keys(
        &self,
        group_id: &GroupId,
        member_ids: &[UserId],
    ) -> Result<(), EncryptionError> {
        let slot = self.existing_slot(group_id).await?;
        let mut slot = slot.lock().await;
        self.check_rotation_allowed(group_id, &slot)?;

        let rekeyed = identities_of(&slot, group_id, member_ids);
        let mut journal = KeyJournal::new(self.store.as_ref());
        if let Err(e) = self.mint_each(&mut journal, &rekeyed).await {
            journal.roll_back().await;
            return Err(self.record_failure(&mut slot, e.into()));
        }

        track_all(&mut slot, &rekeyed);
        let rotations = self.complete_rotation(&mut slot, |_| {});

        tracing::info!(group_id = %group_id, members = member_ids.len(), rotations, "Sender keys rotated");
        Ok(())
    }

    /// Encrypt `plaintext` as (sender, device).
    pub async fn encrypt_group_message(
        &self,
        group_id: &GroupId,
        sender_id: &UserId,
        device_id: DeviceId,
        plaintext: &[u8],
    ) -> Result<EncryptedGroupMessage, EncryptionError> {
        let slot = self.initialized_slot(group_id).await?;
        let context = EncryptionContext::new(group_id.clone(), sender_id.clone(), device_id);

        match self.service.encrypt_group_message(&context, plaintext).await {
            Ok(encrypted) => Ok(encrypted),
            Err(e) => Err(self.record_failure(&mut *slot.lock().await, e.into())),
        }
    }

    /// Decrypt a message sent by (sender, device).
    pub async fn decrypt_group_message(
        &self,
        group_id: &GroupId,
        sender_id: &UserId,
        device_id: DeviceId,
        message: &EncryptedGroupMessage,
    ) -> Result<Vec<u8>, EncryptionError> {
        let slot = self.initialized_slot(group_id).await?;
        let context = EncryptionContext::new(group_id.clone(), sender_id.clone(), device_id);

        match self.service.decrypt_group_message(&context, message).await {
            Ok(plaintext) => Ok(plaintext),
            Err(e) => Err(self.record_failure(&mut *slot.lock().await, e.into())),
        }
    }

    /// Export the sender's current key for one recipient.
    pub async fn get_sender_key_distribution(
        &self,
        group_id: &GroupId,
        sender_id: &UserId,
        device_id: DeviceId,
        recipient_id: &UserId,
    ) -> Result<SenderKeyDistributionMessage, EncryptionError> {
        self.initialized_slot(group_id).await?;
        let identity = SenderKeyIdentity::new(group_id.clone(), sender_id.clone(), device_id);

        let record = self
            .store
            .load_sender_key(&identity)
            .await?
            .ok_or_else(|| EncryptionError::SenderKeyNotFound(identity.clone()))?;
        let distribution_data = record.distribution_key().to_bytes().map_err(CipherError::from)?;

        tracing::debug!(
            identity = %identity,
            recipient_id = %recipient_id,
            generation = record.generation(),
            "Sender key distribution prepared"
        );

        Ok(SenderKeyDistributionMessage {
            group_id: group_id.clone(),
            sender_id: sender_id.clone(),
            device_id,
            distribution_data: distribution_data.into(),
            timestamp: self.env.wall_clock_millis(),
            version: DISTRIBUTION_MESSAGE_VERSION,
        })
    }

    /// Store key material received from (sender, device).
    ///
    /// The message header must name the same identity as the arguments.
    pub async fn process_sender_key_distribution(
        &self,
        group_id: &GroupId,
        sender_id: &UserId,
        device_id: DeviceId,
        message: &SenderKeyDistributionMessage,
    ) -> Result<(), EncryptionError> {
        if &message.group_id != group_id
            || &message.sender_id != sender_id
            || message.device_id != device_id
        {
            return Err(EncryptionError::InvalidDistribution(format!(
                "header names {}/{}/{}, expected {group_id}/{sender_id}/{device_id}",
                message.group_id, message.sender_id, message.device_id
            )));
        }
        if message.version != DISTRIBUTION_MESSAGE_VERSION {
            return Err(EncryptionError::InvalidDistribution(format!(
                "unsupported version {}",
                message.version
            )));
        }
        let distribution = DistributionKey::from_bytes(&message.distribution_data)
            .map_err(|e| EncryptionError::InvalidDistribution(e.to_string()))?;

        let slot = self.existing_slot(group_id).await?;
        let mut slot = slot.lock().await;
        if slot.info.is_none() {
            return Err(EncryptionError::NotInitialized(group_id.clone()));
        }
        let identity = SenderKeyIdentity::new(group_id.clone(), sender_id.clone(), device_id);

        let record = SenderKeyRecord::from_distribution(&distribution);
        if let Err(e) = self.store.store_sender_key(&identity, &record).await {
            return Err(self.record_failure(&mut slot, e.into()));
        }
        slot.track(sender_id, device_id);
        slot.publish(self.env.wall_clock_millis());

        tracing::debug!(identity = %identity, key_id = distribution.key_id, "Sender key distribution processed");
        Ok(())
    }

    /// Whether the group has been initialized and not cleaned up.
    pub async fn is_group_encryption_initialized(&self, group_id: &GroupId) -> bool {
        self.group_encryption_info(group_id).await.is_some()
    }

    /// Snapshot of the group's metadata.
    pub async fn group_encryption_info(&self, group_id: &GroupId) -> Option<GroupEncryptionInfo> {
        let slot = self.groups.read().await.get(group_id).cloned()?;
        let slot = slot.lock().await;
        slot.info.clone()
    }

    /// Current health snapshot.
    pub async fn group_encryption_status(&self, group_id: &GroupId) -> GroupEncryptionStatus {
        match self.groups.read().await.get(group_id).cloned() {
            Some(slot) => slot.lock().await.snapshot(),
            None => GroupEncryptionStatus::uninitialized(group_id.clone()),
        }
    }

    /// Subscribe to health snapshots, refreshed after every mutation.
    ///
    /// Works for groups that are not initialized yet; the receiver starts at
    /// the uninitialized status.
    pub async fn observe_group_encryption_status(
        &self,
        group_id: &GroupId,
    ) -> watch::Receiver<GroupEncryptionStatus> {
        let slot = self.slot(group_id).await;
        let slot = slot.lock().await;
        slot.subscribe()
    }

    /// Whether a key record is loadable for (sender, device).
    pub async fn verify_sender_key_integrity(
        &self,
        group_id: &GroupId,
        sender_id: &UserId,
        device_id: DeviceId,
    ) -> bool {
        let Ok(slot) = self.initialized_slot(group_id).await else {
            return false;
        };
        let identity = SenderKeyIdentity::new(group_id.clone(), sender_id.clone(), device_id);

        match self.store.load_sender_key(&identity).await {
            Ok(record) => record.is_some(),
            Err(e) => {
                self.record_failure(&mut *slot.lock().await, e.into());
                false
            },
        }
    }

    /// Remove all key material and metadata for the group.
    ///
    /// The group's slot is dropped unless someone still observes its status.
    pub async fn cleanup_group_encryption(&self, group_id: &GroupId) -> Result<(), EncryptionError> {
        let Some(slot) = self.groups.read().await.get(group_id).cloned() else {
            self.store.remove_all_sender_keys_for_group(group_id).await?;
            return Ok(());
        };

        {
            let mut slot = slot.lock().await;
            if let Err(e) = self.store.remove_all_sender_keys_for_group(group_id).await {
                return Err(self.record_failure(&mut slot, e.into()));
            }
            slot.reset(self.env.wall_clock_millis());
        }
        drop(slot);
        self.evict_if_idle(group_id).await;

        tracing::info!(group_id = %group_id, "Group encryption cleaned up");
        Ok(())
    }

    /// Drop the slots of uninitialized groups whose status nobody observes
    /// any more. Returns how many were dropped.
    pub async fn release_idle_groups(&self) -> usize {
        let mut groups = self.groups.write().await;
        let before = groups.len();
        groups.retain(|_, slot| !Self::is_evictable(slot));
        before - groups.len()
    }

    async fn evict_if_idle(&self, group_id: &GroupId) {
        let mut groups = self.groups.write().await;
        if groups.get(group_id).is_some_and(Self::is_evictable) {
            groups.remove(group_id);
            tracing::debug!(group_id = %group_id, "Idle group slot evicted");
        }
    }

    // Caller holds the registry write lock, so a count of one means no task
    // can reach the slot any more.
    fn is_evictable(slot: &Arc<Mutex<GroupSlot>>) -> bool {
        Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|slot| slot.is_idle())
    }

    async fn slot(&self, group_id: &GroupId) -> Arc<Mutex<GroupSlot>> {
        if let Some(slot) = self.groups.read().await.get(group_id) {
            return Arc::clone(slot);
        }

        let mut groups = self.groups.write().await;
        Arc::clone(
            groups
                .entry(group_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(GroupSlot::new(group_id.clone())))),
        )
    }

    async fn existing_slot(&self, group_id: &GroupId) -> Result<Arc<Mutex<GroupSlot>>, EncryptionError> {
        self.groups
            .read()
            .await
            .get(group_id)
            .cloned()
            .ok_or_else(|| EncryptionError::NotInitialized(group_id.clone()))
    }

    /// Slot of an initialized group. The slot lock is released on return.
    async fn initialized_slot(
        &self,
        group_id: &GroupId,
    ) -> Result<Arc<Mutex<GroupSlot>>, EncryptionError> {
        let slot = self.existing_slot(group_id).await?;
        if slot.lock().await.info.is_none() {
            return Err(EncryptionError::NotInitialized(group_id.clone()));
        }
        Ok(slot)
    }

    fn check_rotation_allowed(&self, group_id: &GroupId, slot: &GroupSlot) -> Result<(), EncryptionError> {
        let info = slot.info.as_ref().ok_or_else(|| EncryptionError::NotInitialized(group_id.clone()))?;

        if info.key_rotation_count >= self.config.max_key_rotations {
            tracing::warn!(
                group_id = %group_id,
                rotations = info.key_rotation_count,
                "Key rotation limit reached"
            );
            return Err(EncryptionError::RotationLimitExceeded {
                group_id: group_id.clone(),
                limit: self.config.max_key_rotations,
            });
        }
        Ok(())
    }

    async fn mint_each(
        &self,
        journal: &mut KeyJournal<'_>,
        identities: &[SenderKeyIdentity],
    ) -> Result<(), StoreError> {
        for identity in identities {
            journal.store(identity, &self.new_sender_key()).await?;
        }
        Ok(())
    }

    /// Bump the rotation counter, apply `update`, clear key errors and
    /// publish. Returns the new rotation count.
    fn complete_rotation(&self, slot: &mut GroupSlot, update: impl FnOnce(&mut GroupEncryptionInfo)) -> u32 {
        let now = self.env.wall_clock_millis();
        let Some(info) = slot.info.as_mut() else {
            return 0;
        };

        info.key_rotation_count += 1;
        info.last_key_rotation = now;
        update(info);
        let rotations = info.key_rotation_count;

        slot.last_key_error = None;
        slot.publish(now);
        rotations
    }

    fn new_sender_key(&self) -> SenderKeyRecord {
        let key_id = self.env.random_u32();
        let mut entropy = [0u8; 32];
        self.env.random_bytes(&mut entropy);

        let record = SenderKeyRecord::generate(key_id, &entropy);
        entropy.zeroize();
        record
    }

    /// Mark the group unhealthy for key errors and hand the error back.
    fn record_failure(&self, slot: &mut GroupSlot, error: EncryptionError) -> EncryptionError {
        if error.is_key_error() {
            let now = self.env.wall_clock_millis();
            tracing::warn!(error = %error, "Sender key error recorded");
            slot.last_key_error = Some(now);
            slot.publish(now);
        }
        error
    }
}

/// Every tracked device of `member_ids`, or the default device for members
/// not tracked yet.
fn identities_of(slot: &GroupSlot, group_id: &GroupId, member_ids: &[UserId]) -> Vec<SenderKeyIdentity> {
    member_ids
        .iter()
        .flat_map(|member| {
            slot.devices_of(member)
                .into_iter()
                .map(move |device_id| SenderKeyIdentity::new(group_id.clone(), member.clone(), device_id))
        })
        .collect()
}

fn track_all(slot: &mut GroupSlot, identities: &[SenderKeyIdentity]) {
    for identity in identities {
        slot.track(&identity.sender_id, identity.device_id);
    }
}

async fn remove_each(
    journal: &mut KeyJournal<'_>,
    identities: &[SenderKeyIdentity],
) -> Result<(), StoreError> {
    for identity in identities {
        journal.remove(identity).await?;
    }
    Ok(())
}

impl<E: Environment> std::fmt::Debug for GroupEncryptionManager<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupEncryptionManager").field("config", &self.config).finish_non_exhaustive()
    }
}
