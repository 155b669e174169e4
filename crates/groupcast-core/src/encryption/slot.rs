//! Per-group state held by the encryption manager.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::watch;

use crate::types::{
    DEFAULT_DEVICE_ID, DeviceId, GroupEncryptionInfo, GroupEncryptionStatus, GroupId, UserId,
};

/// State of one group. Guarded by its own mutex in the manager registry.
///
/// A slot outlives cleanup while its status is observed, so subscribers keep
/// receiving updates if the group is initialized again.
pub(crate) struct GroupSlot {
    group_id: GroupId,
    /// `None` while uninitialized
    pub(crate) info: Option<GroupEncryptionInfo>,
    /// Devices holding a live key, per member
    pub(crate) devices: HashMap<UserId, BTreeSet<DeviceId>>,
    /// Wall-clock millis of the last key error since the last rotation
    pub(crate) last_key_error: Option<u64>,
    last_activity: u64,
    status: watch::Sender<GroupEncryptionStatus>,
}

impl GroupSlot {
    pub(crate) fn new(group_id: GroupId) -> Self {
        let (status, _) = watch::channel(GroupEncryptionStatus::uninitialized(group_id.clone()));
        Self {
            group_id,
            info: None,
            devices: HashMap::new(),
            last_key_error: None,
            last_activity: 0,
            status,
        }
    }

    /// Devices to re-key for a member. Untracked members get the default device.
    pub(crate) fn devices_of(&self, member: &UserId) -> Vec<DeviceId> {
        self.devices
            .get(member)
            .filter(|devices| !devices.is_empty())
            .map_or_else(|| vec![DEFAULT_DEVICE_ID], |devices| devices.iter().copied().collect())
    }

    pub(crate) fn track(&mut self, member: &UserId, device_id: DeviceId) {
        self.devices.entry(member.clone()).or_default().insert(device_id);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<GroupEncryptionStatus> {
        self.status.subscribe()
    }

    pub(crate) fn snapshot(&self) -> GroupEncryptionStatus {
        match &self.info {
            None => GroupEncryptionStatus::uninitialized(self.group_id.clone()),
            Some(info) => GroupEncryptionStatus {
                group_id: self.group_id.clone(),
                is_healthy: info.is_initialized && self.last_key_error.is_none(),
                members_synced: info.member_count,
                members_total: info.member_count,
                last_activity: self.last_activity,
            },
        }
    }

    /// Record activity at `now` and push a fresh snapshot to subscribers.
    pub(crate) fn publish(&mut self, now: u64) {
        self.last_activity = self.last_activity.max(now);
        self.status.send_replace(self.snapshot());
    }

    /// Uninitialized and unobserved.
    pub(crate) fn is_idle(&self) -> bool {
        self.info.is_none() && self.status.receiver_count() == 0
    }

    /// Return to the uninitialized state.
    pub(crate) fn reset(&mut self, now: u64) {
        self.info = None;
        self.devices.clear();
        self.last_key_error = None;
        self.publish(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(member_count: usize) -> GroupEncryptionInfo {
        GroupEncryptionInfo {
            group_id: "g".into(),
            creator_id: "a".into(),
            member_count,
            key_rotation_count: 0,
            last_key_rotation: 10,
            created_at: 10,
            is_initialized: true,
        }
    }

    #[test]
    fn uninitialized_slot_is_unhealthy() {
        let slot = GroupSlot::new("g".into());
        let status = slot.snapshot();
        assert!(!status.is_healthy);
        assert_eq!(status.members_total, 0);
    }

    #[test]
    fn key_error_marks_unhealthy() {
        let mut slot = GroupSlot::new("g".into());
        slot.info = Some(info(3));
        assert!(slot.snapshot().is_healthy);

        slot.last_key_error = Some(20);
        let status = slot.snapshot();
        assert!(!status.is_healthy);
        assert_eq!(status.members_synced, 3);
    }

    #[test]
    fn publish_reaches_subscribers() {
        let mut slot = GroupSlot::new("g".into());
        let rx = slot.subscribe();

        slot.info = Some(info(2));
        slot.publish(42);

        let status = rx.borrow().clone();
        assert!(status.is_healthy);
        assert_eq!(status.last_activity, 42);
    }

    #[test]
    fn idle_means_uninitialized_and_unobserved() {
        let mut slot = GroupSlot::new("g".into());
        assert!(slot.is_idle());

        let rx = slot.subscribe();
        assert!(!slot.is_idle());
        drop(rx);

        slot.info = Some(info(1));
        assert!(!slot.is_idle());
    }

    #[test]
    fn untracked_member_uses_default_device() {
        let mut slot = GroupSlot::new("g".into());
        assert_eq!(slot.devices_of(&"a".into()), vec![DEFAULT_DEVICE_ID]);

        slot.track(&"a".into(), DeviceId(2));
        slot.track(&"a".into(), DeviceId(5));
        assert_eq!(slot.devices_of(&"a".into()), vec![DeviceId(2), DeviceId(5)]);
    }
}
