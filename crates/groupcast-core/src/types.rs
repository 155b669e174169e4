//! Identifiers and data model shared by every component.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Device used when a caller does not name one.
pub const DEFAULT_DEVICE_ID: DeviceId = DeviceId(1);

/// Current [`SenderKeyDistributionMessage`] format version.
pub const DISTRIBUTION_MESSAGE_VERSION: u8 = 1;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an opaque id.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque group (chat) identifier.
    GroupId
);

string_id!(
    /// Opaque user identifier.
    UserId
);

/// Device identifier within one user's account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one fan-out run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DistributionId(pub u128);

impl fmt::Display for DistributionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Key under which one sender key record lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SenderKeyIdentity {
    /// Group the key encrypts for
    pub group_id: GroupId,
    /// Owner of the key
    pub sender_id: UserId,
    /// Owner's device
    pub device_id: DeviceId,
}

impl SenderKeyIdentity {
    /// Build an identity.
    pub fn new(group_id: GroupId, sender_id: UserId, device_id: DeviceId) -> Self {
        Self { group_id, sender_id, device_id }
    }
}

impl fmt::Display for SenderKeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group_id, self.sender_id, self.device_id)
    }
}

/// Context handed to the encryption service: which identity's key to use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncryptionContext {
    /// Group the message belongs to
    pub group_id: GroupId,
    /// Sending user
    pub sender_id: UserId,
    /// Sending device
    pub device_id: DeviceId,
}

impl EncryptionContext {
    /// Build a context.
    pub fn new(group_id: GroupId, sender_id: UserId, device_id: DeviceId) -> Self {
        Self { group_id, sender_id, device_id }
    }

    /// Identity whose sender key this context selects.
    pub fn identity(&self) -> SenderKeyIdentity {
        SenderKeyIdentity::new(self.group_id.clone(), self.sender_id.clone(), self.device_id)
    }

    /// Length-prefixed encoding bound into the AEAD associated data.
    pub fn associated_data(&self) -> Vec<u8> {
        let group = self.group_id.as_str().as_bytes();
        let sender = self.sender_id.as_str().as_bytes();

        let mut aad = Vec::with_capacity(group.len() + sender.len() + 12);
        aad.extend_from_slice(&(group.len() as u32).to_be_bytes());
        aad.extend_from_slice(group);
        aad.extend_from_slice(&(sender.len() as u32).to_be_bytes());
        aad.extend_from_slice(sender);
        aad.extend_from_slice(&self.device_id.0.to_be_bytes());
        aad
    }
}

/// Per-group encryption metadata owned by the encryption manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEncryptionInfo {
    /// Group this metadata describes
    pub group_id: GroupId,
    /// User that initialized the group
    pub creator_id: UserId,
    /// Number of members the manager believes are in the group
    pub member_count: usize,
    /// Number of rotations since initialization (never decreases)
    pub key_rotation_count: u32,
    /// Wall-clock millis of the last rotation (initialization counts)
    pub last_key_rotation: u64,
    /// Wall-clock millis of initialization
    pub created_at: u64,
    /// Always true while the metadata exists
    pub is_initialized: bool,
}

/// Derived, read-only health snapshot of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEncryptionStatus {
    /// Group this status describes
    pub group_id: GroupId,
    /// Initialized and no key error observed since the last rotation
    pub is_healthy: bool,
    /// Members holding current key material
    pub members_synced: usize,
    /// Members in the group
    pub members_total: usize,
    /// Wall-clock millis of the last mutation or key error
    pub last_activity: u64,
}

impl GroupEncryptionStatus {
    /// Status of a group with no encryption state.
    pub fn uninitialized(group_id: GroupId) -> Self {
        Self { group_id, is_healthy: false, members_synced: 0, members_total: 0, last_activity: 0 }
    }
}

/// Out-of-band envelope carrying one sender's current key to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistributionMessage {
    /// Group the key encrypts for
    pub group_id: GroupId,
    /// Key owner
    pub sender_id: UserId,
    /// Key owner's device
    pub device_id: DeviceId,
    /// CBOR-encoded key material
    pub distribution_data: Bytes,
    /// Wall-clock millis when produced
    pub timestamp: u64,
    /// Format version
    pub version: u8,
}

impl SenderKeyDistributionMessage {
    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buf = Vec::with_capacity(self.distribution_data.len() + 64);
        ciborium::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}

/// Group as returned by the chat repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    /// Chat id (same as the group id)
    pub id: GroupId,
    /// Display name
    pub name: String,
    /// All members, admins included
    pub participants: Vec<UserId>,
    /// Members with admin rights
    pub admins: Vec<UserId>,
    /// Wall-clock millis of creation
    pub created_at: u64,
}

/// Backlog message as returned by the message repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message id
    pub id: String,
    /// Chat the message belongs to
    pub chat_id: GroupId,
    /// Author
    pub sender_id: UserId,
    /// Stored payload
    pub content: Bytes,
    /// Wall-clock millis when sent
    pub timestamp: u64,
}

/// Network conditions supplied to the optimizer per call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConditions {
    /// Available bandwidth in kbit/s
    pub bandwidth_kbps: f64,
    /// Round-trip latency in milliseconds
    pub latency_ms: f64,
    /// Packet loss ratio in `[0, 1]`
    pub packet_loss: f64,
    /// Connection stability in `[0, 1]`
    pub connection_stability: f64,
    /// Number of reachable peers
    pub peer_count: usize,
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self {
            bandwidth_kbps: 10_000.0,
            latency_ms: 50.0,
            packet_loss: 0.0,
            connection_stability: 1.0,
            peer_count: 10,
        }
    }
}
