//! Unicast delivery primitive.
//!
//! The distributor hands one [`DeliveryEnvelope`] per recipient to a
//! [`Transport`]. Whether the envelope travels through a ledger or directly
//! between peers is the transport's concern; relay hints let a peer-to-peer
//! transport forward through already-delivered members.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    error::TransportError,
    types::{DistributionId, GroupId, UserId},
};

/// Ciphertext addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    /// Fan-out run this envelope belongs to
    pub distribution_id: DistributionId,
    /// Group the message was sent to
    pub group_id: GroupId,
    /// Author
    pub sender_id: UserId,
    /// Final recipient
    pub recipient_id: UserId,
    /// Member expected to forward the envelope, `None` for a direct send
    pub relay_via: Option<UserId>,
    /// Depth in the relay tree, 0 for direct sends and tree roots
    pub hop: u32,
    /// CBOR-encoded [`groupcast_crypto::EncryptedGroupMessage`]
    pub ciphertext: Bytes,
}

/// Receipt for an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    /// Transport-assigned delivery id
    pub delivery_id: String,
}

/// Sends envelopes to recipients.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Send one envelope. Returns once the transport accepted it.
    async fn send(&self, envelope: DeliveryEnvelope) -> Result<DeliveryHandle, TransportError>;
}
