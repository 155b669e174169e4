//! Relay layouts for tree and mesh fan-out.
//!
//! The sender is the implicit root. Recipients, already in optimized order,
//! fill a k-ary tree breadth first: the first `k` are the sender's children,
//! the next `k²` their children, and so on. Level `d` is dispatched once
//! level `d - 1` has resolved, so a relay is only named after it received
//! the message itself.

use std::collections::HashSet;

use crate::types::UserId;

/// One planned send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSend {
    /// Final recipient
    pub recipient: UserId,
    /// Forwarding member, `None` for a direct send
    pub relay_via: Option<UserId>,
    /// Tree depth of the recipient, 0 for direct sends
    pub hop: u32,
}

impl PlannedSend {
    /// A send straight from the sender.
    pub fn direct(recipient: UserId) -> Self {
        Self { recipient, relay_via: None, hop: 0 }
    }
}

/// Split recipients into tree levels of sizes `k, k², k³, ...`.
///
/// `fanout` below 2 is treated as 2.
pub fn tree_levels(recipients: &[UserId], fanout: usize) -> Vec<&[UserId]> {
    let fanout = fanout.max(2);
    let mut levels = Vec::new();
    let mut start = 0;
    let mut width = fanout;

    while start < recipients.len() {
        let end = start.saturating_add(width).min(recipients.len());
        levels.push(&recipients[start..end]);
        start = end;
        width = width.saturating_mul(fanout);
    }
    levels
}

/// Sends for one tree level with fixed parents.
///
/// Child `c` of `level` is forwarded by `parents[c / fanout]`. If that parent
/// was not delivered the child falls back to a direct send.
pub fn fixed_relays(
    level: &[UserId],
    parents: &[UserId],
    delivered: &HashSet<UserId>,
    fanout: usize,
    hop: u32,
) -> Vec<PlannedSend> {
    let fanout = fanout.max(2);
    level
        .iter()
        .enumerate()
        .map(|(index, recipient)| match parents.get(index / fanout) {
            Some(parent) if delivered.contains(parent) => PlannedSend {
                recipient: recipient.clone(),
                relay_via: Some(parent.clone()),
                hop,
            },
            _ => PlannedSend::direct(recipient.clone()),
        })
        .collect()
}

/// Sends for one mesh level with round-robin relays.
///
/// Children are dealt over the delivered `relays` in turn, at most `fanout`
/// per relay. Children left over once every relay is full go direct.
pub fn round_robin_relays(
    level: &[UserId],
    relays: &[UserId],
    fanout: usize,
    hop: u32,
) -> Vec<PlannedSend> {
    let fanout = fanout.max(2);
    let capacity = relays.len().saturating_mul(fanout);

    level
        .iter()
        .enumerate()
        .map(|(index, recipient)| {
            if index < capacity {
                PlannedSend {
                    recipient: recipient.clone(),
                    relay_via: Some(relays[index % relays.len()].clone()),
                    hop,
                }
            } else {
                PlannedSend::direct(recipient.clone())
            }
        })
        .collect()
}
