//! Simulated transports.
//!
//! [`LedgerTransport`] appends every accepted envelope to an ordered ledger,
//! standing in for a server-relayed path. [`PeerTransport`] models direct
//! peer delivery and checks relay hints: an envelope may only name a relay
//! that already holds the same distribution.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use groupcast_core::{
    DeliveryEnvelope, DeliveryHandle, DistributionId, Transport, TransportError, UserId,
};

use crate::faults::{FaultDecision, FaultInjector};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append-only ledger transport.
#[derive(Debug, Default)]
pub struct LedgerTransport {
    faults: FaultInjector,
    ledger: Mutex<Vec<DeliveryEnvelope>>,
    next_id: AtomicU64,
}

impl LedgerTransport {
    /// Transport with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport failing as `faults` dictates.
    pub fn with_faults(faults: FaultInjector) -> Self {
        Self { faults, ..Self::default() }
    }

    /// Fault controls.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Number of accepted envelopes.
    pub fn len(&self) -> usize {
        lock(&self.ledger).len()
    }

    /// Whether nothing has been accepted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the ledger in acceptance order.
    pub fn envelopes(&self) -> Vec<DeliveryEnvelope> {
        lock(&self.ledger).clone()
    }

    /// Accepted envelopes addressed to `user`.
    pub fn deliveries_to(&self, user: &UserId) -> usize {
        lock(&self.ledger).iter().filter(|e| &e.recipient_id == user).count()
    }

    /// Distinct recipients that received anything.
    pub fn distinct_recipients(&self) -> HashSet<UserId> {
        lock(&self.ledger).iter().map(|e| e.recipient_id.clone()).collect()
    }
}

#[async_trait]
impl Transport for LedgerTransport {
    fn name(&self) -> &'static str {
        "ledger"
    }

    async fn send(&self, envelope: DeliveryEnvelope) -> Result<DeliveryHandle, TransportError> {
        let delay = match self.faults.decide(&envelope.recipient_id) {
            FaultDecision::Fail => return Err(FaultInjector::error_for(&envelope.recipient_id)),
            FaultDecision::Deliver(delay) => delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.ledger).push(envelope);
        Ok(DeliveryHandle { delivery_id: format!("ledger-{id}") })
    }
}

#[derive(Debug, Default)]
struct PeerState {
    received: HashMap<DistributionId, HashSet<UserId>>,
    relay_load: HashMap<(DistributionId, UserId), usize>,
    max_hop: u32,
    relayed: usize,
    direct: usize,
}

/// Peer-to-peer transport that validates relay hints.
#[derive(Debug, Default)]
pub struct PeerTransport {
    faults: FaultInjector,
    state: Mutex<PeerState>,
    next_id: AtomicU64,
}

impl PeerTransport {
    /// Transport with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport failing as `faults` dictates.
    pub fn with_faults(faults: FaultInjector) -> Self {
        Self { faults, ..Self::default() }
    }

    /// Fault controls.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Recipients holding `distribution_id`.
    pub fn received(&self, distribution_id: DistributionId) -> usize {
        lock(&self.state).received.get(&distribution_id).map_or(0, HashSet::len)
    }

    /// Whether `user` holds `distribution_id`.
    pub fn has_received(&self, distribution_id: DistributionId, user: &UserId) -> bool {
        lock(&self.state).received.get(&distribution_id).is_some_and(|r| r.contains(user))
    }

    /// Most envelopes any single relay forwarded for one distribution.
    pub fn max_relay_load(&self) -> usize {
        lock(&self.state).relay_load.values().copied().max().unwrap_or(0)
    }

    /// Deepest hop accepted.
    pub fn max_hop(&self) -> u32 {
        lock(&self.state).max_hop
    }

    /// Accepted envelopes that named a relay.
    pub fn relayed(&self) -> usize {
        lock(&self.state).relayed
    }

    /// Accepted envelopes sent straight from the sender.
    pub fn direct(&self) -> usize {
        lock(&self.state).direct
    }
}

#[async_trait]
impl Transport for PeerTransport {
    fn name(&self) -> &'static str {
        "peer"
    }

    async fn send(&self, envelope: DeliveryEnvelope) -> Result<DeliveryHandle, TransportError> {
        if let Some(relay) = &envelope.relay_via {
            let holds = lock(&self.state)
                .received
                .get(&envelope.distribution_id)
                .is_some_and(|r| r.contains(relay));
            if !holds {
                return Err(TransportError::Rejected(format!(
                    "relay {relay} does not hold distribution {}",
                    envelope.distribution_id
                )));
            }
        }

        let delay = match self.faults.decide(&envelope.recipient_id) {
            FaultDecision::Fail => return Err(FaultInjector::error_for(&envelope.recipient_id)),
            FaultDecision::Deliver(delay) => delay,
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.received.entry(envelope.distribution_id).or_default().insert(envelope.recipient_id);
        state.max_hop = state.max_hop.max(envelope.hop);
        match envelope.relay_via {
            Some(relay) => {
                state.relayed += 1;
                *state.relay_load.entry((envelope.distribution_id, relay)).or_default() += 1;
            },
            None => state.direct += 1,
        }
        drop(state);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(DeliveryHandle { delivery_id: format!("peer-{id}") })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn envelope(recipient: &str, relay: Option<&str>) -> DeliveryEnvelope {
        DeliveryEnvelope {
            distribution_id: DistributionId(1),
            group_id: "g".into(),
            sender_id: "s".into(),
            recipient_id: recipient.into(),
            relay_via: relay.map(UserId::from),
            hop: u32::from(relay.is_some()),
            ciphertext: Bytes::from_static(b"c"),
        }
    }

    #[tokio::test]
    async fn ledger_keeps_acceptance_order() {
        let transport = LedgerTransport::new();
        transport.send(envelope("a", None)).await.unwrap();
        transport.send(envelope("b", None)).await.unwrap();

        let recipients: Vec<UserId> =
            transport.envelopes().into_iter().map(|e| e.recipient_id).collect();
        assert_eq!(recipients, vec![UserId::from("a"), UserId::from("b")]);
    }

    #[tokio::test]
    async fn ledger_rejects_unreachable() {
        let transport = LedgerTransport::new();
        transport.faults().make_unreachable(&"a".into());

        assert!(transport.send(envelope("a", None)).await.is_err());
        assert!(transport.is_empty());
    }

    #[tokio::test]
    async fn peer_requires_relay_to_hold_message() {
        let transport = PeerTransport::new();

        assert!(transport.send(envelope("child", Some("parent"))).await.is_err());

        transport.send(envelope("parent", None)).await.unwrap();
        transport.send(envelope("child", Some("parent"))).await.unwrap();

        assert_eq!(transport.received(DistributionId(1)), 2);
        assert_eq!(transport.relayed(), 1);
        assert_eq!(transport.max_relay_load(), 1);
        assert_eq!(transport.max_hop(), 1);
    }
}
