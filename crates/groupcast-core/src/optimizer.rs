//! Message Delivery Optimizer
//!
//! Pure in-memory heuristics for fan-out: recipient ordering from cached peer
//! metrics, batch sizing from network conditions, and rate limits from
//! observed throughput. Nothing here touches the network, and every
//! operation is at most O(N log N) in the recipient count.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    config::OptimizerConfig,
    types::{NetworkConditions, UserId},
};

/// Sending limits derived from load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sends allowed in flight at once, always > 0
    pub max_concurrent_deliveries: usize,
    /// Sustained send rate
    pub max_messages_per_second: u32,
    /// Pause between consecutive batches
    pub batch_delay: Duration,
}

/// Cached connectivity of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerMetrics {
    /// Last observed round-trip latency
    pub latency: Duration,
    /// Whether the last contact succeeded
    pub connected: bool,
}

/// Delivery ordering, batching and rate limiting.
#[derive(Debug)]
pub struct MessageDeliveryOptimizer {
    config: OptimizerConfig,
    peers: RwLock<HashMap<UserId, PeerMetrics>>,
}

impl MessageDeliveryOptimizer {
    /// Create an optimizer with no cached peer metrics.
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config, peers: RwLock::new(HashMap::new()) }
    }

    /// Configuration in use.
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Remember a peer's latency and reachability.
    ///
    /// Known peers are always updated. New peers are ignored once
    /// `max_tracked_peers` are cached.
    pub fn record_peer_metrics(&self, user_id: &UserId, latency: Duration, connected: bool) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let metrics = PeerMetrics { latency, connected };

        if let Some(existing) = peers.get_mut(user_id) {
            *existing = metrics;
        } else if peers.len() < self.config.max_tracked_peers {
            peers.insert(user_id.clone(), metrics);
        }
    }

    /// Cached metrics for a peer.
    pub fn peer_metrics(&self, user_id: &UserId) -> Option<PeerMetrics> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).get(user_id).copied()
    }

    /// Reorder recipients for delivery.
    ///
    /// Connected peers come first, lowest latency first with ties broken by
    /// id. Peers without metrics follow in their given order. Peers last seen
    /// disconnected go last, by id. The output is a permutation of the input.
    pub fn optimize_delivery_order(&self, recipients: &[UserId], message: &[u8]) -> Vec<UserId> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);

        let mut connected = Vec::new();
        let mut unknown = Vec::new();
        let mut disconnected = Vec::new();

        for recipient in recipients {
            match peers.get(recipient) {
                Some(metrics) if metrics.connected => connected.push((metrics.latency, recipient)),
                Some(_) => disconnected.push(recipient),
                None => unknown.push(recipient),
            }
        }
        drop(peers);

        connected.sort_by(|(a_latency, a_id), (b_latency, b_id)| {
            a_latency.cmp(b_latency).then_with(|| a_id.cmp(b_id))
        });
        disconnected.sort();

        tracing::trace!(
            recipients = recipients.len(),
            connected = connected.len(),
            unknown = unknown.len(),
            message_len = message.len(),
            "Delivery order computed"
        );

        let mut ordered = Vec::with_capacity(recipients.len());
        ordered.extend(connected.into_iter().map(|(_, id)| id.clone()));
        ordered.extend(unknown.into_iter().cloned());
        ordered.extend(disconnected.into_iter().cloned());
        ordered
    }

    /// Batch size for `recipient_count` recipients under `conditions`.
    ///
    /// Shrinks with lower bandwidth, lower stability and higher loss; grows
    /// with peer count. Clamped to the configured range, then to
    /// `[1, recipient_count]`.
    pub fn calculate_optimal_batch_size(
        &self,
        recipient_count: usize,
        conditions: &NetworkConditions,
    ) -> usize {
        let bandwidth = sanitize(conditions.bandwidth_kbps, self.config.reference_bandwidth_kbps)
            / self.config.reference_bandwidth_kbps.max(1.0);
        let bandwidth_factor = bandwidth.clamp(0.1, 4.0);

        let loss = sanitize(conditions.packet_loss, 0.0).clamp(0.0, 1.0);
        let loss_factor = (1.0 - loss).powi(2).max(0.05);

        let stability_factor = sanitize(conditions.connection_stability, 1.0).clamp(0.1, 1.0);

        let peers = conditions.peer_count.max(1) as f64;
        let reference_peers = self.config.reference_peer_count.max(1) as f64;
        let peer_factor = (peers / reference_peers).sqrt().clamp(0.5, 2.0);

        let raw = self.config.base_batch_size as f64
            * bandwidth_factor
            * loss_factor
            * stability_factor
            * peer_factor;

        let min = self.config.min_batch_size.max(1);
        let max = self.config.max_batch_size.max(min);
        let size = (raw.round() as usize).clamp(min, max);

        size.min(recipient_count).max(1)
    }

    /// Rate limit for the given load.
    ///
    /// `target_utilization` is the share of capacity (0, 1] the sender aims
    /// for. While `current_throughput` stays under that target the full
    /// concurrency is granted; above it, concurrency and rate shrink in
    /// proportion and the batch delay grows.
    pub fn apply_rate_limiting(&self, current_throughput: f64, target_utilization: f64) -> RateLimit {
        let capacity = f64::from(self.config.max_messages_per_second.max(1));
        let target = capacity * sanitize(target_utilization, 1.0).clamp(0.05, 1.0);
        let current = sanitize(current_throughput, 0.0).max(0.0);

        let headroom = match current.partial_cmp(&target) {
            Some(Ordering::Greater) => (target / current).clamp(0.05, 1.0),
            _ => 1.0,
        };

        let max_concurrent_deliveries =
            ((self.config.max_concurrent_deliveries as f64 * headroom).ceil() as usize).max(1);
        let max_messages_per_second = ((target * headroom).round() as u32).max(1);
        let batch_delay = self.config.base_batch_delay.mul_f64(1.0 / headroom);

        RateLimit { max_concurrent_deliveries, max_messages_per_second, batch_delay }
    }
}

impl Default for MessageDeliveryOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

fn sanitize(value: f64, fallback: f64) -> f64 {
    if value.is_finite() { value } else { fallback }
}
