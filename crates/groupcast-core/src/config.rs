//! Tunables for each component. Every struct has production defaults.

use std::time::Duration;

use crate::types::{DEFAULT_DEVICE_ID, DeviceId, NetworkConditions};

/// Rotation ceiling applied to every group.
pub const MAX_KEY_ROTATIONS: u32 = 1000;

/// [`crate::GroupEncryptionManager`] configuration.
#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    /// Rotations allowed per group before add/remove/rotate are refused
    pub max_key_rotations: u32,
    /// Number of lock stripes serializing load-modify-store on sender keys
    pub key_lock_stripes: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self { max_key_rotations: MAX_KEY_ROTATIONS, key_lock_stripes: 64 }
    }
}

/// [`crate::GroupMessageDistributor`] configuration.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Device the sender encrypts as
    pub sender_device_id: DeviceId,
    /// Deadline for a single transport send
    pub send_timeout: Duration,
    /// Children per relay in tree and mesh topologies
    pub tree_fanout: usize,
    /// Recipients per mesh cluster
    pub mesh_cluster_size: usize,
    /// Conditions handed to the optimizer when sizing batches
    pub network_conditions: NetworkConditions,
    /// Current throughput handed to the optimizer when computing rate limits
    pub current_throughput: f64,
    /// Target share of capacity handed to the optimizer
    pub target_utilization: f64,
    /// How long a finished distribution stays queryable before it expires
    pub result_retention: Duration,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            sender_device_id: DEFAULT_DEVICE_ID,
            send_timeout: Duration::from_secs(5),
            tree_fanout: 8,
            mesh_cluster_size: 1000,
            network_conditions: NetworkConditions::default(),
            current_throughput: 0.0,
            target_utilization: 0.8,
            result_retention: Duration::from_secs(600),
        }
    }
}

/// [`crate::MessageDeliveryOptimizer`] configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Smallest batch ever returned
    pub min_batch_size: usize,
    /// Largest batch ever returned
    pub max_batch_size: usize,
    /// Batch size under reference conditions
    pub base_batch_size: usize,
    /// Bandwidth at which `base_batch_size` applies, in kbit/s
    pub reference_bandwidth_kbps: f64,
    /// Peer count at which `base_batch_size` applies
    pub reference_peer_count: usize,
    /// Concurrent sends allowed with no load
    pub max_concurrent_deliveries: usize,
    /// Send capacity in messages per second with no load
    pub max_messages_per_second: u32,
    /// Pause between batches when unthrottled
    pub base_batch_delay: Duration,
    /// Upper bound on remembered peers
    pub max_tracked_peers: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 10,
            max_batch_size: 1000,
            base_batch_size: 100,
            reference_bandwidth_kbps: 10_000.0,
            reference_peer_count: 10,
            max_concurrent_deliveries: 256,
            max_messages_per_second: 5000,
            base_batch_delay: Duration::from_millis(10),
            max_tracked_peers: 200_000,
        }
    }
}

/// [`crate::GroupHistoryManager`] configuration.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Messages requested per repository read
    pub page_size: usize,
    /// Messages delivered to a new member at most
    pub max_history_messages: usize,
    /// Deadline for a single page read
    pub page_timeout: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { page_size: 500, max_history_messages: 100_000, page_timeout: Duration::from_secs(10) }
    }
}
