//! Fan-out strategy tiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Recipient counts below this are sent directly.
pub const DIRECT_THRESHOLD: usize = 100;

/// Recipient counts below this are sent in batches.
pub const BATCHED_THRESHOLD: usize = 1_000;

/// Recipient counts below this use tree routing; larger ones use the mesh.
pub const TREE_ROUTING_THRESHOLD: usize = 10_000;

/// Fan-out algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionStrategy {
    /// Every recipient concurrently
    Direct,
    /// Sequential batches sized by the optimizer
    Batched,
    /// Level-by-level k-ary relay tree
    TreeRouting,
    /// Concurrent clusters, each its own relay tree
    HybridMesh,
}

impl DistributionStrategy {
    /// Tier for `recipient_count`.
    pub fn for_recipient_count(recipient_count: usize) -> Self {
        match recipient_count {
            n if n < DIRECT_THRESHOLD => Self::Direct,
            n if n < BATCHED_THRESHOLD => Self::Batched,
            n if n < TREE_ROUTING_THRESHOLD => Self::TreeRouting,
            _ => Self::HybridMesh,
        }
    }
}

impl fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "DIRECT",
            Self::Batched => "BATCHED",
            Self::TreeRouting => "TREE_ROUTING",
            Self::HybridMesh => "HYBRID_MESH",
        })
    }
}
