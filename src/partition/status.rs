use crate::partition::context::AvailabilityMode;
use crate::topology::CacheTopology;
use std::sync::Arc;

/// What a node reports about a cache when partitions merge.
#[derive(Debug, Clone, Default)]
pub struct CacheStatusResponse {
    /// Last stable topology the node saw.
    pub stable_topology: Option<Arc<CacheTopology>>,

    /// Topology the node has installed.
    pub current_topology: Option<Arc<CacheTopology>>,

    /// The node's availability mode.
    pub availability_mode: AvailabilityMode,
}

impl CacheStatusResponse {
    /// Create a response.
    pub fn new(
        stable_topology: Option<Arc<CacheTopology>>,
        current_topology: Option<Arc<CacheTopology>>,
        availability_mode: AvailabilityMode,
    ) -> Self {
        Self {
            stable_topology,
            current_topology,
            availability_mode,
        }
    }
}
