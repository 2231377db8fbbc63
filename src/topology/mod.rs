//! Segment ownership and versioned cache topologies.
//!
//! ```text
//!                  ┌────────────────────────┐
//!  membership ───► │  ClusterCacheStatus    │  (coordinator, one per cache)
//!  events          │  strategy + factory    │
//!                  └───────────┬────────────┘
//!                              │ publishes Arc<CacheTopology>
//!                              ▼
//!                  ┌────────────────────────┐
//!                  │  TopologyHolder        │  (every node, one per cache)
//!                  │  current: topology N   │
//!                  └───────────┬────────────┘
//!                              │
//!             read CH = current_ch, write CH = current ∪ pending
//! ```
//!
//! Consistent hashes are immutable. Every membership change produces a new
//! hash through a [`ConsistentHashFactory`] and a new topology with a higher
//! id.

mod cache_topology;
mod consistent_hash;
mod coordinator;
mod hashring;
mod holder;

pub use cache_topology::{CacheTopology, CacheTopologyBuilder, Phase};
pub use consistent_hash::{ConsistentHash, ConsistentHashFactory, RingConsistentHashFactory};
pub use coordinator::{ClusterCacheStatus, RebalanceConfirmation};
pub use hashring::{hash_bytes, HashRing, KeyPartitioner, DEFAULT_VNODES_PER_NODE};
pub use holder::TopologyHolder;
