//! Conflict resolution after partitions merge.
//!
//! When a split heals, the availability strategy hands a [`MergeInfo`] to
//! the cache's [`ConflictManager`]. The manager pulls every copy of every
//! segment (state responses with `apply_state = false` are routed to its
//! [`StateReceiver`]), merges diverging copies with a [`MergePolicy`], and
//! writes the winners back to the owners.

mod manager;
mod policy;

pub use manager::DefaultConflictManager;
pub use policy::{EntryMergePolicy, MergePolicy};

use crate::error::Result;
use crate::statetransfer::StateChunk;
use crate::topology::{CacheTopology, ConsistentHash};
use crate::types::{Address, TopologyId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a merge hands to conflict resolution.
#[derive(Debug, Clone)]
pub struct MergeInfo {
    /// Id of the merged topology; resolution traffic is stamped with it.
    pub topology_id: TopologyId,

    /// Hash of the preferred partition. Its primary owners hold the
    /// preferred copies.
    pub consistent_hash: Arc<ConsistentHash>,

    /// Stable topology reported by each node of the preferred partition.
    pub partitions: BTreeMap<Address, Arc<CacheTopology>>,

    /// Every member expected after the merge.
    pub members: Vec<Address>,
}

/// Receives state pulled for conflict resolution.
#[async_trait::async_trait]
pub trait StateReceiver: Send + Sync + std::fmt::Debug {
    /// Buffer chunks sent by `origin` for the resolution of `topology_id`.
    async fn receive_state(
        &self,
        origin: &Address,
        topology_id: TopologyId,
        chunks: Vec<StateChunk>,
    ) -> Result<()>;
}

/// Per-cache conflict resolution service.
pub trait ConflictManager: Send + Sync + std::fmt::Debug {
    /// Where conflict resolution state responses are delivered.
    fn state_receiver(&self) -> Arc<dyn StateReceiver>;

    /// Start resolving conflicts. Returns immediately; the work runs in the
    /// background.
    fn resolve_conflicts(&self, merge_info: MergeInfo);
}
