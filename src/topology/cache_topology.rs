//! Versioned, immutable cache topology snapshots.

use crate::error::{Result, TopologyError};
use crate::topology::consistent_hash::ConsistentHash;
use crate::types::{Address, SegmentId, TopologyId};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Rebalance phase of a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Only the current hash is in use.
    NoRebalance,
    /// State is moving towards the pending hash.
    Rebalancing,
    /// State is being pulled to reconcile divergent copies after a merge.
    ConflictResolution,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::NoRebalance => write!(f, "no_rebalance"),
            Phase::Rebalancing => write!(f, "rebalancing"),
            Phase::ConflictResolution => write!(f, "conflict_resolution"),
        }
    }
}

/// A topology snapshot. Never mutated: a newer topology replaces it.
#[derive(Clone, PartialEq, Eq)]
pub struct CacheTopology {
    topology_id: TopologyId,
    rebalance_id: i32,
    current_ch: Arc<ConsistentHash>,
    pending_ch: Option<Arc<ConsistentHash>>,
    union_ch: Option<Arc<ConsistentHash>>,
    phase: Phase,
    actual_members: Vec<Address>,
    persistent_uuids: Vec<Uuid>,
}

impl CacheTopology {
    /// Start building a topology.
    pub fn builder(
        topology_id: TopologyId,
        rebalance_id: i32,
        current_ch: impl Into<Arc<ConsistentHash>>,
    ) -> CacheTopologyBuilder {
        CacheTopologyBuilder {
            topology_id,
            rebalance_id,
            current_ch: current_ch.into(),
            pending_ch: None,
            phase: Phase::NoRebalance,
            actual_members: None,
            persistent_uuids: Vec::new(),
        }
    }

    /// Topology id.
    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Rebalance id.
    pub fn rebalance_id(&self) -> i32 {
        self.rebalance_id
    }

    /// The current hash.
    pub fn current_ch(&self) -> &Arc<ConsistentHash> {
        &self.current_ch
    }

    /// The pending hash, present iff the phase is not `NoRebalance`.
    pub fn pending_ch(&self) -> Option<&Arc<ConsistentHash>> {
        self.pending_ch.as_ref()
    }

    /// Rebalance phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Members known to the cache, a superset of the current hash members.
    pub fn actual_members(&self) -> &[Address] {
        &self.actual_members
    }

    /// Persistent ids aligned with [`Self::actual_members`]; empty when unknown.
    pub fn persistent_uuids(&self) -> &[Uuid] {
        &self.persistent_uuids
    }

    /// Members of the current hash.
    pub fn members(&self) -> &[Address] {
        self.current_ch.members()
    }

    /// Whether the address is one of the actual members.
    pub fn is_member(&self, address: &Address) -> bool {
        self.actual_members.contains(address)
    }

    /// Persistent id of a member.
    pub fn persistent_uuid_for(&self, address: &Address) -> Option<Uuid> {
        self.actual_members
            .iter()
            .position(|m| m == address)
            .and_then(|i| self.persistent_uuids.get(i).copied())
    }

    /// Hash used to serve reads.
    pub fn read_consistent_hash(&self) -> &Arc<ConsistentHash> {
        &self.current_ch
    }

    /// Hash used for writes: current and pending owners while rebalancing.
    pub fn write_consistent_hash(&self) -> &Arc<ConsistentHash> {
        self.union_ch.as_ref().unwrap_or(&self.current_ch)
    }

    /// Whether `address` should receive writes for `segment`.
    pub fn is_write_owner(&self, address: &Address, segment: SegmentId) -> bool {
        self.write_consistent_hash().is_segment_local_to(address, segment)
    }
}

impl fmt::Debug for CacheTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTopology")
            .field("topology_id", &self.topology_id)
            .field("rebalance_id", &self.rebalance_id)
            .field("phase", &self.phase)
            .field("current", &self.current_ch.members())
            .field("pending", &self.pending_ch.as_ref().map(|ch| ch.members()))
            .field("actual_members", &self.actual_members)
            .finish()
    }
}

/// Builder for [`CacheTopology`].
#[derive(Debug)]
pub struct CacheTopologyBuilder {
    topology_id: TopologyId,
    rebalance_id: i32,
    current_ch: Arc<ConsistentHash>,
    pending_ch: Option<Arc<ConsistentHash>>,
    phase: Phase,
    actual_members: Option<Vec<Address>>,
    persistent_uuids: Vec<Uuid>,
}

impl CacheTopologyBuilder {
    /// Set the pending hash and phase together.
    pub fn pending(mut self, pending_ch: impl Into<Arc<ConsistentHash>>, phase: Phase) -> Self {
        self.pending_ch = Some(pending_ch.into());
        self.phase = phase;
        self
    }

    /// Set the actual members. Defaults to the current hash members.
    pub fn actual_members(mut self, members: Vec<Address>) -> Self {
        self.actual_members = Some(members);
        self
    }

    /// Set the persistent ids.
    pub fn persistent_uuids(mut self, uuids: Vec<Uuid>) -> Self {
        self.persistent_uuids = uuids;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<CacheTopology> {
        let actual_members = self
            .actual_members
            .unwrap_or_else(|| self.current_ch.members().to_vec());

        match (&self.pending_ch, self.phase) {
            (None, Phase::NoRebalance) | (Some(_), Phase::Rebalancing | Phase::ConflictResolution) => {}
            (None, phase) => {
                return Err(invalid(format!("phase {} requires a pending hash", phase)));
            }
            (Some(_), Phase::NoRebalance) => {
                return Err(invalid("pending hash present without rebalance"));
            }
        }

        if let Some(missing) = self
            .current_ch
            .members()
            .iter()
            .find(|m| !actual_members.contains(m))
        {
            return Err(invalid(format!(
                "current hash member {} is not an actual member",
                missing
            )));
        }

        if !self.persistent_uuids.is_empty() && self.persistent_uuids.len() != actual_members.len()
        {
            return Err(invalid(format!(
                "{} persistent ids for {} members",
                self.persistent_uuids.len(),
                actual_members.len()
            )));
        }

        let union_ch = match &self.pending_ch {
            Some(pending) => Some(Arc::new(self.current_ch.union(pending)?)),
            None => None,
        };

        Ok(CacheTopology {
            topology_id: self.topology_id,
            rebalance_id: self.rebalance_id,
            current_ch: self.current_ch,
            pending_ch: self.pending_ch,
            union_ch,
            phase: self.phase,
            actual_members,
            persistent_uuids: self.persistent_uuids,
        })
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::Error {
    TopologyError::InvalidTopology(reason.into()).into()
}
