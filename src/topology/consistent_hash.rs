//! Immutable segment ownership.
//!
//! A [`ConsistentHash`] maps every segment to an ordered owner list, the
//! first owner being the primary. Topology changes never mutate a hash;
//! placement produces a new one through a [`ConsistentHashFactory`].

use crate::error::{Result, TopologyError};
use crate::topology::hashring::{HashRing, DEFAULT_VNODES_PER_NODE};
use crate::types::{Address, SegmentId, SegmentSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Segment to owners mapping.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistentHash {
    num_owners: usize,
    members: Vec<Address>,
    segment_owners: Vec<Vec<Address>>,
    requires_primary_owner: bool,
}

impl ConsistentHash {
    /// Build a hash, checking its invariants.
    ///
    /// `segment_owners.len()` is the segment count and must be positive.
    /// Every owner must be a member and appear at most once per segment.
    /// When `requires_primary_owner` is set every segment needs an owner.
    ///
    /// A member is not required to own anything. [`ConsistentHashFactory::update_members`]
    /// admits joiners without moving ownership to them, and only the following
    /// rebalance hands them segments, so members may be a strict superset of
    /// the owners.
    pub fn new(
        members: Vec<Address>,
        segment_owners: Vec<Vec<Address>>,
        num_owners: usize,
        requires_primary_owner: bool,
    ) -> Result<Self> {
        if segment_owners.is_empty() {
            return Err(invalid("segment count must be positive"));
        }

        let member_set: HashSet<&Address> = members.iter().collect();
        if member_set.len() != members.len() {
            return Err(invalid("duplicate member"));
        }

        for (segment, owners) in segment_owners.iter().enumerate() {
            if requires_primary_owner && owners.is_empty() {
                return Err(invalid(format!("segment {} has no owner", segment)));
            }
            let mut seen = HashSet::with_capacity(owners.len());
            for owner in owners {
                if !member_set.contains(owner) {
                    return Err(invalid(format!(
                        "segment {} owner {} is not a member",
                        segment, owner
                    )));
                }
                if !seen.insert(owner) {
                    return Err(invalid(format!("segment {} lists {} twice", segment, owner)));
                }
            }
        }

        Ok(Self {
            num_owners: num_owners.max(1),
            members,
            segment_owners,
            requires_primary_owner,
        })
    }

    /// A hash with no members; every segment is unowned.
    pub fn empty(num_segments: u32, num_owners: usize) -> Self {
        Self {
            num_owners: num_owners.max(1),
            members: Vec::new(),
            segment_owners: vec![Vec::new(); num_segments.max(1) as usize],
            requires_primary_owner: false,
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.segment_owners.len() as u32
    }

    /// Configured owners per segment.
    pub fn num_owners(&self) -> usize {
        self.num_owners
    }

    /// Members in order.
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Whether the member is part of this hash.
    pub fn is_member(&self, address: &Address) -> bool {
        self.members.contains(address)
    }

    /// Whether every segment must have an owner.
    pub fn requires_primary_owner(&self) -> bool {
        self.requires_primary_owner
    }

    /// Owners of a segment, primary first. Empty for an out-of-range segment.
    pub fn owners_for_segment(&self, segment: SegmentId) -> &[Address] {
        self.segment_owners
            .get(segment as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Primary owner of a segment.
    pub fn primary_owner(&self, segment: SegmentId) -> Option<&Address> {
        self.owners_for_segment(segment).first()
    }

    /// Whether `address` owns `segment`.
    pub fn is_segment_local_to(&self, address: &Address, segment: SegmentId) -> bool {
        self.owners_for_segment(segment).contains(address)
    }

    /// All segments owned by a member.
    pub fn segments_for_owner(&self, address: &Address) -> SegmentSet {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.contains(address))
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// Segments a member is the primary owner of.
    pub fn primary_segments_for_owner(&self, address: &Address) -> SegmentSet {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| owners.first() == Some(address))
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// Two hashes are equivalent when every member present in both owns
    /// exactly the same segments in each.
    pub fn is_equivalent(&self, other: &ConsistentHash) -> bool {
        if self.num_segments() != other.num_segments() {
            return false;
        }
        self.members
            .iter()
            .filter(|m| other.is_member(m))
            .all(|m| self.segments_for_owner(m) == other.segments_for_owner(m))
    }

    /// Segments none of whose owners are in `new_members`.
    ///
    /// Every segment is checked, not only those owned by departed members,
    /// because a segment may have a single owner.
    pub fn lost_segments(&self, new_members: &[Address]) -> SegmentSet {
        self.segment_owners
            .iter()
            .enumerate()
            .filter(|(_, owners)| !owners.iter().any(|o| new_members.contains(o)))
            .map(|(segment, _)| segment as SegmentId)
            .collect()
    }

    /// Whether moving to `new_members` loses every copy of some segment.
    pub fn is_data_lost(&self, new_members: &[Address]) -> bool {
        self.segment_owners
            .iter()
            .any(|owners| !owners.iter().any(|o| new_members.contains(o)))
    }

    /// Union of two hashes: members of both, and per segment the owners of
    /// `self` followed by the owners of `other` not already listed.
    pub fn union(&self, other: &ConsistentHash) -> Result<ConsistentHash> {
        if self.num_segments() != other.num_segments() {
            return Err(invalid(format!(
                "cannot union hashes with {} and {} segments",
                self.num_segments(),
                other.num_segments()
            )));
        }

        let mut members = self.members.clone();
        for m in &other.members {
            if !members.contains(m) {
                members.push(m.clone());
            }
        }

        let segment_owners = self
            .segment_owners
            .iter()
            .zip(&other.segment_owners)
            .map(|(ours, theirs)| {
                let mut owners = ours.clone();
                for o in theirs {
                    if !owners.contains(o) {
                        owners.push(o.clone());
                    }
                }
                owners
            })
            .collect();

        ConsistentHash::new(
            members,
            segment_owners,
            self.num_owners.max(other.num_owners),
            self.requires_primary_owner && other.requires_primary_owner,
        )
    }
}

impl fmt::Debug for ConsistentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistentHash")
            .field("num_segments", &self.num_segments())
            .field("num_owners", &self.num_owners)
            .field("members", &self.members)
            .finish()
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::Error {
    TopologyError::InvalidConsistentHash(reason.into()).into()
}

/// Placement algorithm producing new hashes.
pub trait ConsistentHashFactory: Send + Sync + fmt::Debug {
    /// A fresh hash for the given members.
    fn create(
        &self,
        members: &[Address],
        num_owners: usize,
        num_segments: u32,
    ) -> Result<ConsistentHash>;

    /// Restrict `base` to `new_members` (which may also add members).
    ///
    /// Must never hand a segment to a member that does not already own it,
    /// unless the segment would otherwise be left without an owner.
    fn update_members(
        &self,
        base: &ConsistentHash,
        new_members: &[Address],
    ) -> Result<ConsistentHash>;

    /// The balanced target hash for the members of `base`.
    fn rebalance(&self, base: &ConsistentHash) -> Result<ConsistentHash>;

    /// Union used as the write hash while rebalancing.
    fn union(&self, a: &ConsistentHash, b: &ConsistentHash) -> Result<ConsistentHash> {
        a.union(b)
    }
}

/// Placement on a virtual-node ring; segments sit at fixed ring positions.
#[derive(Debug, Clone)]
pub struct RingConsistentHashFactory {
    vnodes_per_node: usize,
    requires_primary_owner: bool,
}

impl RingConsistentHashFactory {
    /// Factory for distributed and replicated caches.
    pub fn new() -> Self {
        Self {
            vnodes_per_node: DEFAULT_VNODES_PER_NODE,
            requires_primary_owner: true,
        }
    }

    /// Factory for scattered caches, where a segment may be briefly unowned
    /// after its only owner leaves.
    pub fn scattered() -> Self {
        Self {
            vnodes_per_node: DEFAULT_VNODES_PER_NODE,
            requires_primary_owner: false,
        }
    }

    /// Set the vnode count.
    pub fn with_vnodes(mut self, vnodes_per_node: usize) -> Self {
        self.vnodes_per_node = vnodes_per_node;
        self
    }
}

impl Default for RingConsistentHashFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistentHashFactory for RingConsistentHashFactory {
    fn create(
        &self,
        members: &[Address],
        num_owners: usize,
        num_segments: u32,
    ) -> Result<ConsistentHash> {
        if members.is_empty() {
            return Ok(ConsistentHash::empty(num_segments, num_owners));
        }

        let ring = HashRing::from_members(members, self.vnodes_per_node);
        let segment_owners = (0..num_segments.max(1))
            .map(|segment| ring.owners_for_segment(segment, num_owners))
            .collect();

        ConsistentHash::new(
            members.to_vec(),
            segment_owners,
            num_owners,
            self.requires_primary_owner,
        )
    }

    fn update_members(
        &self,
        base: &ConsistentHash,
        new_members: &[Address],
    ) -> Result<ConsistentHash> {
        if new_members.is_empty() {
            return Ok(ConsistentHash::empty(base.num_segments(), base.num_owners()));
        }

        let ring = HashRing::from_members(new_members, self.vnodes_per_node);
        let segment_owners = (0..base.num_segments())
            .map(|segment| {
                let mut owners: Vec<Address> = base
                    .owners_for_segment(segment)
                    .iter()
                    .filter(|o| new_members.contains(o))
                    .cloned()
                    .collect();
                if owners.is_empty() && self.requires_primary_owner {
                    owners = ring.owners_for_segment(segment, 1);
                }
                owners
            })
            .collect();

        ConsistentHash::new(
            new_members.to_vec(),
            segment_owners,
            base.num_owners(),
            self.requires_primary_owner,
        )
    }

    fn rebalance(&self, base: &ConsistentHash) -> Result<ConsistentHash> {
        self.create(base.members(), base.num_owners(), base.num_segments())
    }
}
