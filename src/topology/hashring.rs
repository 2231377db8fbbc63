//! Virtual-node hash ring used by the ring-based placement.
//!
//! Each member is represented by many virtual nodes so that segment
//! positions spread evenly and move minimally when members change.

use crate::types::{Address, SegmentId};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Number of virtual nodes per member.
pub const DEFAULT_VNODES_PER_NODE: usize = 64;

/// A consistent hash ring over member addresses.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Ring position to owning member.
    vnodes: BTreeMap<u64, Address>,

    /// Number of virtual nodes per member.
    vnodes_per_node: usize,

    /// Members in the ring, sorted.
    nodes: Vec<Address>,
}

impl HashRing {
    /// Create an empty ring.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_NODE)
    }

    /// Create an empty ring with a custom vnode count.
    pub fn with_vnodes(vnodes_per_node: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            nodes: Vec::new(),
        }
    }

    /// Build a ring containing the given members.
    pub fn from_members(members: &[Address], vnodes_per_node: usize) -> Self {
        let mut ring = Self::with_vnodes(vnodes_per_node);
        for member in members {
            ring.add_node(member.clone());
        }
        ring
    }

    /// Number of members in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Members in the ring.
    pub fn nodes(&self) -> &[Address] {
        &self.nodes
    }

    /// Add a member, creating its virtual nodes.
    pub fn add_node(&mut self, node: Address) {
        if self.nodes.contains(&node) {
            return;
        }

        for i in 0..self.vnodes_per_node {
            let vnode_key = format!("{}:{}", node, i);
            self.vnodes.insert(hash_bytes(vnode_key.as_bytes()), node.clone());
        }

        self.nodes.push(node);
        self.nodes.sort();
    }

    /// Remove a member and its virtual nodes.
    pub fn remove_node(&mut self, node: &Address) {
        if !self.nodes.contains(node) {
            return;
        }

        self.nodes.retain(|n| n != node);
        for i in 0..self.vnodes_per_node {
            let vnode_key = format!("{}:{}", node, i);
            self.vnodes.remove(&hash_bytes(vnode_key.as_bytes()));
        }
    }

    /// Up to `count` distinct members found walking clockwise from `position`.
    /// The first one is the primary owner.
    pub fn owners_at(&self, position: u64, count: usize) -> Vec<Address> {
        let mut owners = Vec::with_capacity(count.min(self.nodes.len()));
        if self.vnodes.is_empty() || count == 0 {
            return owners;
        }

        let iter = self.vnodes.range(position..).chain(self.vnodes.iter());
        for (_, node) in iter {
            if !owners.contains(node) {
                owners.push(node.clone());
                if owners.len() >= count || owners.len() >= self.nodes.len() {
                    break;
                }
            }
        }

        owners
    }

    /// Owners of a segment: the segment is placed at a fixed ring position.
    pub fn owners_for_segment(&self, segment: SegmentId, count: usize) -> Vec<Address> {
        self.owners_at(segment_position(segment), count)
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash bytes with xxHash64.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Fixed ring position of a segment.
pub fn segment_position(segment: SegmentId) -> u64 {
    hash_bytes(format!("segment:{}", segment).as_bytes())
}

/// Maps keys to segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPartitioner {
    num_segments: u32,
}

impl KeyPartitioner {
    /// Create a partitioner for `num_segments` segments (at least one).
    pub fn new(num_segments: u32) -> Self {
        Self {
            num_segments: num_segments.max(1),
        }
    }

    /// Number of segments.
    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    /// The segment a key belongs to.
    pub fn segment_of(&self, key: &[u8]) -> SegmentId {
        (hash_bytes(key) % self.num_segments as u64) as SegmentId
    }
}
