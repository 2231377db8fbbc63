//! Core types used throughout the topology and state transfer core.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::collections::BTreeSet;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier of a segment, a fixed partition of the keyspace.
pub type SegmentId = u32;

/// Monotonically increasing topology identifier.
pub type TopologyId = i32;

/// Topology id meaning "unknown / don't care".
pub const UNKNOWN_TOPOLOGY_ID: TopologyId = -1;

/// Ordered set of segments carried by commands.
pub type SegmentSet = BTreeSet<SegmentId>;

/// Opaque identity of a cluster member.
///
/// Only equality, ordering and hashing are relied upon.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(SmolStr);

impl Address {
    /// Create an address from its textual form.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(SmolStr::new(name))
    }

    /// The textual form of the address.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Metadata carried alongside a transferred entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Entry version, used by version based merging and scattered key transfer.
    pub version: Option<u64>,

    /// Absolute expiration time in nanoseconds since UNIX epoch.
    pub expires_at_nanos: Option<u64>,
}

impl EntryMetadata {
    /// Metadata with only a version.
    pub fn versioned(version: u64) -> Self {
        Self {
            version: Some(version),
            expires_at_nanos: None,
        }
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at_nanos.map_or(false, |expires| {
            let now_nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64;
            expires <= now_nanos
        })
    }
}

/// A key with its value and metadata as held by the local store.
///
/// `value` is `None` for key-only transfers, where only the key and its
/// remote version are shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalEntry {
    pub key: Bytes,
    pub value: Option<Bytes>,
    pub metadata: EntryMetadata,
}

impl InternalEntry {
    /// Create an entry without metadata.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            metadata: EntryMetadata::default(),
        }
    }

    /// Create an entry with a version.
    pub fn versioned(key: impl Into<Bytes>, value: impl Into<Bytes>, version: u64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            metadata: EntryMetadata::versioned(version),
        }
    }

    /// Strip the value, keeping key and metadata.
    pub fn key_only(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: None,
            metadata: self.metadata.clone(),
        }
    }

    /// Whether this entry carries a value.
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

/// In-flight transaction state touching transferred segments.
///
/// Owned by the transaction collaborator; the core only ships it around.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub global_tx: Uuid,
    pub originator: Address,
    pub locked_keys: Vec<Bytes>,
    pub topology_id: TopologyId,
}

/// Build a segment set from anything iterable.
pub fn segments<I: IntoIterator<Item = SegmentId>>(iter: I) -> SegmentSet {
    iter.into_iter().collect()
}
