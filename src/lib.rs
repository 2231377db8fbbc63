//! Topology, availability and state transfer core for a partitioned
//! in-memory data grid.
//!
//! Keys are hashed into a fixed number of segments and every segment is
//! owned by an ordered list of members. This crate keeps that ownership
//! consistent while members join, leave, crash, or come back after a split:
//!
//! - **Topology**: [`ConsistentHash`] and versioned [`CacheTopology`]
//!   snapshots, maintained by a per-cache coordinator
//! - **Partition handling**: an availability strategy that either stays
//!   available or degrades when data may have been lost
//! - **State transfer**: providers stream segments as chunks, consumers
//!   apply them and confirm the rebalance
//! - **Conflict resolution**: after a merge, divergent copies are collected,
//!   merged by policy and pushed back to the owners
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  ClusterCacheStatus (coordinator)            │
//! │   membership events ──► AvailabilityStrategy ──► topologies  │
//! └──────────────────────────────────────────────────────────────┘
//!          │ publish                                 ▲ confirm
//!          ▼                                         │
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 StateTransferManager (per node)              │
//! │   ┌───────────────┐                    ┌───────────────┐     │
//! │   │ StateProvider │ ── StateResponse ─►│ StateConsumer │     │
//! │   └───────────────┘                    └───────────────┘     │
//! └──────────────────────────────────────────────────────────────┘
//!          │                                         │
//!          ▼                                         ▼
//!   StateTransport (framed commands)         DataContainer (Moka)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gridstate::{Address, ClusterCacheStatus, RingConsistentHashFactory, StateTransferConfig};
//! use gridstate::config::PartitionHandlingConfig;
//! use gridstate::partition::{strategy_for, LoggingEventListener};
//! use std::sync::Arc;
//!
//! let config = StateTransferConfig::default().with_num_owners(2);
//! let strategy = strategy_for(
//!     &PartitionHandlingConfig::default(),
//!     Arc::new(LoggingEventListener),
//!     None,
//! );
//! let status = ClusterCacheStatus::new(
//!     "users",
//!     Arc::new(RingConsistentHashFactory::new()),
//!     &config,
//!     strategy,
//! );
//! status.node_joined(Address::new("node-a"), None);
//! ```

pub mod config;
pub mod conflict;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod statetransfer;
pub mod testing;
pub mod topology;
pub mod types;

pub use config::{CacheMode, PartitionHandling, PartitionHandlingConfig, StateTransferConfig};
pub use error::{Error, Result};
pub use types::{Address, InternalEntry, SegmentId, SegmentSet, TopologyId};

// Topology
pub use topology::{
    CacheTopology, ClusterCacheStatus, ConsistentHash, ConsistentHashFactory, KeyPartitioner,
    Phase, RebalanceConfirmation, RingConsistentHashFactory,
};

// Partition handling
pub use partition::{
    AvailabilityMode, AvailabilityStrategy, PreferAvailabilityStrategy,
    PreferConsistencyStrategy, TopologyEvent, TopologyEventListener,
};

// State transfer
pub use statetransfer::{
    CommandResponse, DataContainer, MokaDataContainer, StateChunk, StateTransferCommand,
    StateTransferCommandHandler, StateTransferManager, StateTransport, TransactionTable,
};

// Conflict resolution
pub use conflict::{ConflictManager, DefaultConflictManager, MergePolicy};

pub use metrics::{StateTransferMetrics, StateTransferMetricsSnapshot};
