//! Testing utilities for topology handling and state transfer.
//!
//! This module provides:
//! - An in-process network that frames every message through the wire codec
//! - A test cluster driven by a real coordinator
//! - Recording doubles for strategy contexts, listeners and confirmations
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         TestCluster                             │
//! │                                                                 │
//! │   ClusterCacheStatus ──publish──► per-node listener task        │
//! │          ▲                               │                      │
//! │          │ confirm                       ▼                      │
//! │          └────────────── StateTransferManager (per node)        │
//! │                                   │                             │
//! │                                   ▼                             │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │                    InMemoryNetwork                        │  │
//! │  │  - Envelope framing into StateTransferCommandHandler      │  │
//! │  │  - Crashed nodes and split groups                         │  │
//! │  │  - Delayed, recorded state responses                      │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gridstate::config::{PartitionHandlingConfig, StateTransferConfig};
//! use gridstate::testing::TestCluster;
//!
//! let mut cluster = TestCluster::new("A", StateTransferConfig::default(), PartitionHandlingConfig::default());
//! cluster.join("A")?;
//! cluster.join("B")?;
//! assert!(cluster.wait_for_stable(2, Duration::from_secs(5)).await);
//! ```

mod cluster;
mod network;
mod recording;
mod utils;

mod conflict_resolution_e2e_tests;
mod state_transfer_e2e_tests;

pub use cluster::{TestCluster, TestNode};
pub use network::{Delivery, InMemoryNetwork, NetworkEndpoint};
pub use recording::{
    ContextCall, RecordingConfirmation, RecordingConflictManager, RecordingContext,
    RecordingEventListener,
};
pub use utils::{addrs, fill, fill_segment, hash_of, stable_topology, wait_for, wait_for_result};
