//! State transfer commands.
//!
//! Every command is scoped to one cache and one segment set and carries the
//! topology id it was issued under. A receiver whose installed topology is
//! newer drops the command.

use crate::statetransfer::chunk::StateChunk;
use crate::types::{SegmentSet, TopologyId, TransactionInfo, UNKNOWN_TOPOLOGY_ID};
use serde::{Deserialize, Serialize};

/// Wire ids. These must never be renumbered.
pub mod ids {
    pub const STATE_RESPONSE: u8 = 20;
    pub const CONFLICT_RESOLUTION_START: u8 = 112;
    pub const SCATTERED_STATE_GET_KEYS: u8 = 114;
    pub const SCATTERED_STATE_CONFIRM_REVOKED: u8 = 115;
    pub const STATE_TRANSFER_START: u8 = 116;
    pub const STATE_TRANSFER_CANCEL: u8 = 117;
    pub const STATE_TRANSFER_GET_TRANSACTIONS: u8 = 119;
}

/// Requests exchanged between state consumers and providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateTransferCommand {
    /// Ask the receiver to start pushing state for `segments`.
    StartOutbound {
        cache_name: String,
        topology_id: TopologyId,
        segments: SegmentSet,
        /// `false` for a targeted re-pull whose chunks must not be applied
        /// to the live store.
        is_rebalance: bool,
    },

    /// Ask the receiver to stop an outbound transfer. Safe on transfers that
    /// finished or never started.
    CancelOutbound {
        cache_name: String,
        topology_id: TopologyId,
        segments: SegmentSet,
    },

    /// Pull state for reconciliation after a merge.
    ConflictResolutionStart {
        cache_name: String,
        topology_id: TopologyId,
        segments: SegmentSet,
    },

    /// Ask for in-flight transactions touching `segments`.
    GetTransactions {
        cache_name: String,
        topology_id: TopologyId,
        segments: SegmentSet,
    },

    /// Scattered mode: the receiver confirms it stopped serving `segments`.
    ConfirmRevokedSegments {
        cache_name: String,
        topology_id: TopologyId,
        segments: SegmentSet,
    },

    /// Scattered mode: transfer keys and versions only.
    GetKeysForSegments {
        cache_name: String,
        topology_id: TopologyId,
        segments: SegmentSet,
    },
}

impl StateTransferCommand {
    /// Wire id of the command.
    pub fn command_id(&self) -> u8 {
        match self {
            StateTransferCommand::StartOutbound { .. } => ids::STATE_TRANSFER_START,
            StateTransferCommand::CancelOutbound { .. } => ids::STATE_TRANSFER_CANCEL,
            StateTransferCommand::ConflictResolutionStart { .. } => ids::CONFLICT_RESOLUTION_START,
            StateTransferCommand::GetTransactions { .. } => ids::STATE_TRANSFER_GET_TRANSACTIONS,
            StateTransferCommand::ConfirmRevokedSegments { .. } => {
                ids::SCATTERED_STATE_CONFIRM_REVOKED
            }
            StateTransferCommand::GetKeysForSegments { .. } => ids::SCATTERED_STATE_GET_KEYS,
        }
    }

    /// Whether the sender waits for a response.
    pub fn expects_response(&self) -> bool {
        !matches!(self, StateTransferCommand::CancelOutbound { .. })
    }

    /// Name of the cache the command targets.
    pub fn cache_name(&self) -> &str {
        match self {
            StateTransferCommand::StartOutbound { cache_name, .. }
            | StateTransferCommand::CancelOutbound { cache_name, .. }
            | StateTransferCommand::ConflictResolutionStart { cache_name, .. }
            | StateTransferCommand::GetTransactions { cache_name, .. }
            | StateTransferCommand::ConfirmRevokedSegments { cache_name, .. }
            | StateTransferCommand::GetKeysForSegments { cache_name, .. } => cache_name,
        }
    }

    /// Topology id the command was issued under.
    pub fn topology_id(&self) -> TopologyId {
        match self {
            StateTransferCommand::StartOutbound { topology_id, .. }
            | StateTransferCommand::CancelOutbound { topology_id, .. }
            | StateTransferCommand::ConflictResolutionStart { topology_id, .. }
            | StateTransferCommand::GetTransactions { topology_id, .. }
            | StateTransferCommand::ConfirmRevokedSegments { topology_id, .. }
            | StateTransferCommand::GetKeysForSegments { topology_id, .. } => *topology_id,
        }
    }

    /// Segments the command applies to.
    pub fn segments(&self) -> &SegmentSet {
        match self {
            StateTransferCommand::StartOutbound { segments, .. }
            | StateTransferCommand::CancelOutbound { segments, .. }
            | StateTransferCommand::ConflictResolutionStart { segments, .. }
            | StateTransferCommand::GetTransactions { segments, .. }
            | StateTransferCommand::ConfirmRevokedSegments { segments, .. }
            | StateTransferCommand::GetKeysForSegments { segments, .. } => segments,
        }
    }

    /// Whether a receiver at `current` must drop this command.
    ///
    /// `-1` means the sender does not care about the topology.
    pub fn is_stale(&self, current: TopologyId) -> bool {
        let topology_id = self.topology_id();
        topology_id != UNKNOWN_TOPOLOGY_ID && topology_id < current
    }
}

/// Chunks pushed from a provider to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponseCommand {
    pub cache_name: String,
    pub topology_id: TopologyId,
    pub chunks: Vec<StateChunk>,
    /// `true` applies to the live store, `false` routes to the conflict
    /// resolver.
    pub apply_state: bool,
    /// Unsolicited push, accepted without a preceding start.
    pub push_transfer: bool,
}

impl StateResponseCommand {
    /// A response to a pull request.
    pub fn new(
        cache_name: impl Into<String>,
        topology_id: TopologyId,
        chunks: Vec<StateChunk>,
        apply_state: bool,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            topology_id,
            chunks,
            apply_state,
            push_transfer: false,
        }
    }

    /// An unsolicited push applied to the live store.
    pub fn push(cache_name: impl Into<String>, topology_id: TopologyId, chunks: Vec<StateChunk>) -> Self {
        Self {
            cache_name: cache_name.into(),
            topology_id,
            chunks,
            apply_state: true,
            push_transfer: true,
        }
    }
}

/// Reply to a [`StateTransferCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// The command was accepted.
    Ack,
    /// Transactions touching the requested segments.
    Transactions(Vec<TransactionInfo>),
    /// Dropped because the receiver's topology is newer.
    Ignored,
    /// The receiver has no such cache.
    UnknownCache,
    /// The command failed on the receiver.
    Error(String),
}
