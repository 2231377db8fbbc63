//! Configuration types for the state transfer core.

use crate::conflict::MergePolicy;
use crate::error::{Error, Result};
use std::time::Duration;

/// How ownership is laid out across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Each segment has `num_owners` owners.
    Distributed,
    /// Every member owns every segment.
    Replicated,
    /// Exactly one owner per segment, no backups.
    Scattered,
}

impl CacheMode {
    /// Whether the scattered-only commands apply.
    pub fn is_scattered(&self) -> bool {
        matches!(self, CacheMode::Scattered)
    }
}

/// What a cache does when the cluster splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionHandling {
    /// Stay available on every partition, accepting divergence.
    #[default]
    AllowAll,
    /// Block operations on a partition that may have lost data.
    DenyAll,
}

/// State transfer configuration.
#[derive(Debug, Clone)]
pub struct StateTransferConfig {
    /// Whether state is transferred on rebalance at all.
    pub enabled: bool,

    /// Maximum entries per state chunk.
    pub chunk_size: usize,

    /// Timeout for a single transfer request and for waiting on a topology.
    pub timeout: Duration,

    /// Whether a joiner waits for its initial state before serving.
    pub await_initial_transfer: bool,

    /// Ownership layout.
    pub cache_mode: CacheMode,

    /// Owners per segment for distributed mode.
    pub num_owners: usize,

    /// Number of segments.
    pub num_segments: u32,
}

impl Default for StateTransferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            chunk_size: 512,
            timeout: Duration::from_secs(240),
            await_initial_transfer: true,
            cache_mode: CacheMode::Distributed,
            num_owners: 2,
            num_segments: 256,
        }
    }
}

impl StateTransferConfig {
    /// Create a configuration for the given cache mode.
    pub fn new(cache_mode: CacheMode) -> Self {
        let num_owners = if cache_mode.is_scattered() { 1 } else { 2 };
        Self {
            cache_mode,
            num_owners,
            ..Default::default()
        }
    }

    /// Enable or disable state transfer.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set whether joiners await their initial state.
    pub fn with_await_initial_transfer(mut self, await_initial: bool) -> Self {
        self.await_initial_transfer = await_initial;
        self
    }

    /// Set the number of owners per segment.
    pub fn with_num_owners(mut self, num_owners: usize) -> Self {
        self.num_owners = num_owners;
        self
    }

    /// Set the number of segments.
    pub fn with_num_segments(mut self, num_segments: u32) -> Self {
        self.num_segments = num_segments;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_segments == 0 {
            return Err(Error::Config("num_segments must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.num_owners == 0 {
            return Err(Error::Config("num_owners must be positive".into()));
        }
        if self.cache_mode.is_scattered() && self.num_owners != 1 {
            return Err(Error::Config(format!(
                "scattered mode requires exactly one owner, got {}",
                self.num_owners
            )));
        }
        Ok(())
    }
}

/// Partition handling configuration.
#[derive(Debug, Clone, Default)]
pub struct PartitionHandlingConfig {
    /// Behaviour on split.
    pub when_split: PartitionHandling,

    /// Policy used to reconcile divergent values after a merge.
    /// `None` disables conflict resolution.
    pub merge_policy: Option<MergePolicy>,
}

impl PartitionHandlingConfig {
    /// Set the split behaviour.
    pub fn with_when_split(mut self, when_split: PartitionHandling) -> Self {
        self.when_split = when_split;
        self
    }

    /// Set the merge policy.
    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = Some(policy);
        self
    }
}
