//! The narrow interface an availability strategy acts through.

use crate::topology::CacheTopology;
use crate::types::Address;
use std::fmt;
use std::sync::Arc;

/// Whether a cache accepts operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum AvailabilityMode {
    /// All operations allowed.
    #[default]
    Available,
    /// Operations on possibly lost data are refused.
    DegradedMode,
}

impl fmt::Display for AvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvailabilityMode::Available => write!(f, "available"),
            AvailabilityMode::DegradedMode => write!(f, "degraded"),
        }
    }
}

/// Coordinator-side view of one cache.
///
/// Implemented by the cluster cache status; strategies read the current and
/// stable topologies and ask for updates. All calls happen while the
/// coordinator holds its per-cache lock, so handlers never see interleaved
/// updates.
pub trait AvailabilityStrategyContext {
    /// Name of the cache.
    fn cache_name(&self) -> &str;

    /// The topology most recently installed.
    fn current_topology(&self) -> Option<Arc<CacheTopology>>;

    /// The last topology whose rebalance completed.
    fn stable_topology(&self) -> Option<Arc<CacheTopology>>;

    /// Members that should be in the cache once rebalancing settles.
    fn expected_members(&self) -> Vec<Address>;

    /// The availability mode.
    fn availability_mode(&self) -> AvailabilityMode;

    /// Install a topology restricted to `members`, without rebalancing.
    fn update_current_topology(&mut self, members: &[Address]);

    /// Rebalance towards `members` as soon as no rebalance is running.
    fn queue_rebalance(&mut self, members: &[Address]);

    /// Install the topologies chosen after a merge. `None` keeps the
    /// corresponding value unchanged.
    fn update_topologies_after_merge(
        &mut self,
        current: Option<CacheTopology>,
        stable: Option<Arc<CacheTopology>>,
        availability_mode: Option<AvailabilityMode>,
    );

    /// Change the availability mode, installing a topology for `members`.
    /// With `cancel_rebalance` any pending hash is dropped.
    fn update_availability_mode(
        &mut self,
        members: &[Address],
        mode: AvailabilityMode,
        cancel_rebalance: bool,
    );
}
