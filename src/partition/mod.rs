//! Partition handling: the availability strategy state machine.
//!
//! The coordinator delivers membership events for one cache at a time; the
//! strategy turns them into topology updates through an
//! [`AvailabilityStrategyContext`].
//!
//! ```text
//!   join ─────────────► queue_rebalance(expected)
//!   graceful leave ───► [data lost? warn] ─► update_current ─► queue_rebalance
//!   view change ──────► [lost data? fatal | minority? warn] ─► update_current ─► queue_rebalance
//!   merge ────────────► pick max stable/current ─► [split healed? resolve conflicts]
//!                       ─► merged topology (id = max + 1) ─► update_current ─► queue_rebalance
//! ```

mod context;
mod events;
mod prefer_availability;
mod prefer_consistency;
mod status;
mod strategy;

pub use context::{AvailabilityMode, AvailabilityStrategyContext};
pub use events::{
    EventLevel, LoggingEventListener, NoopEventListener, TopologyEvent, TopologyEventListener,
};
pub use prefer_availability::PreferAvailabilityStrategy;
pub use prefer_consistency::PreferConsistencyStrategy;
pub use status::CacheStatusResponse;
pub use strategy::AvailabilityStrategy;

use crate::config::{PartitionHandling, PartitionHandlingConfig};
use crate::conflict::ConflictManager;
use std::sync::Arc;

/// Build the strategy selected by the partition handling configuration.
///
/// The conflict manager is only used when a merge policy is configured.
pub fn strategy_for(
    config: &PartitionHandlingConfig,
    listener: Arc<dyn TopologyEventListener>,
    conflict_manager: Option<Arc<dyn ConflictManager>>,
) -> Arc<dyn AvailabilityStrategy> {
    match config.when_split {
        PartitionHandling::AllowAll => {
            let conflict_manager = conflict_manager.filter(|_| config.merge_policy.is_some());
            Arc::new(PreferAvailabilityStrategy::new(listener, conflict_manager))
        }
        PartitionHandling::DenyAll => Arc::new(PreferConsistencyStrategy::new(listener)),
    }
}
