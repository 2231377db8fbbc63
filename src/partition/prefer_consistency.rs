//! Availability strategy that degrades a partition rather than risk
//! serving divergent data.

use crate::partition::context::{AvailabilityMode, AvailabilityStrategyContext};
use crate::partition::events::{TopologyEvent, TopologyEventListener};
use crate::partition::status::CacheStatusResponse;
use crate::partition::strategy::{
    current_members, is_minority_partition, AvailabilityStrategy, MergeSelection,
};
use crate::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Enters degraded mode when a view change may have lost data or left this
/// side in a minority, and only rebalances while available.
pub struct PreferConsistencyStrategy {
    listener: Arc<dyn TopologyEventListener>,
}

impl PreferConsistencyStrategy {
    /// Create a new strategy.
    pub fn new(listener: Arc<dyn TopologyEventListener>) -> Self {
        Self { listener }
    }

    fn enter_mode(
        &self,
        ctx: &mut dyn AvailabilityStrategyContext,
        members: &[Address],
        mode: AvailabilityMode,
    ) {
        let changed = ctx.availability_mode() != mode;
        ctx.update_availability_mode(members, mode, mode == AvailabilityMode::DegradedMode);
        if changed {
            self.listener.on_event(&TopologyEvent::AvailabilityModeChanged {
                cache: ctx.cache_name().to_string(),
                mode,
            });
        }
    }
}

impl AvailabilityStrategy for PreferConsistencyStrategy {
    fn on_join(&self, ctx: &mut dyn AvailabilityStrategyContext, joiner: &Address) {
        if ctx.availability_mode() != AvailabilityMode::Available {
            debug!(cache = %ctx.cache_name(), %joiner, "Cache degraded, not rebalancing for joiner");
            return;
        }
        let expected = ctx.expected_members();
        ctx.queue_rebalance(&expected);
    }

    fn on_graceful_leave(&self, ctx: &mut dyn AvailabilityStrategyContext, leaver: &Address) {
        let Some(mut new_members) = current_members(ctx) else {
            return;
        };
        new_members.retain(|m| m != leaver);

        if new_members.is_empty() {
            ctx.update_current_topology(&[]);
            self.listener.on_event(&TopologyEvent::NoMembers {
                cache: ctx.cache_name().to_string(),
            });
            return;
        }

        if let Some(stable) = ctx.stable_topology() {
            let lost_segments = stable.current_ch().lost_segments(&new_members);
            if !lost_segments.is_empty() {
                self.listener.on_event(&TopologyEvent::DataLostGracefulLeave {
                    cache: ctx.cache_name().to_string(),
                    leaver: leaver.clone(),
                    lost_segments,
                });
            }
        }

        ctx.update_current_topology(&new_members);
        if ctx.availability_mode() == AvailabilityMode::Available {
            let expected = ctx.expected_members();
            ctx.queue_rebalance(&expected);
        }
    }

    fn on_cluster_view_change(
        &self,
        ctx: &mut dyn AvailabilityStrategyContext,
        cluster_members: &[Address],
    ) {
        let Some(current) = current_members(ctx) else {
            return;
        };
        let new_members: Vec<Address> = current
            .iter()
            .filter(|m| cluster_members.contains(m))
            .cloned()
            .collect();
        if new_members.len() == current.len() {
            return;
        }

        if ctx.availability_mode() != AvailabilityMode::Available {
            ctx.update_current_topology(&new_members);
            return;
        }

        if let Some(stable) = ctx.stable_topology() {
            let lost_members: Vec<Address> = stable
                .members()
                .iter()
                .filter(|m| !new_members.contains(m))
                .cloned()
                .collect();
            let data_lost = stable.current_ch().is_data_lost(&new_members);
            if data_lost || is_minority_partition(stable.members(), &lost_members) {
                if data_lost {
                    self.listener.on_event(&TopologyEvent::DataLostAbruptLeave {
                        cache: ctx.cache_name().to_string(),
                        lost_members,
                    });
                } else {
                    self.listener.on_event(&TopologyEvent::MinorityPartition {
                        cache: ctx.cache_name().to_string(),
                        new_members: new_members.clone(),
                        lost_members,
                        stable_members: stable.members().to_vec(),
                    });
                }
                self.enter_mode(ctx, &new_members, AvailabilityMode::DegradedMode);
                return;
            }
        }

        ctx.update_current_topology(&new_members);
        let expected = ctx.expected_members();
        ctx.queue_rebalance(&expected);
    }

    fn on_partition_merge(
        &self,
        ctx: &mut dyn AvailabilityStrategyContext,
        status: &BTreeMap<Address, CacheStatusResponse>,
    ) {
        let cache_name = ctx.cache_name().to_string();
        let mut selection = MergeSelection::select(status);

        // Prefer the current topology of a partition that stayed available.
        let available = status
            .values()
            .filter(|r| r.availability_mode == AvailabilityMode::Available)
            .filter_map(|r| r.current_topology.as_ref())
            .max_by_key(|t| t.topology_id());
        if let Some(available) = available {
            selection.max_topology = Some(Arc::clone(available));
        }

        let expected = ctx.expected_members();
        let mode = match &selection.max_stable {
            Some(stable) => {
                let all_back = stable.members().iter().all(|m| expected.contains(m));
                if all_back && !stable.current_ch().is_data_lost(&expected) {
                    AvailabilityMode::Available
                } else {
                    AvailabilityMode::DegradedMode
                }
            }
            None => AvailabilityMode::Available,
        };

        info!(cache = %cache_name, %mode, "Handling partition merge");

        let merged = selection.merged_topology(&cache_name);
        let merged_members = merged.as_ref().map(|t| t.members().to_vec());
        let previous_mode = ctx.availability_mode();
        ctx.update_topologies_after_merge(merged, selection.max_stable.clone(), Some(mode));
        if previous_mode != mode {
            self.listener.on_event(&TopologyEvent::AvailabilityModeChanged {
                cache: cache_name,
                mode,
            });
        }

        if mode != AvailabilityMode::Available {
            return;
        }
        if let Some(merged_members) = merged_members {
            let surviving: Vec<Address> = expected
                .iter()
                .filter(|m| merged_members.contains(m))
                .cloned()
                .collect();
            ctx.update_current_topology(&surviving);
        }
        ctx.queue_rebalance(&expected);
    }

    fn on_rebalance_end(&self, _ctx: &mut dyn AvailabilityStrategyContext) {}

    fn on_manual_availability_change(
        &self,
        ctx: &mut dyn AvailabilityStrategyContext,
        mode: AvailabilityMode,
    ) {
        let Some(members) = current_members(ctx) else {
            return;
        };
        self.enter_mode(ctx, &members, mode);
        if mode == AvailabilityMode::Available {
            let expected = ctx.expected_members();
            ctx.queue_rebalance(&expected);
        }
    }
}
