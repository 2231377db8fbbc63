//! The availability strategy state machine and helpers shared by its
//! implementations.

use crate::partition::context::{AvailabilityMode, AvailabilityStrategyContext};
use crate::partition::events::{TopologyEvent, TopologyEventListener};
use crate::partition::status::CacheStatusResponse;
use crate::topology::CacheTopology;
use crate::types::{Address, TopologyId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reacts to membership events by installing topologies through the context.
///
/// Handlers never fail; problems are reported as [`TopologyEvent`]s.
pub trait AvailabilityStrategy: Send + Sync {
    /// A node joined the cache.
    fn on_join(&self, ctx: &mut dyn AvailabilityStrategyContext, joiner: &Address);

    /// A node announced it is leaving.
    fn on_graceful_leave(&self, ctx: &mut dyn AvailabilityStrategyContext, leaver: &Address);

    /// The cluster view changed, possibly dropping members abruptly.
    fn on_cluster_view_change(
        &self,
        ctx: &mut dyn AvailabilityStrategyContext,
        cluster_members: &[Address],
    );

    /// A split healed; `status` holds what every node reported.
    fn on_partition_merge(
        &self,
        ctx: &mut dyn AvailabilityStrategyContext,
        status: &BTreeMap<Address, CacheStatusResponse>,
    );

    /// The running rebalance completed.
    fn on_rebalance_end(&self, ctx: &mut dyn AvailabilityStrategyContext);

    /// An operator asked for a different availability mode.
    fn on_manual_availability_change(
        &self,
        ctx: &mut dyn AvailabilityStrategyContext,
        mode: AvailabilityMode,
    );
}

/// Members of the current topology, empty when none is installed.
pub(crate) fn current_members(ctx: &dyn AvailabilityStrategyContext) -> Option<Vec<Address>> {
    ctx.current_topology().map(|t| t.members().to_vec())
}

/// `lost >= ceil(stable / 2)`.
pub(crate) fn is_minority_partition(stable_members: &[Address], lost_members: &[Address]) -> bool {
    lost_members.len() >= (stable_members.len() + 1) / 2
}

/// Report abrupt data loss or a likely minority partition against the stable
/// topology. Returns `true` if anything was reported.
pub(crate) fn check_for_lost_data(
    ctx: &dyn AvailabilityStrategyContext,
    listener: &dyn TopologyEventListener,
    new_members: &[Address],
) -> bool {
    let Some(stable) = ctx.stable_topology() else {
        return false;
    };

    let stable_members = stable.members();
    let lost_members: Vec<Address> = stable_members
        .iter()
        .filter(|m| !new_members.contains(m))
        .cloned()
        .collect();

    if stable.current_ch().is_data_lost(new_members) {
        listener.on_event(&TopologyEvent::DataLostAbruptLeave {
            cache: ctx.cache_name().to_string(),
            lost_members,
        });
        true
    } else if is_minority_partition(stable_members, &lost_members) {
        listener.on_event(&TopologyEvent::MinorityPartition {
            cache: ctx.cache_name().to_string(),
            new_members: new_members.to_vec(),
            lost_members,
            stable_members: stable_members.to_vec(),
        });
        true
    } else {
        false
    }
}

/// Topologies picked from the per-node status reported during a merge.
#[derive(Debug, Default)]
pub(crate) struct MergeSelection {
    /// Stable topology with the most members.
    pub max_stable: Option<Arc<CacheTopology>>,
    /// Stable topology of every node that agrees with `max_stable`.
    pub partitions: BTreeMap<Address, Arc<CacheTopology>>,
    /// Current topology with the most actual members among those nodes.
    pub max_topology: Option<Arc<CacheTopology>>,
    /// Highest topology id reported by anyone.
    pub max_topology_id: TopologyId,
    /// Highest rebalance id reported by anyone.
    pub max_rebalance_id: i32,
}

impl MergeSelection {
    pub(crate) fn select(status: &BTreeMap<Address, CacheStatusResponse>) -> Self {
        let mut selection = MergeSelection {
            max_topology_id: crate::types::UNKNOWN_TOPOLOGY_ID,
            max_rebalance_id: crate::types::UNKNOWN_TOPOLOGY_ID,
            ..Default::default()
        };

        for response in status.values() {
            let Some(stable) = &response.stable_topology else {
                continue;
            };
            let larger = selection
                .max_stable
                .as_ref()
                .map_or(true, |max| stable.members().len() > max.members().len());
            if larger {
                selection.max_stable = Some(Arc::clone(stable));
            }
        }

        for (address, response) in status {
            // Every reported id counts so the merged topology is newer than all
            // of them, whichever partition is picked.
            for topology in [&response.current_topology, &response.stable_topology]
                .into_iter()
                .flatten()
            {
                selection.max_topology_id = selection.max_topology_id.max(topology.topology_id());
                selection.max_rebalance_id =
                    selection.max_rebalance_id.max(topology.rebalance_id());
            }

            let Some(max_stable) = &selection.max_stable else {
                continue;
            };
            let Some(stable) = &response.stable_topology else {
                continue;
            };
            if stable != max_stable {
                continue;
            }
            selection
                .partitions
                .insert(address.clone(), Arc::clone(stable));

            if let Some(current) = &response.current_topology {
                let larger = selection.max_topology.as_ref().map_or(true, |max| {
                    current.actual_members().len() > max.actual_members().len()
                });
                if larger {
                    selection.max_topology = Some(Arc::clone(current));
                }
            }
        }

        selection
    }

    /// The topology every node adopts after the merge, if one can be built.
    pub(crate) fn merged_topology(&self, cache_name: &str) -> Option<CacheTopology> {
        let max_topology = self.max_topology.as_ref()?;
        let built = CacheTopology::builder(
            self.max_topology_id + 1,
            self.max_rebalance_id + 1,
            Arc::clone(max_topology.current_ch()),
        )
        .actual_members(max_topology.actual_members().to_vec())
        .persistent_uuids(max_topology.persistent_uuids().to_vec())
        .build();

        match built {
            Ok(topology) => Some(topology),
            Err(e) => {
                tracing::error!(cache = %cache_name, error = %e, "Failed to build merged topology");
                None
            }
        }
    }
}
