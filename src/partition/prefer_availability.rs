//! Availability strategy that keeps every partition serving.

use crate::conflict::{ConflictManager, MergeInfo};
use crate::partition::context::{AvailabilityMode, AvailabilityStrategyContext};
use crate::partition::events::{TopologyEvent, TopologyEventListener};
use crate::partition::status::CacheStatusResponse;
use crate::partition::strategy::{
    check_for_lost_data, current_members, AvailabilityStrategy, MergeSelection,
};
use crate::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Stays available through splits and reconciles divergent copies on merge
/// when a conflict manager is configured.
pub struct PreferAvailabilityStrategy {
    listener: Arc<dyn TopologyEventListener>,
    conflict_manager: Option<Arc<dyn ConflictManager>>,
}

impl PreferAvailabilityStrategy {
    /// Create a new strategy. Without a conflict manager merges never trigger
    /// conflict resolution.
    pub fn new(
        listener: Arc<dyn TopologyEventListener>,
        conflict_manager: Option<Arc<dyn ConflictManager>>,
    ) -> Self {
        Self {
            listener,
            conflict_manager,
        }
    }
}

impl AvailabilityStrategy for PreferAvailabilityStrategy {
    fn on_join(&self, ctx: &mut dyn AvailabilityStrategyContext, joiner: &Address) {
        debug!(cache = %ctx.cache_name(), %joiner, "Queueing rebalance for joiner");
        let expected = ctx.expected_members();
        ctx.queue_rebalance(&expected);
    }

    fn on_graceful_leave(&self, ctx: &mut dyn AvailabilityStrategyContext, leaver: &Address) {
        let Some(mut new_members) = current_members(ctx) else {
            debug!(cache = %ctx.cache_name(), %leaver, "No topology installed, ignoring leave");
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
        let expected = ctx.expected_members();
        ctx.queue_rebalance(&expected);
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
            debug!(cache = %ctx.cache_name(), "No members lost, skipping view change");
            return;
        }

        check_for_lost_data(ctx, self.listener.as_ref(), &new_members);
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
        let selection = MergeSelection::select(status);
        let expected = ctx.expected_members();

        info!(
            cache = %cache_name,
            nodes = status.len(),
            max_topology_id = selection.max_topology_id,
            "Handling partition merge"
        );

        if let (Some(max_stable), Some(max_topology)) =
            (&selection.max_stable, &selection.max_topology)
        {
            let split_healed = max_topology.actual_members().len() > 1
                && expected.len() > max_stable.members().len();
            if split_healed {
                if let Some(conflict_manager) = &self.conflict_manager {
                    let topology_id = selection.max_topology_id + 1;
                    self.listener.on_event(&TopologyEvent::ConflictResolutionStarted {
                        cache: cache_name.clone(),
                        topology_id,
                        preferred_members: max_stable.members().to_vec(),
                    });
                    conflict_manager.resolve_conflicts(MergeInfo {
                        topology_id,
                        consistent_hash: Arc::clone(max_stable.current_ch()),
                        partitions: selection.partitions.clone(),
                        members: expected.clone(),
                    });
                }
            }
        }

        let merged = selection.merged_topology(&cache_name);
        let merged_members = merged.as_ref().map(|t| t.members().to_vec());
        ctx.update_topologies_after_merge(merged, selection.max_stable.clone(), None);

        if let Some(merged_members) = merged_members {
            let surviving: Vec<Address> = expected
                .iter()
                .filter(|m| merged_members.contains(m))
                .cloned()
                .collect();
            if surviving.len() != merged_members.len() {
                check_for_lost_data(ctx, self.listener.as_ref(), &surviving);
            }
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
        debug!(cache = %ctx.cache_name(), ?mode, "Ignoring availability change, cache stays available");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::EventLevel;
    use crate::testing::{
        addrs, hash_of, stable_topology, ContextCall, RecordingConflictManager, RecordingContext,
        RecordingEventListener,
    };
    use crate::topology::CacheTopology;
    use crate::types::segments;
    use test_log::test;

    const CACHE: &str = "orders";

    fn strategy(listener: &Arc<RecordingEventListener>) -> PreferAvailabilityStrategy {
        PreferAvailabilityStrategy::new(Arc::clone(listener) as Arc<dyn TopologyEventListener>, None)
    }

    fn three_node_topology() -> CacheTopology {
        // Every segment has a copy outside C.
        let ch = hash_of(
            &["A", "B", "C"],
            &[&["A", "B"], &["B", "C"], &["C", "A"], &["A", "B"]],
        );
        stable_topology(5, ch)
    }

    #[test]
    fn test_join_queues_rebalance_over_expected_members() {
        let listener = RecordingEventListener::new();
        let mut ctx = RecordingContext::new(CACHE, three_node_topology())
            .with_expected_members(addrs(&["A", "B", "C", "D"]));

        strategy(&listener).on_join(&mut ctx, &Address::new("D"));

        assert_eq!(ctx.calls(), &[ContextCall::QueueRebalance(addrs(&["A", "B", "C", "D"]))]);
        assert!(listener.events().is_empty());
    }

    #[test]
    fn test_graceful_leave_without_unique_data() {
        let listener = RecordingEventListener::new();
        let mut ctx = RecordingContext::new(CACHE, three_node_topology())
            .with_expected_members(addrs(&["A", "B"]));

        strategy(&listener).on_graceful_leave(&mut ctx, &Address::new("C"));

        assert!(listener.events().is_empty());
        assert_eq!(ctx.topology_updates(), vec![addrs(&["A", "B"])]);
        assert_eq!(ctx.queued_rebalances(), vec![addrs(&["A", "B"])]);

        let current = ctx.current_topology().unwrap();
        assert_eq!(current.topology_id(), 6);
        assert_eq!(current.members(), addrs(&["A", "B"]).as_slice());
    }

    #[test]
    fn test_graceful_leave_of_sole_owner_warns() {
        let listener = RecordingEventListener::new();
        let ch = hash_of(&["A", "B", "C"], &[&["A"], &["B"], &["C"], &["A"]]);
        let mut ctx = RecordingContext::new(CACHE, stable_topology(3, ch))
            .with_expected_members(addrs(&["A", "B"]));

        strategy(&listener).on_graceful_leave(&mut ctx, &Address::new("C"));

        assert_eq!(
            listener.events(),
            vec![TopologyEvent::DataLostGracefulLeave {
                cache: CACHE.to_string(),
                leaver: Address::new("C"),
                lost_segments: segments([2]),
            }]
        );
        assert!(!listener.has_fatal());
        // The cache stays available and still rebalances.
        assert_eq!(ctx.queued_rebalances(), vec![addrs(&["A", "B"])]);
    }

    #[test]
    fn test_last_member_leaving_reports_no_members() {
        let listener = RecordingEventListener::new();
        let ch = hash_of(&["A"], &[&["A"], &["A"]]);
        let mut ctx = RecordingContext::new(CACHE, stable_topology(2, ch))
            .with_expected_members(Vec::new());

        strategy(&listener).on_graceful_leave(&mut ctx, &Address::new("A"));

        assert_eq!(
            listener.events(),
            vec![TopologyEvent::NoMembers {
                cache: CACHE.to_string()
            }]
        );
        assert_eq!(ctx.calls(), &[ContextCall::UpdateCurrentTopology(Vec::new())]);
    }

    #[test]
    fn test_crash_of_sole_owner_is_fatal() {
        let listener = RecordingEventListener::new();
        let ch = hash_of(&["A", "B", "C"], &[&["A"], &["B"], &["C"], &["C"]]);
        let mut ctx = RecordingContext::new(CACHE, stable_topology(4, ch))
            .with_expected_members(addrs(&["A", "B"]));

        strategy(&listener).on_cluster_view_change(&mut ctx, &addrs(&["A", "B"]));

        assert_eq!(
            listener.events(),
            vec![TopologyEvent::DataLostAbruptLeave {
                cache: CACHE.to_string(),
                lost_members: addrs(&["C"]),
            }]
        );
        assert!(listener.has_fatal());
        assert_eq!(
            ctx.calls(),
            &[
                ContextCall::UpdateCurrentTopology(addrs(&["A", "B"])),
                ContextCall::QueueRebalance(addrs(&["A", "B"])),
            ]
        );
    }

    #[test]
    fn test_minority_view_stays_available() {
        let listener = RecordingEventListener::new();
        let ch = hash_of(
            &["A", "B", "C", "D", "E"],
            &[&["A", "C", "D"], &["B", "D", "E"], &["A", "B", "E"], &["B", "C", "A"]],
        );
        let mut ctx = RecordingContext::new(CACHE, stable_topology(8, ch))
            .with_expected_members(addrs(&["A", "B"]));

        strategy(&listener).on_cluster_view_change(&mut ctx, &addrs(&["A", "B"]));

        let events = listener.events_at(EventLevel::Warn);
        assert_eq!(
            events,
            vec![TopologyEvent::MinorityPartition {
                cache: CACHE.to_string(),
                new_members: addrs(&["A", "B"]),
                lost_members: addrs(&["C", "D", "E"]),
                stable_members: addrs(&["A", "B", "C", "D", "E"]),
            }]
        );
        assert_eq!(ctx.topology_updates(), vec![addrs(&["A", "B"])]);
        assert_eq!(ctx.queued_rebalances(), vec![addrs(&["A", "B"])]);
    }

    #[test]
    fn test_view_change_without_lost_members_is_ignored() {
        let listener = RecordingEventListener::new();
        let mut ctx = RecordingContext::new(CACHE, three_node_topology());

        strategy(&listener).on_cluster_view_change(&mut ctx, &addrs(&["A", "B", "C", "D"]));

        assert!(ctx.calls().is_empty());
        assert!(listener.events().is_empty());
    }

    /// A and B kept a two-member stable topology; C was on its own and moved
    /// further ahead in topology ids.
    fn split_status() -> BTreeMap<Address, CacheStatusResponse> {
        let ab = Arc::new(stable_topology(5, hash_of(&["A", "B"], &[&["A", "B"], &["B", "A"]])));
        let c_stable = Arc::new(stable_topology(7, hash_of(&["C"], &[&["C"], &["C"]])));
        let c_current = Arc::new(stable_topology(8, hash_of(&["C"], &[&["C"], &["C"]])));

        let mut status = BTreeMap::new();
        for name in ["A", "B"] {
            status.insert(
                Address::new(name),
                CacheStatusResponse::new(Some(Arc::clone(&ab)), Some(Arc::clone(&ab)), AvailabilityMode::Available),
            );
        }
        status.insert(
            Address::new("C"),
            CacheStatusResponse::new(Some(c_stable), Some(c_current), AvailabilityMode::Available),
        );
        status
    }

    #[test]
    fn test_merge_installs_topology_newer_than_every_partition() {
        let listener = RecordingEventListener::new();
        let mut ctx = RecordingContext::empty(CACHE).with_expected_members(addrs(&["A", "B", "C"]));

        strategy(&listener).on_partition_merge(&mut ctx, &split_status());

        assert_eq!(
            ctx.calls(),
            &[
                ContextCall::UpdateTopologiesAfterMerge {
                    current: Some(9),
                    stable: Some(5),
                    availability_mode: None,
                },
                ContextCall::UpdateCurrentTopology(addrs(&["A", "B"])),
                ContextCall::QueueRebalance(addrs(&["A", "B", "C"])),
            ]
        );
        // No conflict manager configured.
        assert!(listener.events().is_empty());
    }

    #[test]
    fn test_healed_split_starts_conflict_resolution() {
        let listener = RecordingEventListener::new();
        let conflict_manager = RecordingConflictManager::new();
        let strategy = PreferAvailabilityStrategy::new(
            Arc::clone(&listener) as Arc<dyn TopologyEventListener>,
            Some(Arc::clone(&conflict_manager) as Arc<dyn ConflictManager>),
        );
        let mut ctx = RecordingContext::empty(CACHE).with_expected_members(addrs(&["A", "B", "C"]));

        strategy.on_partition_merge(&mut ctx, &split_status());

        let merges = conflict_manager.merges();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].topology_id, 9);
        assert_eq!(merges[0].members, addrs(&["A", "B", "C"]));
        assert_eq!(
            merges[0].partitions.keys().cloned().collect::<Vec<_>>(),
            addrs(&["A", "B"])
        );
        assert_eq!(merges[0].consistent_hash.members(), addrs(&["A", "B"]).as_slice());

        assert_eq!(
            listener.events(),
            vec![TopologyEvent::ConflictResolutionStarted {
                cache: CACHE.to_string(),
                topology_id: 9,
                preferred_members: addrs(&["A", "B"]),
            }]
        );
    }

    #[test]
    fn test_merge_of_single_partition_skips_conflict_resolution() {
        let listener = RecordingEventListener::new();
        let conflict_manager = RecordingConflictManager::new();
        let strategy = PreferAvailabilityStrategy::new(
            Arc::clone(&listener) as Arc<dyn TopologyEventListener>,
            Some(Arc::clone(&conflict_manager) as Arc<dyn ConflictManager>),
        );
        let topology = Arc::new(three_node_topology());
        let status: BTreeMap<Address, CacheStatusResponse> = addrs(&["A", "B", "C"])
            .into_iter()
            .map(|a| {
                let response = CacheStatusResponse::new(
                    Some(Arc::clone(&topology)),
                    Some(Arc::clone(&topology)),
                    AvailabilityMode::Available,
                );
                (a, response)
            })
            .collect();
        let mut ctx = RecordingContext::empty(CACHE).with_expected_members(addrs(&["A", "B", "C"]));

        strategy.on_partition_merge(&mut ctx, &status);

        assert!(conflict_manager.merges().is_empty());
        assert_eq!(ctx.queued_rebalances(), vec![addrs(&["A", "B", "C"])]);
    }
}
