//! Coordinator-side topology bookkeeping for one cache.
//!
//! [`ClusterCacheStatus`] owns the current and stable topologies, the
//! expected member list and the rebalance queue. Membership events are fed
//! to the availability strategy one at a time under a per-cache lock, and
//! every installed topology is published to subscribers.

use crate::config::StateTransferConfig;
use crate::error::Result;
use crate::partition::{
    AvailabilityMode, AvailabilityStrategy, AvailabilityStrategyContext, CacheStatusResponse,
};
use crate::topology::cache_topology::{CacheTopology, Phase};
use crate::topology::consistent_hash::{ConsistentHash, ConsistentHashFactory};
use crate::types::{Address, TopologyId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives rebalance confirmations from nodes that finished pulling state.
#[async_trait::async_trait]
pub trait RebalanceConfirmation: Send + Sync + std::fmt::Debug {
    /// `node` has received everything it needs under `topology_id`.
    async fn confirm_rebalance_phase(
        &self,
        cache_name: &str,
        node: &Address,
        topology_id: TopologyId,
    ) -> Result<()>;
}

/// Mutable per-cache state, only touched while the coordinator lock is held.
struct CacheStatusState {
    cache_name: String,
    factory: Arc<dyn ConsistentHashFactory>,
    num_owners: usize,
    num_segments: u32,
    current: Option<Arc<CacheTopology>>,
    stable: Option<Arc<CacheTopology>>,
    expected_members: Vec<Address>,
    persistent_uuids: HashMap<Address, Uuid>,
    availability_mode: AvailabilityMode,
    queued_rebalance: Option<Vec<Address>>,
    rebalancing_enabled: bool,
    awaiting_confirmation: BTreeSet<Address>,
    publisher: watch::Sender<Option<Arc<CacheTopology>>>,
}

impl CacheStatusState {
    fn uuids_for(&self, members: &[Address]) -> Vec<Uuid> {
        if members.iter().all(|m| self.persistent_uuids.contains_key(m)) {
            members.iter().map(|m| self.persistent_uuids[m]).collect()
        } else {
            Vec::new()
        }
    }

    fn next_ids(&self) -> (TopologyId, i32) {
        self.current
            .as_ref()
            .map_or((1, 1), |t| (t.topology_id() + 1, t.rebalance_id()))
    }

    fn install(&mut self, topology: CacheTopology) {
        let topology = Arc::new(topology);
        info!(
            cache = %self.cache_name,
            topology_id = topology.topology_id(),
            phase = %topology.phase(),
            members = ?topology.members(),
            "Installing topology"
        );

        self.awaiting_confirmation = match topology.phase() {
            Phase::NoRebalance => BTreeSet::new(),
            Phase::Rebalancing | Phase::ConflictResolution => {
                topology.actual_members().iter().cloned().collect()
            }
        };
        self.current = Some(Arc::clone(&topology));
        self.publisher.send_replace(Some(topology));
    }

    fn build_and_install(&mut self, built: Result<CacheTopology>) {
        match built {
            Ok(topology) => self.install(topology),
            Err(e) => error!(cache = %self.cache_name, error = %e, "Failed to build topology"),
        }
    }

    /// Install the first topology, owned entirely by `joiner`.
    fn initial_topology(&mut self, joiner: &Address) {
        let members = vec![joiner.clone()];
        let built = self
            .factory
            .create(&members, self.num_owners, self.num_segments)
            .and_then(|ch| {
                CacheTopology::builder(1, 1, ch)
                    .persistent_uuids(self.uuids_for(&members))
                    .build()
            });
        match built {
            Ok(topology) => {
                self.install(topology);
                self.stable = self.current.clone();
            }
            Err(e) => error!(cache = %self.cache_name, error = %e, "Failed to create initial topology"),
        }
    }

    fn start_queued_rebalance(&mut self) {
        if !self.rebalancing_enabled {
            debug!(cache = %self.cache_name, "Rebalancing disabled, keeping rebalance queued");
            return;
        }
        let Some(current) = self.current.clone() else {
            return;
        };
        if current.phase() != Phase::NoRebalance {
            return;
        }
        let Some(members) = self.queued_rebalance.take() else {
            return;
        };
        if members.is_empty() {
            return;
        }

        let pending = self
            .factory
            .update_members(current.current_ch(), &members)
            .and_then(|base| self.factory.rebalance(&base));
        let pending = match pending {
            Ok(pending) => pending,
            Err(e) => {
                error!(cache = %self.cache_name, error = %e, "Failed to compute pending hash");
                return;
            }
        };
        if pending == **current.current_ch() {
            debug!(cache = %self.cache_name, "Pending hash matches current, no rebalance needed");
            return;
        }

        let mut actual = current.members().to_vec();
        for member in pending.members() {
            if !actual.contains(member) {
                actual.push(member.clone());
            }
        }
        let uuids = self.uuids_for(&actual);

        info!(
            cache = %self.cache_name,
            rebalance_id = current.rebalance_id() + 1,
            members = ?pending.members(),
            "Starting rebalance"
        );
        let built = CacheTopology::builder(
            current.topology_id() + 1,
            current.rebalance_id() + 1,
            Arc::clone(current.current_ch()),
        )
        .pending(pending, Phase::Rebalancing)
        .actual_members(actual)
        .persistent_uuids(uuids)
        .build();
        self.build_and_install(built);
    }

    /// Make the pending hash current. Returns `true` if a rebalance ended.
    fn end_rebalance(&mut self) -> bool {
        let Some(current) = self.current.clone() else {
            return false;
        };
        let Some(pending) = current.pending_ch() else {
            return false;
        };

        let members = pending.members().to_vec();
        let built = CacheTopology::builder(
            current.topology_id() + 1,
            current.rebalance_id(),
            Arc::clone(pending),
        )
        .persistent_uuids(self.uuids_for(&members))
        .build();
        match built {
            Ok(topology) => {
                info!(
                    cache = %self.cache_name,
                    rebalance_id = topology.rebalance_id(),
                    "Rebalance finished"
                );
                self.install(topology);
                self.stable = self.current.clone();
                true
            }
            Err(e) => {
                error!(cache = %self.cache_name, error = %e, "Failed to end rebalance");
                false
            }
        }
    }

    fn restrict(&self, ch: &ConsistentHash, members: &[Address]) -> Result<ConsistentHash> {
        let kept: Vec<Address> = ch
            .members()
            .iter()
            .filter(|m| members.contains(m) || self.expected_members.contains(m))
            .cloned()
            .collect();
        self.factory.update_members(ch, &kept)
    }
}

impl AvailabilityStrategyContext for CacheStatusState {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    fn current_topology(&self) -> Option<Arc<CacheTopology>> {
        self.current.clone()
    }

    fn stable_topology(&self) -> Option<Arc<CacheTopology>> {
        self.stable.clone()
    }

    fn expected_members(&self) -> Vec<Address> {
        self.expected_members.clone()
    }

    fn availability_mode(&self) -> AvailabilityMode {
        self.availability_mode
    }

    fn update_current_topology(&mut self, members: &[Address]) {
        let Some(current) = self.current.clone() else {
            return;
        };
        let (topology_id, rebalance_id) = self.next_ids();

        let current_ch = match self.factory.update_members(current.current_ch(), members) {
            Ok(ch) => ch,
            Err(e) => {
                error!(cache = %self.cache_name, error = %e, "Failed to restrict current hash");
                return;
            }
        };

        let pending = match current.pending_ch() {
            Some(pending) if !members.is_empty() => match self.restrict(pending, members) {
                Ok(ch) if !ch.members().is_empty() => Some(ch),
                Ok(_) => None,
                Err(e) => {
                    warn!(cache = %self.cache_name, error = %e, "Dropping pending hash");
                    None
                }
            },
            _ => None,
        };

        let mut actual = members.to_vec();
        if let Some(pending) = &pending {
            for member in pending.members() {
                if !actual.contains(member) {
                    actual.push(member.clone());
                }
            }
        }
        let uuids = self.uuids_for(&actual);

        let mut builder = CacheTopology::builder(topology_id, rebalance_id, current_ch)
            .actual_members(actual)
            .persistent_uuids(uuids);
        if let Some(pending) = pending {
            builder = builder.pending(pending, current.phase());
        }
        self.build_and_install(builder.build());
    }

    fn queue_rebalance(&mut self, members: &[Address]) {
        debug!(cache = %self.cache_name, ?members, "Queueing rebalance");
        self.queued_rebalance = Some(members.to_vec());
        self.start_queued_rebalance();
    }

    fn update_topologies_after_merge(
        &mut self,
        current: Option<CacheTopology>,
        stable: Option<Arc<CacheTopology>>,
        availability_mode: Option<AvailabilityMode>,
    ) {
        if let Some(mode) = availability_mode {
            self.availability_mode = mode;
        }
        if let Some(stable) = stable {
            self.stable = Some(stable);
        }
        if let Some(current) = current {
            let current_id = self.current.as_ref().map(|t| t.topology_id());
            if current_id.map_or(false, |id| id >= current.topology_id()) {
                warn!(
                    cache = %self.cache_name,
                    received = current.topology_id(),
                    ?current_id,
                    "Merged topology is not newer than the installed one"
                );
                return;
            }
            for (member, uuid) in current.actual_members().iter().zip(current.persistent_uuids()) {
                self.persistent_uuids.insert(member.clone(), *uuid);
            }
            self.install(current);
        }
    }

    fn update_availability_mode(
        &mut self,
        members: &[Address],
        mode: AvailabilityMode,
        cancel_rebalance: bool,
    ) {
        info!(cache = %self.cache_name, %mode, "Updating availability mode");
        self.availability_mode = mode;
        if cancel_rebalance {
            self.queued_rebalance = None;
            if let Some(current) = self.current.clone() {
                let (topology_id, rebalance_id) = self.next_ids();
                let built = self
                    .factory
                    .update_members(current.current_ch(), members)
                    .and_then(|ch| {
                        CacheTopology::builder(topology_id, rebalance_id, ch)
                            .persistent_uuids(self.uuids_for(members))
                            .build()
                    });
                self.build_and_install(built);
                return;
            }
        }
        self.update_current_topology(members);
    }
}

/// Coordinator view of one cache.
pub struct ClusterCacheStatus {
    strategy: Arc<dyn AvailabilityStrategy>,
    state: Mutex<CacheStatusState>,
    publisher: watch::Sender<Option<Arc<CacheTopology>>>,
}

impl ClusterCacheStatus {
    /// Create the status for a cache with no members yet.
    pub fn new(
        cache_name: impl Into<String>,
        factory: Arc<dyn ConsistentHashFactory>,
        config: &StateTransferConfig,
        strategy: Arc<dyn AvailabilityStrategy>,
    ) -> Self {
        let (publisher, _rx) = watch::channel(None);
        let state = CacheStatusState {
            cache_name: cache_name.into(),
            factory,
            num_owners: config.num_owners,
            num_segments: config.num_segments,
            current: None,
            stable: None,
            expected_members: Vec::new(),
            persistent_uuids: HashMap::new(),
            availability_mode: AvailabilityMode::Available,
            queued_rebalance: None,
            rebalancing_enabled: config.enabled,
            awaiting_confirmation: BTreeSet::new(),
            publisher: publisher.clone(),
        };
        Self {
            strategy,
            state: Mutex::new(state),
            publisher,
        }
    }

    /// Name of the cache.
    pub fn cache_name(&self) -> String {
        self.state.lock().cache_name.clone()
    }

    /// Installed topology.
    pub fn current_topology(&self) -> Option<Arc<CacheTopology>> {
        self.state.lock().current.clone()
    }

    /// Last stable topology.
    pub fn stable_topology(&self) -> Option<Arc<CacheTopology>> {
        self.state.lock().stable.clone()
    }

    /// Expected members.
    pub fn expected_members(&self) -> Vec<Address> {
        self.state.lock().expected_members.clone()
    }

    /// Availability mode.
    pub fn availability_mode(&self) -> AvailabilityMode {
        self.state.lock().availability_mode
    }

    /// What this coordinator would report in a merge.
    pub fn status_response(&self) -> CacheStatusResponse {
        let state = self.state.lock();
        CacheStatusResponse::new(
            state.stable.clone(),
            state.current.clone(),
            state.availability_mode,
        )
    }

    /// Subscribe to installed topologies.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CacheTopology>>> {
        self.publisher.subscribe()
    }

    /// Handle a node joining the cache.
    #[tracing::instrument(skip(self, persistent_uuid))]
    pub fn node_joined(&self, joiner: Address, persistent_uuid: Option<Uuid>) {
        let mut state = self.state.lock();
        if let Some(uuid) = persistent_uuid {
            state.persistent_uuids.insert(joiner.clone(), uuid);
        }
        if !state.expected_members.contains(&joiner) {
            state.expected_members.push(joiner.clone());
        }

        if state.current.is_none() {
            state.initial_topology(&joiner);
            return;
        }
        self.strategy.on_join(&mut *state, &joiner);
    }

    /// Handle a node leaving gracefully.
    #[tracing::instrument(skip(self))]
    pub fn node_left(&self, leaver: Address) {
        let mut state = self.state.lock();
        state.expected_members.retain(|m| m != &leaver);
        self.strategy.on_graceful_leave(&mut *state, &leaver);
    }

    /// Handle a new cluster view.
    #[tracing::instrument(skip(self))]
    pub fn cluster_view_changed(&self, cluster_members: Vec<Address>) {
        let mut state = self.state.lock();
        state
            .expected_members
            .retain(|m| cluster_members.contains(m));
        self.strategy
            .on_cluster_view_change(&mut *state, &cluster_members);
    }

    /// Handle a healed split; `status` holds every reporting node's view.
    #[tracing::instrument(skip(self, status))]
    pub fn partition_merged(&self, status: BTreeMap<Address, CacheStatusResponse>) {
        let mut state = self.state.lock();
        let mut expected = state.expected_members.clone();
        for address in status.keys() {
            if !expected.contains(address) {
                expected.push(address.clone());
            }
        }
        state.expected_members = expected;
        self.strategy.on_partition_merge(&mut *state, &status);
    }

    /// Record that `node` finished the rebalance of `topology_id`. The last
    /// confirmation ends the rebalance.
    pub fn confirm_rebalance(&self, node: &Address, topology_id: TopologyId) {
        let mut state = self.state.lock();
        let current_id = state.current.as_ref().map(|t| t.topology_id());
        if current_id != Some(topology_id) {
            debug!(
                cache = %state.cache_name,
                %node,
                topology_id,
                ?current_id,
                "Ignoring confirmation for another topology"
            );
            return;
        }
        if !state.awaiting_confirmation.remove(node) {
            return;
        }
        debug!(
            cache = %state.cache_name,
            %node,
            remaining = state.awaiting_confirmation.len(),
            "Rebalance confirmed"
        );
        if !state.awaiting_confirmation.is_empty() {
            return;
        }

        if state.end_rebalance() {
            self.strategy.on_rebalance_end(&mut *state);
            state.start_queued_rebalance();
        }
    }

    /// Enable or disable rebalancing. Enabling starts any queued rebalance.
    pub fn set_rebalancing_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.rebalancing_enabled = enabled;
        if enabled {
            state.start_queued_rebalance();
        }
    }

    /// Ask the strategy for a different availability mode.
    pub fn force_availability_mode(&self, mode: AvailabilityMode) {
        let mut state = self.state.lock();
        self.strategy
            .on_manual_availability_change(&mut *state, mode);
    }
}

impl std::fmt::Debug for ClusterCacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClusterCacheStatus")
            .field("cache_name", &state.cache_name)
            .field("current", &state.current)
            .field("expected_members", &state.expected_members)
            .field("availability_mode", &state.availability_mode)
            .finish()
    }
}

#[async_trait::async_trait]
impl RebalanceConfirmation for ClusterCacheStatus {
    async fn confirm_rebalance_phase(
        &self,
        _cache_name: &str,
        node: &Address,
        topology_id: TopologyId,
    ) -> Result<()> {
        self.confirm_rebalance(node, topology_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{NoopEventListener, PreferAvailabilityStrategy, PreferConsistencyStrategy};
    use crate::topology::RingConsistentHashFactory;
    use test_log::test;

    fn a(name: &str) -> Address {
        Address::new(name)
    }

    fn status_with(strategy: Arc<dyn AvailabilityStrategy>) -> ClusterCacheStatus {
        let config = StateTransferConfig::default().with_num_segments(16);
        ClusterCacheStatus::new(
            "users",
            Arc::new(RingConsistentHashFactory::new()),
            &config,
            strategy,
        )
    }

    fn status() -> ClusterCacheStatus {
        status_with(Arc::new(PreferAvailabilityStrategy::new(
            Arc::new(NoopEventListener),
            None,
        )))
    }

    #[test]
    fn test_first_joiner_gets_stable_topology() {
        let status = status();
        let rx = status.subscribe();
        assert!(rx.borrow().is_none());

        status.node_joined(a("A"), Some(Uuid::new_v4()));

        let current = status.current_topology().unwrap();
        assert_eq!(current.topology_id(), 1);
        assert_eq!(current.rebalance_id(), 1);
        assert_eq!(current.phase(), Phase::NoRebalance);
        assert_eq!(current.members(), &[a("A")]);
        assert_eq!(current.persistent_uuids().len(), 1);
        assert_eq!(status.stable_topology(), Some(Arc::clone(&current)));
        assert_eq!(rx.borrow().as_ref().map(|t| t.topology_id()), Some(1));
    }

    #[test]
    fn test_rebalance_ends_after_every_confirmation() {
        let status = status();
        status.node_joined(a("A"), None);
        status.node_joined(a("B"), None);

        let rebalancing = status.current_topology().unwrap();
        assert_eq!(rebalancing.topology_id(), 2);
        assert_eq!(rebalancing.rebalance_id(), 2);
        assert_eq!(rebalancing.phase(), Phase::Rebalancing);
        assert!(rebalancing.pending_ch().unwrap().is_member(&a("B")));
        assert_eq!(rebalancing.actual_members(), &[a("A"), a("B")]);
        assert!(rebalancing.persistent_uuids().is_empty());

        status.confirm_rebalance(&a("A"), 2);
        assert_eq!(status.current_topology().unwrap().topology_id(), 2);

        // Stale and unknown confirmations change nothing.
        status.confirm_rebalance(&a("B"), 1);
        status.confirm_rebalance(&a("C"), 2);
        status.confirm_rebalance(&a("A"), 2);
        assert_eq!(status.current_topology().unwrap().phase(), Phase::Rebalancing);

        status.confirm_rebalance(&a("B"), 2);
        let stable = status.current_topology().unwrap();
        assert_eq!(stable.topology_id(), 3);
        assert_eq!(stable.rebalance_id(), 2);
        assert_eq!(stable.phase(), Phase::NoRebalance);
        assert!(stable.current_ch().is_member(&a("B")));
        assert_eq!(status.stable_topology().unwrap().topology_id(), 3);
    }

    #[test]
    fn test_disabled_rebalancing_keeps_rebalance_queued() {
        let status = status();
        status.node_joined(a("A"), None);
        status.set_rebalancing_enabled(false);
        status.node_joined(a("B"), None);

        let current = status.current_topology().unwrap();
        assert_eq!(current.topology_id(), 1);
        assert_eq!(status.expected_members(), vec![a("A"), a("B")]);

        status.set_rebalancing_enabled(true);
        let current = status.current_topology().unwrap();
        assert_eq!(current.topology_id(), 2);
        assert_eq!(current.phase(), Phase::Rebalancing);
    }

    #[test]
    fn test_leave_during_rebalance_restricts_pending_hash() {
        let status = status();
        status.node_joined(a("A"), None);
        status.node_joined(a("B"), None);
        status.node_joined(a("C"), None);
        assert_eq!(status.current_topology().unwrap().topology_id(), 2);

        status.node_left(a("C"));
        let current = status.current_topology().unwrap();
        assert_eq!(current.topology_id(), 3);
        assert_eq!(current.phase(), Phase::Rebalancing);
        assert!(!current.pending_ch().unwrap().is_member(&a("C")));
        assert_eq!(current.actual_members(), &[a("A"), a("B")]);

        status.confirm_rebalance(&a("A"), 3);
        status.confirm_rebalance(&a("B"), 3);
        let current = status.current_topology().unwrap();
        assert!(current.topology_id() >= 4);
        assert!(!current.is_member(&a("C")));
        assert!(current.current_ch().is_member(&a("B")));
    }

    #[test]
    fn test_status_response_reports_topologies() {
        let status = status();
        status.node_joined(a("A"), None);

        let response = status.status_response();
        assert_eq!(response.current_topology.unwrap().topology_id(), 1);
        assert_eq!(response.stable_topology.unwrap().topology_id(), 1);
        assert_eq!(response.availability_mode, AvailabilityMode::Available);
    }

    #[test]
    fn test_forced_degraded_mode_blocks_joins() {
        let status = status_with(Arc::new(PreferConsistencyStrategy::new(Arc::new(
            NoopEventListener,
        ))));
        status.node_joined(a("A"), None);
        status.force_availability_mode(AvailabilityMode::DegradedMode);
        assert_eq!(status.availability_mode(), AvailabilityMode::DegradedMode);
        let degraded_id = status.current_topology().unwrap().topology_id();

        status.node_joined(a("B"), None);
        assert_eq!(status.current_topology().unwrap().topology_id(), degraded_id);

        status.force_availability_mode(AvailabilityMode::Available);
        let current = status.current_topology().unwrap();
        assert_eq!(current.phase(), Phase::Rebalancing);
        assert!(current.pending_ch().unwrap().is_member(&a("B")));
    }
}
