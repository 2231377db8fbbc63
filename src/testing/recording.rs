//! Recording doubles for driving the availability strategies directly.

use crate::conflict::{ConflictManager, MergeInfo, StateReceiver};
use crate::error::Result;
use crate::partition::{
    AvailabilityMode, AvailabilityStrategyContext, EventLevel, TopologyEvent,
    TopologyEventListener,
};
use crate::topology::{
    CacheTopology, ConsistentHashFactory, RebalanceConfirmation, RingConsistentHashFactory,
};
use crate::statetransfer::StateChunk;
use crate::types::{Address, TopologyId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Collects every event it is given.
#[derive(Debug, Default)]
pub struct RecordingEventListener {
    events: Mutex<Vec<TopologyEvent>>,
}

impl RecordingEventListener {
    /// Create an empty listener.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events, oldest first.
    pub fn events(&self) -> Vec<TopologyEvent> {
        self.events.lock().clone()
    }

    /// Events at `level`.
    pub fn events_at(&self, level: EventLevel) -> Vec<TopologyEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level() == level)
            .cloned()
            .collect()
    }

    /// Whether a fatal event was raised.
    pub fn has_fatal(&self) -> bool {
        !self.events_at(EventLevel::Fatal).is_empty()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TopologyEventListener for RecordingEventListener {
    fn on_event(&self, event: &TopologyEvent) {
        self.events.lock().push(event.clone());
    }
}

/// A call a strategy made on its context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextCall {
    UpdateCurrentTopology(Vec<Address>),
    QueueRebalance(Vec<Address>),
    UpdateTopologiesAfterMerge {
        current: Option<TopologyId>,
        stable: Option<TopologyId>,
        availability_mode: Option<AvailabilityMode>,
    },
    UpdateAvailabilityMode {
        members: Vec<Address>,
        mode: AvailabilityMode,
        cancel_rebalance: bool,
    },
}

/// Context that applies topology updates locally and records every call.
#[derive(Debug)]
pub struct RecordingContext {
    cache_name: String,
    factory: RingConsistentHashFactory,
    current: Option<Arc<CacheTopology>>,
    stable: Option<Arc<CacheTopology>>,
    expected_members: Vec<Address>,
    availability_mode: AvailabilityMode,
    calls: Vec<ContextCall>,
}

impl RecordingContext {
    /// A context whose current and stable topology is `topology` and whose
    /// expected members are its members.
    pub fn new(cache_name: impl Into<String>, topology: CacheTopology) -> Self {
        let expected_members = topology.members().to_vec();
        let topology = Arc::new(topology);
        Self {
            cache_name: cache_name.into(),
            factory: RingConsistentHashFactory::new(),
            current: Some(Arc::clone(&topology)),
            stable: Some(topology),
            expected_members,
            availability_mode: AvailabilityMode::Available,
            calls: Vec::new(),
        }
    }

    /// A context with nothing installed.
    pub fn empty(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            factory: RingConsistentHashFactory::new(),
            current: None,
            stable: None,
            expected_members: Vec::new(),
            availability_mode: AvailabilityMode::Available,
            calls: Vec::new(),
        }
    }

    /// Replace the expected members.
    pub fn with_expected_members(mut self, members: Vec<Address>) -> Self {
        self.expected_members = members;
        self
    }

    /// Replace the availability mode.
    pub fn with_availability_mode(mut self, mode: AvailabilityMode) -> Self {
        self.availability_mode = mode;
        self
    }

    /// Every call made so far.
    pub fn calls(&self) -> &[ContextCall] {
        &self.calls
    }

    /// Member lists passed to `queue_rebalance`.
    pub fn queued_rebalances(&self) -> Vec<Vec<Address>> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                ContextCall::QueueRebalance(members) => Some(members.clone()),
                _ => None,
            })
            .collect()
    }

    /// Member lists passed to `update_current_topology`.
    pub fn topology_updates(&self) -> Vec<Vec<Address>> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                ContextCall::UpdateCurrentTopology(members) => Some(members.clone()),
                _ => None,
            })
            .collect()
    }

    fn restrict_current(&mut self, members: &[Address]) {
        let Some(current) = self.current.clone() else {
            return;
        };
        let built = self
            .factory
            .update_members(current.current_ch(), members)
            .and_then(|ch| {
                CacheTopology::builder(current.topology_id() + 1, current.rebalance_id(), ch)
                    .build()
            });
        if let Ok(topology) = built {
            self.current = Some(Arc::new(topology));
        }
    }
}

impl AvailabilityStrategyContext for RecordingContext {
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
        self.calls
            .push(ContextCall::UpdateCurrentTopology(members.to_vec()));
        self.restrict_current(members);
    }

    fn queue_rebalance(&mut self, members: &[Address]) {
        self.calls.push(ContextCall::QueueRebalance(members.to_vec()));
    }

    fn update_topologies_after_merge(
        &mut self,
        current: Option<CacheTopology>,
        stable: Option<Arc<CacheTopology>>,
        availability_mode: Option<AvailabilityMode>,
    ) {
        self.calls.push(ContextCall::UpdateTopologiesAfterMerge {
            current: current.as_ref().map(|t| t.topology_id()),
            stable: stable.as_ref().map(|t| t.topology_id()),
            availability_mode,
        });
        if let Some(current) = current {
            self.current = Some(Arc::new(current));
        }
        if let Some(stable) = stable {
            self.stable = Some(stable);
        }
        if let Some(mode) = availability_mode {
            self.availability_mode = mode;
        }
    }

    fn update_availability_mode(
        &mut self,
        members: &[Address],
        mode: AvailabilityMode,
        cancel_rebalance: bool,
    ) {
        self.calls.push(ContextCall::UpdateAvailabilityMode {
            members: members.to_vec(),
            mode,
            cancel_rebalance,
        });
        self.availability_mode = mode;
        self.restrict_current(members);
    }
}

/// Records rebalance confirmations instead of forwarding them.
#[derive(Debug, Default)]
pub struct RecordingConfirmation {
    confirmed: Mutex<Vec<(Address, TopologyId)>>,
}

impl RecordingConfirmation {
    /// Create an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `(node, topology id)` pairs confirmed so far.
    pub fn confirmed(&self) -> Vec<(Address, TopologyId)> {
        self.confirmed.lock().clone()
    }
}

#[async_trait::async_trait]
impl RebalanceConfirmation for RecordingConfirmation {
    async fn confirm_rebalance_phase(
        &self,
        _cache_name: &str,
        node: &Address,
        topology_id: TopologyId,
    ) -> Result<()> {
        self.confirmed.lock().push((node.clone(), topology_id));
        Ok(())
    }
}

/// Conflict manager that records merges and drops any state sent to it.
#[derive(Debug, Default)]
pub struct RecordingConflictManager {
    merges: Mutex<Vec<MergeInfo>>,
    receiver: Arc<DiscardingReceiver>,
}

impl RecordingConflictManager {
    /// Create an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Merges handed to this manager.
    pub fn merges(&self) -> Vec<MergeInfo> {
        self.merges.lock().clone()
    }
}

impl ConflictManager for RecordingConflictManager {
    fn state_receiver(&self) -> Arc<dyn StateReceiver> {
        Arc::clone(&self.receiver) as Arc<dyn StateReceiver>
    }

    fn resolve_conflicts(&self, merge_info: MergeInfo) {
        self.merges.lock().push(merge_info);
    }
}

#[derive(Debug, Default)]
struct DiscardingReceiver;

#[async_trait::async_trait]
impl StateReceiver for DiscardingReceiver {
    async fn receive_state(
        &self,
        _origin: &Address,
        _topology_id: TopologyId,
        _chunks: Vec<StateChunk>,
    ) -> Result<()> {
        Ok(())
    }
}
