//! Inbound state transfer.
//!
//! On every topology update the consumer works out which segments this node
//! must pull (owned in the pending hash but not in the current one), drops
//! whatever it was receiving under the previous topology, and asks one
//! surviving owner per segment for the state. When every requested segment
//! has delivered its last chunk, the rebalance is confirmed to the
//! coordinator.

use crate::config::StateTransferConfig;
use crate::error::Result;
use crate::metrics::StateTransferMetrics;
use crate::statetransfer::chunk::StateChunk;
use crate::statetransfer::collaborators::{DataContainer, TransactionTable};
use crate::statetransfer::command::{CommandResponse, StateTransferCommand};
use crate::statetransfer::transport::StateTransport;
use crate::topology::{CacheTopology, Phase, RebalanceConfirmation, TopologyHolder};
use crate::types::{Address, InternalEntry, SegmentId, SegmentSet, TopologyId, UNKNOWN_TOPOLOGY_ID};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bookkeeping for the rebalance this node is pulling state for.
#[derive(Debug)]
struct InboundState {
    /// Topology the outstanding requests were issued under.
    topology_id: TopologyId,
    rebalance_id: Option<i32>,
    /// Segments fully received during the current rebalance.
    received: SegmentSet,
    /// Source to segments still expected from it.
    transfers: HashMap<Address, SegmentSet>,
    /// Last topology this node confirmed.
    confirmed: Option<TopologyId>,
    last_topology: Option<Arc<CacheTopology>>,
}

/// What to do after a topology update, computed under the lock.
struct UpdatePlan {
    cancelled: Vec<(Address, SegmentSet)>,
    requests: BTreeMap<Address, SegmentSet>,
    no_longer_owned: SegmentSet,
    confirm: bool,
}

/// Pulls state for newly owned segments and applies incoming chunks.
pub struct StateConsumer {
    cache_name: String,
    local: Address,
    config: StateTransferConfig,
    topology: Arc<TopologyHolder>,
    container: Arc<dyn DataContainer>,
    transactions: Arc<dyn TransactionTable>,
    transport: Arc<dyn StateTransport>,
    confirmation: Arc<dyn RebalanceConfirmation>,
    state: Mutex<InboundState>,
    metrics: Arc<StateTransferMetrics>,
}

impl StateConsumer {
    /// Create a new consumer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache_name: impl Into<String>,
        config: StateTransferConfig,
        topology: Arc<TopologyHolder>,
        container: Arc<dyn DataContainer>,
        transactions: Arc<dyn TransactionTable>,
        transport: Arc<dyn StateTransport>,
        confirmation: Arc<dyn RebalanceConfirmation>,
        metrics: Arc<StateTransferMetrics>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            local: transport.local_address().clone(),
            config,
            topology,
            container,
            transactions,
            transport,
            confirmation,
            state: Mutex::new(InboundState {
                topology_id: UNKNOWN_TOPOLOGY_ID,
                rebalance_id: None,
                received: SegmentSet::new(),
                transfers: HashMap::new(),
                confirmed: None,
                last_topology: None,
            }),
            metrics,
        }
    }

    /// React to a newly installed topology.
    #[tracing::instrument(skip_all, fields(cache = %self.cache_name, topology_id = topology.topology_id()))]
    pub async fn on_topology_update(self: &Arc<Self>, topology: Arc<CacheTopology>) -> Result<()> {
        let Some(plan) = self.plan_update(&topology) else {
            return Ok(());
        };
        let topology_id = topology.topology_id();

        for (source, segments) in plan.cancelled {
            if !topology.is_member(&source) {
                continue;
            }
            let transport = Arc::clone(&self.transport);
            let command = StateTransferCommand::CancelOutbound {
                cache_name: self.cache_name.clone(),
                topology_id,
                segments,
            };
            tokio::spawn(async move {
                if let Err(e) = transport.send(&source, command.into()).await {
                    debug!(%source, error = %e, "Failed to send courtesy cancel");
                }
            });
        }

        if !plan.no_longer_owned.is_empty() {
            let removed = self.container.remove_segments(&plan.no_longer_owned).await?;
            debug!(
                segments = plan.no_longer_owned.len(),
                removed, "Removed entries of segments no longer owned"
            );
        }

        for (source, segments) in plan.requests {
            let consumer = Arc::clone(self);
            tokio::spawn(async move {
                consumer.request_segments(source, topology_id, segments).await;
            });
        }

        if plan.confirm {
            self.spawn_confirm(topology_id);
        }
        Ok(())
    }

    fn plan_update(&self, topology: &Arc<CacheTopology>) -> Option<UpdatePlan> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state
            .last_topology
            .as_ref()
            .map_or(false, |t| t.topology_id() >= topology.topology_id())
        {
            return None;
        }
        let previous = state.last_topology.replace(Arc::clone(topology));
        state.topology_id = topology.topology_id();

        let cancelled: Vec<(Address, SegmentSet)> = state
            .transfers
            .drain()
            .filter(|(_, segments)| !segments.is_empty())
            .collect();
        if !cancelled.is_empty() {
            debug!(sources = cancelled.len(), "Dropping inbound transfers of older topology");
        }

        let no_longer_owned = match &previous {
            Some(previous) => {
                let owned_now = topology.write_consistent_hash().segments_for_owner(&self.local);
                let owned_before = previous.write_consistent_hash().segments_for_owner(&self.local);
                let dropped: SegmentSet = owned_before.difference(&owned_now).copied().collect();
                dropped
            }
            None => SegmentSet::new(),
        };

        let rebalancing = topology.phase() == Phase::Rebalancing;
        let mut needed = SegmentSet::new();
        if let (true, Some(pending)) = (rebalancing, topology.pending_ch()) {
            if state.rebalance_id != Some(topology.rebalance_id()) {
                state.rebalance_id = Some(topology.rebalance_id());
                state.received.clear();
            }
            if self.config.enabled {
                let current_owned = topology.current_ch().segments_for_owner(&self.local);
                needed = pending
                    .segments_for_owner(&self.local)
                    .difference(&current_owned)
                    .filter(|s| !state.received.contains(*s))
                    .copied()
                    .collect();
            }
        }

        let mut requests: BTreeMap<Address, SegmentSet> = BTreeMap::new();
        let mut unavailable = SegmentSet::new();
        for segment in needed {
            let source = topology
                .current_ch()
                .owners_for_segment(segment)
                .iter()
                .find(|owner| **owner != self.local && topology.is_member(owner));
            match source {
                Some(source) => {
                    requests.entry(source.clone()).or_default().insert(segment);
                }
                None => {
                    unavailable.insert(segment);
                }
            }
        }
        if !unavailable.is_empty() {
            warn!(?unavailable, "No owner left to pull segments from");
            state.received.extend(unavailable);
        }

        state.transfers = requests
            .iter()
            .map(|(source, segments)| (source.clone(), segments.clone()))
            .collect();
        self.metrics.inbound_active.set(requests.len() as i64);

        let confirm = rebalancing
            && requests.is_empty()
            && state.confirmed != Some(topology.topology_id());
        if confirm {
            state.confirmed = Some(topology.topology_id());
        }

        if !requests.is_empty() {
            info!(
                sources = requests.len(),
                segments = requests.values().map(|s| s.len()).sum::<usize>(),
                "Requesting state"
            );
        }

        Some(UpdatePlan {
            cancelled,
            requests,
            no_longer_owned,
            confirm,
        })
    }

    async fn request_segments(&self, source: Address, topology_id: TopologyId, segments: SegmentSet) {
        let get_transactions = StateTransferCommand::GetTransactions {
            cache_name: self.cache_name.clone(),
            topology_id,
            segments: segments.clone(),
        };
        match self.transport.invoke(&source, get_transactions).await {
            Ok(CommandResponse::Transactions(transactions)) => {
                self.transactions
                    .apply_remote_transactions(&source, transactions);
            }
            Ok(CommandResponse::Ignored) => {
                debug!(cache = %self.cache_name, %source, topology_id, "Source has a newer topology");
                return;
            }
            Ok(other) => {
                warn!(cache = %self.cache_name, %source, ?other, "Unexpected response to transaction request");
                return;
            }
            Err(e) => {
                warn!(cache = %self.cache_name, %source, error = %e, "Failed to fetch transactions");
                return;
            }
        }

        let start = StateTransferCommand::StartOutbound {
            cache_name: self.cache_name.clone(),
            topology_id,
            segments,
            is_rebalance: true,
        };
        match self.transport.invoke(&source, start).await {
            Ok(CommandResponse::Ack) => {}
            Ok(other) => {
                warn!(cache = %self.cache_name, %source, ?other, "State transfer request not accepted");
            }
            Err(e) => {
                warn!(cache = %self.cache_name, %source, error = %e, "Failed to request state");
            }
        }
    }

    /// Apply chunks received from `origin`.
    ///
    /// Chunks stamped with an older topology are discarded, pushed or not.
    /// Pulled chunks must also be for segments currently requested from
    /// `origin`; pushed chunks are accepted for segments this node is a write
    /// owner of in the installed topology. Returns once every accepted entry
    /// is visible to local reads.
    pub async fn apply_state(
        &self,
        origin: &Address,
        topology_id: TopologyId,
        push_transfer: bool,
        chunks: Vec<StateChunk>,
    ) -> Result<()> {
        let Some(topology) = self.topology.current() else {
            self.metrics.chunks_discarded.inc_by(chunks.len() as u64);
            return Ok(());
        };
        if topology_id < topology.topology_id() {
            debug!(
                cache = %self.cache_name,
                %origin,
                topology_id,
                current = topology.topology_id(),
                push_transfer,
                "Discarding stale state"
            );
            self.metrics.chunks_discarded.inc_by(chunks.len() as u64);
            return Ok(());
        }

        for chunk in chunks {
            let accepted = if push_transfer {
                topology.is_write_owner(&self.local, chunk.segment_id)
            } else {
                let state = self.state.lock();
                state.topology_id == topology_id
                    && state
                        .transfers
                        .get(origin)
                        .map_or(false, |segments| segments.contains(&chunk.segment_id))
            };
            if !accepted {
                debug!(
                    cache = %self.cache_name,
                    %origin,
                    segment = chunk.segment_id,
                    push_transfer,
                    "Discarding unrequested chunk"
                );
                self.metrics.chunks_discarded.inc();
                continue;
            }

            for entry in chunk.entries {
                self.apply_entry(entry, push_transfer).await?;
            }
            self.metrics.chunks_applied.inc();

            if chunk.is_last_chunk && !push_transfer {
                self.segment_received(origin, topology_id, chunk.segment_id);
            }
        }
        Ok(())
    }

    /// Write a transferred entry unless the local copy is newer. Pushed
    /// entries are merge results and always overwrite.
    async fn apply_entry(&self, entry: InternalEntry, overwrite: bool) -> Result<()> {
        if overwrite {
            self.container.put(entry).await?;
            self.metrics.entries_applied.inc();
            return Ok(());
        }
        if let Some(existing) = self.container.get(&entry.key).await {
            let newer_locally = match (existing.metadata.version, entry.metadata.version) {
                (Some(local), Some(incoming)) => local > incoming,
                _ => false,
            };
            if newer_locally || (!entry.has_value() && existing.has_value()) {
                return Ok(());
            }
        }
        self.container.put(entry).await?;
        self.metrics.entries_applied.inc();
        Ok(())
    }

    fn segment_received(&self, origin: &Address, topology_id: TopologyId, segment: SegmentId) {
        let confirm = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.topology_id != topology_id {
                return;
            }

            let drained = match state.transfers.get_mut(origin) {
                Some(segments) => {
                    segments.remove(&segment);
                    segments.is_empty()
                }
                None => false,
            };
            if drained {
                state.transfers.remove(origin);
                self.metrics.inbound_active.dec();
            }
            state.received.insert(segment);

            let rebalancing = state
                .last_topology
                .as_ref()
                .map_or(false, |t| t.phase() == Phase::Rebalancing);
            let done = rebalancing
                && state.transfers.is_empty()
                && state.confirmed != Some(topology_id);
            if done {
                state.confirmed = Some(topology_id);
            }
            done
        };

        if confirm {
            info!(cache = %self.cache_name, topology_id, "All requested state received");
            self.spawn_confirm(topology_id);
        }
    }

    fn spawn_confirm(&self, topology_id: TopologyId) {
        let confirmation = Arc::clone(&self.confirmation);
        let cache_name = self.cache_name.clone();
        let local = self.local.clone();
        tokio::spawn(async move {
            if let Err(e) = confirmation
                .confirm_rebalance_phase(&cache_name, &local, topology_id)
                .await
            {
                warn!(cache = %cache_name, topology_id, error = %e, "Failed to confirm rebalance");
            }
        });
    }

    /// Whether any requested segment is still outstanding.
    pub fn has_inbound_transfers(&self) -> bool {
        !self.state.lock().transfers.is_empty()
    }

    /// Segments still expected from `source`.
    pub fn inbound_segments_from(&self, source: &Address) -> SegmentSet {
        self.state
            .lock()
            .transfers
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    /// Segments received during the current rebalance.
    pub fn received_segments(&self) -> SegmentSet {
        self.state.lock().received.clone()
    }
}

impl std::fmt::Debug for StateConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StateConsumer")
            .field("cache_name", &self.cache_name)
            .field("local", &self.local)
            .field("topology_id", &state.topology_id)
            .field("inbound", &state.transfers)
            .finish()
    }
}
