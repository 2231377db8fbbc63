//! Outbound state transfer.
//!
//! Each start request spawns one task per (destination, request) that walks
//! the requested segments and streams them as chunks. A task's remaining
//! segments sit behind an async mutex that is held across every send, so once
//! [`StateProvider::cancel_outbound_transfer`] returns no further chunk of a
//! cancelled segment leaves this node.

use crate::config::StateTransferConfig;
use crate::error::{Result, TopologyError};
use crate::metrics::StateTransferMetrics;
use crate::statetransfer::chunk::StateChunk;
use crate::statetransfer::collaborators::{DataContainer, TransactionTable};
use crate::statetransfer::command::StateResponseCommand;
use crate::statetransfer::transport::StateTransport;
use crate::topology::{CacheTopology, TopologyHolder};
use crate::types::{Address, InternalEntry, SegmentId, SegmentSet, TopologyId, TransactionInfo};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What an outbound transfer ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Full entries.
    Values,
    /// Keys and metadata only.
    KeysOnly,
}

/// One outbound transfer to one destination.
#[derive(Debug)]
struct OutboundTransfer {
    id: u64,
    destination: Address,
    topology_id: TopologyId,
    apply_state: bool,
    mode: TransferMode,
    remaining: Mutex<SegmentSet>,
    cancel: CancellationToken,
}

impl OutboundTransfer {
    /// Drop the segments matching `predicate`. Cancels the whole transfer once
    /// nothing remains. Returns what was dropped.
    async fn cancel_where(&self, mut predicate: impl FnMut(SegmentId) -> bool) -> SegmentSet {
        let mut remaining = self.remaining.lock().await;
        let cancelled: SegmentSet = remaining.iter().copied().filter(|s| predicate(*s)).collect();
        remaining.retain(|s| !cancelled.contains(s));
        if remaining.is_empty() {
            self.cancel.cancel();
        }
        cancelled
    }
}

type TransferMap = DashMap<Address, Vec<Arc<OutboundTransfer>>>;

/// Streams local state to nodes that requested it.
pub struct StateProvider {
    cache_name: String,
    local: Address,
    chunk_size: usize,
    topology: Arc<TopologyHolder>,
    container: Arc<dyn DataContainer>,
    transactions: Arc<dyn TransactionTable>,
    transport: Arc<dyn StateTransport>,
    transfers: Arc<TransferMap>,
    next_id: AtomicU64,
    metrics: Arc<StateTransferMetrics>,
}

impl StateProvider {
    /// Create a new provider.
    pub fn new(
        cache_name: impl Into<String>,
        config: &StateTransferConfig,
        topology: Arc<TopologyHolder>,
        container: Arc<dyn DataContainer>,
        transactions: Arc<dyn TransactionTable>,
        transport: Arc<dyn StateTransport>,
        metrics: Arc<StateTransferMetrics>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            local: transport.local_address().clone(),
            chunk_size: config.chunk_size,
            topology,
            container,
            transactions,
            transport,
            transfers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Start streaming `segments` to `destination`.
    ///
    /// Segments already being sent to the destination by a transfer of the
    /// same kind are cancelled first and restarted. Returns without waiting
    /// for any chunk to be sent.
    pub async fn start_outbound_transfer(
        &self,
        destination: &Address,
        topology_id: TopologyId,
        segments: &SegmentSet,
        apply_state: bool,
    ) -> Result<()> {
        self.start(destination, topology_id, segments, apply_state, TransferMode::Values)
            .await
    }

    /// Start streaming keys and versions of `segments` to `destination`.
    pub async fn start_keys_transfer(
        &self,
        destination: &Address,
        topology_id: TopologyId,
        segments: &SegmentSet,
    ) -> Result<()> {
        self.start(destination, topology_id, segments, true, TransferMode::KeysOnly)
            .await
    }

    #[tracing::instrument(skip(self, segments), fields(cache = %self.cache_name, segments = segments.len()))]
    async fn start(
        &self,
        destination: &Address,
        topology_id: TopologyId,
        segments: &SegmentSet,
        apply_state: bool,
        mode: TransferMode,
    ) -> Result<()> {
        let topology = self.topology.current().ok_or(TopologyError::NotInstalled)?;
        if segments.is_empty() {
            return Ok(());
        }

        let not_local: Vec<SegmentId> = segments
            .iter()
            .copied()
            .filter(|s| !topology.read_consistent_hash().is_segment_local_to(&self.local, *s))
            .collect();
        if !not_local.is_empty() {
            debug!(?not_local, "Asked for segments this node does not own");
        }

        let same_kind = self
            .transfers_to(destination)
            .into_iter()
            .filter(|t| t.apply_state == apply_state && t.mode == mode);
        for transfer in same_kind {
            transfer.cancel_where(|s| segments.contains(&s)).await;
        }

        let transfer = Arc::new(OutboundTransfer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            destination: destination.clone(),
            topology_id,
            apply_state,
            mode,
            remaining: Mutex::new(segments.clone()),
            cancel: CancellationToken::new(),
        });
        self.transfers
            .entry(destination.clone())
            .or_default()
            .push(Arc::clone(&transfer));

        self.metrics.outbound_started.inc();
        self.metrics.outbound_active.inc();
        info!(id = transfer.id, ?mode, apply_state, "Starting outbound transfer");

        let task = OutboundTask {
            cache_name: self.cache_name.clone(),
            chunk_size: self.chunk_size,
            container: Arc::clone(&self.container),
            transport: Arc::clone(&self.transport),
            transfers: Arc::clone(&self.transfers),
            metrics: Arc::clone(&self.metrics),
        };
        tokio::spawn(task.run(transfer));
        Ok(())
    }

    /// Stop sending `segments` to `destination`.
    ///
    /// Safe on transfers that finished or never started. Once this returns no
    /// chunk of the given segments is sent by an existing transfer.
    pub async fn cancel_outbound_transfer(
        &self,
        destination: &Address,
        topology_id: TopologyId,
        segments: &SegmentSet,
    ) {
        for transfer in self.transfers_to(destination) {
            let cancelled = transfer.cancel_where(|s| segments.contains(&s)).await;
            if !cancelled.is_empty() {
                debug!(
                    cache = %self.cache_name,
                    id = transfer.id,
                    %destination,
                    topology_id,
                    ?cancelled,
                    "Cancelled outbound segments"
                );
            }
        }
    }

    /// Cancel rebalance transfers made obsolete by a newer topology.
    ///
    /// Destinations drop chunks stamped with an older topology id, so every
    /// older rebalance transfer stops. Conflict resolution transfers only
    /// stop when their destination left.
    pub async fn on_topology_update(&self, topology: &CacheTopology) {
        let all: Vec<Arc<OutboundTransfer>> = self
            .transfers
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();

        for transfer in all {
            if transfer.topology_id >= topology.topology_id() {
                continue;
            }
            let left = !topology.is_member(&transfer.destination);
            if !left && !transfer.apply_state {
                continue;
            }
            let cancelled = transfer.cancel_where(|_| true).await;
            if !cancelled.is_empty() {
                debug!(
                    cache = %self.cache_name,
                    id = transfer.id,
                    destination = %transfer.destination,
                    left,
                    "Cancelled outbound transfer for newer topology"
                );
            }
        }
    }

    /// Transactions touching `segments`, requested by `destination`.
    pub fn get_transactions_for_segments(
        &self,
        destination: &Address,
        topology_id: TopologyId,
        segments: &SegmentSet,
    ) -> Vec<TransactionInfo> {
        let transactions = self.transactions.transactions_for_segments(segments);
        debug!(
            cache = %self.cache_name,
            %destination,
            topology_id,
            count = transactions.len(),
            "Collected transactions for segments"
        );
        transactions
    }

    /// Confirm this node stopped serving `segments` as of `topology_id`.
    ///
    /// Waits until that topology is installed and stops outbound key
    /// transfers for the segments.
    pub async fn confirm_revoked_segments(
        &self,
        topology_id: TopologyId,
        segments: &SegmentSet,
        timeout: std::time::Duration,
    ) -> Result<()> {
        let topology = self.topology.wait_for_topology(topology_id, timeout).await?;
        let still_primary: Vec<SegmentId> = segments
            .iter()
            .copied()
            .filter(|s| topology.current_ch().primary_owner(*s) == Some(&self.local))
            .collect();
        if !still_primary.is_empty() {
            warn!(cache = %self.cache_name, ?still_primary, "Asked to revoke segments still owned");
        }

        let all: Vec<Arc<OutboundTransfer>> = self
            .transfers
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        for transfer in all.into_iter().filter(|t| t.mode == TransferMode::KeysOnly) {
            transfer.cancel_where(|s| segments.contains(&s)).await;
        }
        Ok(())
    }

    /// Number of outbound transfers still running.
    pub fn active_transfers(&self) -> usize {
        self.transfers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Whether any transfer to `destination` is still running.
    pub fn is_transferring_to(&self, destination: &Address) -> bool {
        self.transfers
            .get(destination)
            .map_or(false, |list| !list.is_empty())
    }

    fn transfers_to(&self, destination: &Address) -> Vec<Arc<OutboundTransfer>> {
        self.transfers
            .get(destination)
            .map(|list| list.clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for StateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProvider")
            .field("cache_name", &self.cache_name)
            .field("local", &self.local)
            .field("active_transfers", &self.active_transfers())
            .finish()
    }
}

/// Everything a spawned transfer needs, detached from the provider.
struct OutboundTask {
    cache_name: String,
    chunk_size: usize,
    container: Arc<dyn DataContainer>,
    transport: Arc<dyn StateTransport>,
    transfers: Arc<TransferMap>,
    metrics: Arc<StateTransferMetrics>,
}

impl OutboundTask {
    async fn run(self, transfer: Arc<OutboundTransfer>) {
        let segments: Vec<SegmentId> = transfer.remaining.lock().await.iter().copied().collect();

        'segments: for segment in segments {
            if transfer.cancel.is_cancelled() {
                break;
            }

            let entries = match self.container.entries_for_segment(segment).await {
                Ok(entries) => entries,
                Err(e) => {
                    // No last chunk goes out, so the destination keeps the
                    // segment pending and asks again on the next topology.
                    warn!(
                        cache = %self.cache_name,
                        id = transfer.id,
                        segment,
                        error = %e,
                        "Failed to read segment, skipping it"
                    );
                    transfer.remaining.lock().await.remove(&segment);
                    continue;
                }
            };
            let entries: Vec<InternalEntry> = match transfer.mode {
                TransferMode::Values => entries,
                TransferMode::KeysOnly => entries.iter().map(InternalEntry::key_only).collect(),
            };

            for chunk in StateChunk::split(segment, entries, self.chunk_size) {
                let mut remaining = transfer.remaining.lock().await;
                if transfer.cancel.is_cancelled() {
                    break 'segments;
                }
                if !remaining.contains(&segment) {
                    continue 'segments;
                }

                let is_last = chunk.is_last_chunk;
                let response = StateResponseCommand::new(
                    self.cache_name.clone(),
                    transfer.topology_id,
                    vec![chunk],
                    transfer.apply_state,
                );
                if let Err(e) = self
                    .transport
                    .send(&transfer.destination, response.into())
                    .await
                {
                    warn!(
                        cache = %self.cache_name,
                        id = transfer.id,
                        destination = %transfer.destination,
                        error = %e,
                        "Failed to send state chunk, abandoning transfer"
                    );
                    transfer.cancel.cancel();
                    break 'segments;
                }
                self.metrics.chunks_sent.inc();

                if is_last {
                    remaining.remove(&segment);
                }
            }
        }

        if transfer.cancel.is_cancelled() {
            self.metrics.outbound_cancelled.inc();
            debug!(cache = %self.cache_name, id = transfer.id, "Outbound transfer cancelled");
        } else {
            self.metrics.outbound_completed.inc();
            debug!(cache = %self.cache_name, id = transfer.id, "Outbound transfer completed");
        }
        self.metrics.outbound_active.dec();

        if let Some(mut list) = self.transfers.get_mut(&transfer.destination) {
            list.retain(|t| t.id != transfer.id);
        }
        self.transfers
            .remove_if(&transfer.destination, |_, list| list.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::statetransfer::{
        ComponentRegistry, LocalTransactionTable, MokaDataContainer, StateTransferCommandHandler,
    };
    use crate::testing::{fill_segment, hash_of, stable_topology, wait_for, InMemoryNetwork};
    use crate::topology::KeyPartitioner;
    use crate::types::segments;
    use std::time::Duration;
    use test_log::test;

    /// Container whose reads of one segment always fail.
    #[derive(Debug)]
    struct UnreadableSegment {
        inner: MokaDataContainer,
        broken: SegmentId,
    }

    #[async_trait::async_trait]
    impl DataContainer for UnreadableSegment {
        fn segment_of(&self, key: &[u8]) -> SegmentId {
            self.inner.segment_of(key)
        }

        async fn put(&self, entry: InternalEntry) -> Result<()> {
            self.inner.put(entry).await
        }

        async fn get(&self, key: &[u8]) -> Option<InternalEntry> {
            self.inner.get(key).await
        }

        async fn remove(&self, key: &[u8]) -> Result<()> {
            self.inner.remove(key).await
        }

        async fn entries_for_segment(&self, segment: SegmentId) -> Result<Vec<InternalEntry>> {
            if segment == self.broken {
                return Err(StoreError::ReadFailed("disk on fire".into()).into());
            }
            self.inner.entries_for_segment(segment).await
        }

        async fn remove_segments(&self, segments: &SegmentSet) -> Result<usize> {
            self.inner.remove_segments(segments).await
        }

        fn len(&self) -> usize {
            self.inner.len()
        }
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_unreadable_segment_never_sends_last_chunk() {
        let config = StateTransferConfig::default()
            .with_num_segments(4)
            .with_chunk_size(2);
        let partitioner = KeyPartitioner::new(config.num_segments);
        let container = Arc::new(UnreadableSegment {
            inner: MokaDataContainer::new(partitioner),
            broken: 1,
        });
        fill_segment(container.as_ref(), 1, 3).await;
        fill_segment(container.as_ref(), 2, 3).await;

        let network = InMemoryNetwork::new();
        let topology = Arc::new(TopologyHolder::new());
        topology
            .install(Arc::new(stable_topology(
                4,
                hash_of(&["P"], &[&["P"], &["P"], &["P"], &["P"]]),
            )))
            .unwrap();
        let metrics = Arc::new(StateTransferMetrics::new());
        let provider = StateProvider::new(
            "orders",
            &config,
            topology,
            container,
            Arc::new(LocalTransactionTable::new(partitioner)),
            network.endpoint(Address::new("P")),
            Arc::clone(&metrics),
        );

        // R knows no caches, so it only records what reaches it.
        network.register(
            Address::new("R"),
            Arc::new(StateTransferCommandHandler::new(Arc::new(ComponentRegistry::new()))),
        );
        provider
            .start_outbound_transfer(&Address::new("R"), 4, &segments([1, 2]), true)
            .await
            .unwrap();
        assert!(wait_for(|| provider.active_transfers() == 0, Duration::from_secs(5)).await);

        let deliveries = network.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(|d| d.segments == vec![2]));
        assert_eq!(deliveries.iter().map(|d| d.entries).sum::<usize>(), 3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_sent, 2);
        assert_eq!(snapshot.outbound_completed, 1);
    }
}
