//! State Transfer E2E Test Suite
//!
//! End-to-end tests of membership changes driving state transfer over the
//! in-memory network, verifying:
//! - Joiners pull the segments they gain
//! - Graceful leaves and crashes rebalance the survivors
//! - Cancelled transfers stop sending, whatever the network delay
//! - Inbound chunks are filtered by topology and request
//!
//! | Test ID   | Scenario                          | Verification                        |
//! |-----------|-----------------------------------|-------------------------------------|
//! | TC_ST_01  | Node joins                        | Joiner holds every key it owns      |
//! | TC_ST_02  | Graceful leave, two owners        | No data loss, survivors hold all    |
//! | TC_ST_03  | Crash, single owner               | Fatal loss event, view shrinks      |
//! | TC_ST_04  | Cancel after topology bump        | No chunk after cancel returns       |
//! | TC_ST_05  | Partial cancel                    | Only the other segment keeps going  |
//! | TC_ST_06  | Stale and unrequested chunks      | Discarded, applies are idempotent   |

#[cfg(test)]
mod tests {
    use crate::config::{PartitionHandlingConfig, StateTransferConfig};
    use crate::partition::TopologyEvent;
    use crate::statetransfer::{
        CacheComponents, ComponentRegistry, CommandResponse, DataContainer, LocalTransactionTable,
        MokaDataContainer, StateChunk, StateTransferCommand, StateTransferCommandHandler,
        StateTransferManager, StateTransport,
    };
    use crate::testing::{
        fill, fill_segment, hash_of, wait_for, InMemoryNetwork, RecordingConfirmation, TestCluster,
    };
    use crate::topology::{CacheTopology, KeyPartitioner, Phase};
    use crate::types::{segments, Address, InternalEntry};
    use std::sync::Arc;
    use std::time::Duration;
    use test_log::test;
    use tokio::time::sleep;

    const CACHE: &str = "test-cache";
    const SETTLE: Duration = Duration::from_secs(10);

    fn config() -> StateTransferConfig {
        StateTransferConfig::default()
            .with_num_segments(64)
            .with_chunk_size(16)
            .with_timeout(Duration::from_secs(5))
    }

    /// A node outside any coordinator, driven by explicit topology updates.
    struct StandaloneNode {
        manager: Arc<StateTransferManager>,
        container: Arc<MokaDataContainer>,
        confirmation: Arc<RecordingConfirmation>,
    }

    fn standalone_node(
        network: &Arc<InMemoryNetwork>,
        name: &str,
        config: &StateTransferConfig,
    ) -> StandaloneNode {
        let address = Address::new(name);
        let partitioner = KeyPartitioner::new(config.num_segments);
        let container = Arc::new(MokaDataContainer::new(partitioner));
        let confirmation = RecordingConfirmation::new();
        let manager = Arc::new(
            StateTransferManager::new(
                CACHE,
                config.clone(),
                Arc::clone(&container) as Arc<dyn DataContainer>,
                Arc::new(LocalTransactionTable::new(partitioner)),
                network.endpoint(address.clone()),
                Arc::clone(&confirmation) as _,
            )
            .unwrap(),
        );
        let registry = Arc::new(ComponentRegistry::new());
        registry.register(CacheComponents::new(Arc::clone(&manager)));
        network.register(address, Arc::new(StateTransferCommandHandler::new(registry)));

        StandaloneNode {
            manager,
            container,
            confirmation,
        }
    }

    fn topology(topology_id: i32, ch: crate::topology::ConsistentHash) -> Arc<CacheTopology> {
        Arc::new(CacheTopology::builder(topology_id, 1, ch).build().unwrap())
    }

    // =========================================================================
    // TC_ST_01: Joiner receives state
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_joiner_receives_state() {
        let mut cluster = TestCluster::new("A", config(), PartitionHandlingConfig::default());
        cluster.join("A").unwrap();
        assert!(cluster.wait_for_stable(1, SETTLE).await);

        fill(cluster.node("A").container.as_ref(), "user", 200, 1).await;

        cluster.join("B").unwrap();
        assert!(
            cluster.wait_for_stable(2, SETTLE).await,
            "rebalance did not finish: {:?}",
            cluster
        );

        // Two owners over two members: B owns everything.
        let b = cluster.node("B");
        assert_eq!(b.container.keys().len(), 200);
        for i in 0..200 {
            let key = format!("user-{}", i);
            let entry = b.container.get(key.as_bytes()).await.unwrap();
            assert_eq!(entry.metadata.version, Some(1));
        }

        let topology = cluster.current_topology().unwrap();
        assert_eq!(topology.rebalance_id(), 2);
        assert_eq!(topology.phase(), Phase::NoRebalance);
        assert!(!b.manager.consumer().has_inbound_transfers());

        let a_metrics = cluster.node("A").manager.metrics().snapshot();
        assert!(a_metrics.outbound_completed >= 1);
        assert_eq!(a_metrics.outbound_active, 0);
        assert!(!cluster.events.has_fatal());
    }

    // =========================================================================
    // TC_ST_02: Graceful leave with no unique data
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_graceful_leave_rebalances_survivors() {
        let mut cluster = TestCluster::new("A", config(), PartitionHandlingConfig::default());
        for name in ["A", "B", "C"] {
            cluster.join(name).unwrap();
        }
        assert!(cluster.wait_for_stable(3, SETTLE).await, "{:?}", cluster);

        for i in 0..300 {
            let key = format!("order-{}", i);
            cluster
                .put(InternalEntry::versioned(key.into_bytes(), b"pending".to_vec(), 1))
                .await
                .unwrap();
        }

        cluster.leave("C");
        assert!(cluster.wait_for_stable(2, SETTLE).await, "{:?}", cluster);

        assert!(!cluster.events.has_fatal());
        assert!(!cluster
            .events
            .events()
            .iter()
            .any(|e| matches!(e, TopologyEvent::DataLostGracefulLeave { .. })));

        let topology = cluster.current_topology().unwrap();
        let mut members = topology.members().to_vec();
        members.sort();
        assert_eq!(members, vec![Address::new("A"), Address::new("B")]);

        for i in 0..300 {
            let key = format!("order-{}", i);
            let holders = cluster.holders_of(key.as_bytes()).await;
            assert_eq!(holders.len(), 2, "{} held by {:?}", key, holders);
        }
    }

    // =========================================================================
    // TC_ST_03: Crash of the only owner
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_crash_with_single_owner_reports_data_loss() {
        let config = config().with_num_owners(1);
        let mut cluster = TestCluster::new("A", config, PartitionHandlingConfig::default());
        for name in ["A", "B", "C"] {
            cluster.join(name).unwrap();
        }
        assert!(cluster.wait_for_stable(3, SETTLE).await, "{:?}", cluster);

        let stable = cluster.current_topology().unwrap();
        assert!(!stable.current_ch().segments_for_owner(&Address::new("C")).is_empty());

        cluster.crash("C");

        let fatal: Vec<TopologyEvent> = cluster
            .events
            .events()
            .into_iter()
            .filter(|e| matches!(e, TopologyEvent::DataLostAbruptLeave { .. }))
            .collect();
        assert_eq!(
            fatal,
            vec![TopologyEvent::DataLostAbruptLeave {
                cache: CACHE.to_string(),
                lost_members: vec![Address::new("C")],
            }]
        );

        assert!(cluster.wait_for_stable(2, SETTLE).await, "{:?}", cluster);
        let topology = cluster.current_topology().unwrap();
        assert!(topology.topology_id() > stable.topology_id());
        assert!(!topology.is_member(&Address::new("C")));
        assert_eq!(cluster.coordinator.expected_members().len(), 2);
    }

    // =========================================================================
    // TC_ST_04: No chunks after cancellation
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_no_chunks_after_cancel() {
        let config = StateTransferConfig::default()
            .with_num_segments(4)
            .with_chunk_size(1)
            .with_timeout(Duration::from_secs(5));
        let network = InMemoryNetwork::new();
        let provider = standalone_node(&network, "P", &config);
        let requester = standalone_node(&network, "R", &config);

        let ch = hash_of(&["P", "R"], &[&["P"], &["P"], &["P"], &["R"]]);
        provider.manager.on_topology_update(topology(7, ch.clone())).await.unwrap();
        requester.manager.on_topology_update(topology(7, ch.clone())).await.unwrap();

        fill_segment(provider.container.as_ref(), 1, 40).await;
        fill_segment(provider.container.as_ref(), 2, 40).await;
        network.set_response_delay(Some(Duration::from_millis(5)));

        let endpoint = network.endpoint(Address::new("R"));
        let response = endpoint
            .invoke(
                &Address::new("P"),
                StateTransferCommand::StartOutbound {
                    cache_name: CACHE.to_string(),
                    topology_id: 7,
                    segments: segments([1, 2]),
                    is_rebalance: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(response, CommandResponse::Ack);

        assert!(wait_for(|| network.delivery_count() >= 3, SETTLE).await);

        provider.manager.on_topology_update(topology(8, ch)).await.unwrap();
        endpoint
            .send(
                &Address::new("P"),
                StateTransferCommand::CancelOutbound {
                    cache_name: CACHE.to_string(),
                    topology_id: 8,
                    segments: segments([1, 2]),
                }
                .into(),
            )
            .await
            .unwrap();

        let after_cancel = network.delivery_count();
        assert!(after_cancel < 80);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(network.delivery_count(), after_cancel);

        assert!(wait_for(|| provider.manager.provider().active_transfers() == 0, SETTLE).await);
        let metrics = provider.manager.metrics().snapshot();
        assert_eq!(metrics.outbound_cancelled, 1);
        assert_eq!(metrics.outbound_completed, 0);

        // Every delivered chunk was stamped with the topology it was requested under.
        assert!(network.deliveries().iter().all(|d| d.topology_id == 7));
    }

    // =========================================================================
    // TC_ST_05: Cancelling one segment
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_partial_cancel_keeps_other_segments() {
        let config = StateTransferConfig::default()
            .with_num_segments(4)
            .with_chunk_size(1)
            .with_timeout(Duration::from_secs(5));
        let network = InMemoryNetwork::new();
        let provider = standalone_node(&network, "P", &config);
        let _requester = standalone_node(&network, "R", &config);

        let ch = hash_of(&["P", "R"], &[&["P"], &["P"], &["P"], &["R"]]);
        provider.manager.on_topology_update(topology(4, ch)).await.unwrap();

        fill_segment(provider.container.as_ref(), 1, 40).await;
        fill_segment(provider.container.as_ref(), 2, 10).await;
        network.set_response_delay(Some(Duration::from_millis(2)));

        let r = Address::new("R");
        provider
            .manager
            .provider()
            .start_outbound_transfer(&r, 4, &segments([1, 2]), true)
            .await
            .unwrap();
        assert!(wait_for(|| network.delivery_count() >= 2, SETTLE).await);

        provider
            .manager
            .provider()
            .cancel_outbound_transfer(&r, 4, &segments([1]))
            .await;
        let after_cancel = network.delivery_count();

        assert!(wait_for(|| provider.manager.provider().active_transfers() == 0, SETTLE).await);
        let deliveries = network.deliveries();
        assert!(deliveries[after_cancel..].iter().all(|d| d.segments == vec![2]));
        assert_eq!(
            deliveries.iter().filter(|d| d.segments == vec![2]).count(),
            10
        );
        assert!(deliveries.iter().all(|d| d.values == d.entries));

        let metrics = provider.manager.metrics().snapshot();
        assert_eq!(metrics.outbound_completed, 1);
        assert_eq!(metrics.chunks_sent as usize, deliveries.len());
    }

    // =========================================================================
    // TC_ST_06: Inbound filtering
    // =========================================================================

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_inbound_chunks_filtered_and_idempotent() {
        let config = StateTransferConfig::default()
            .with_num_segments(4)
            .with_timeout(Duration::from_secs(1));
        let network = InMemoryNetwork::new();
        let node = standalone_node(&network, "R", &config);
        let p = Address::new("P");
        let r = Address::new("R");

        // R gains segment 0 from P; P itself is not reachable.
        let current = hash_of(&["P", "R"], &[&["P"], &["P"], &["R"], &["R"]]);
        let pending = hash_of(&["P", "R"], &[&["P", "R"], &["P"], &["R"], &["R"]]);
        let rebalancing = CacheTopology::builder(3, 2, current)
            .pending(pending, Phase::Rebalancing)
            .build()
            .unwrap();
        node.manager.on_topology_update(Arc::new(rebalancing)).await.unwrap();

        let consumer = node.manager.consumer();
        assert_eq!(consumer.inbound_segments_from(&p), segments([0]));

        node.container
            .put(InternalEntry::versioned("k1", "local", 5))
            .await
            .unwrap();
        let chunk = StateChunk::new(
            0,
            vec![
                InternalEntry::versioned("k0", "remote", 1),
                InternalEntry::versioned("k1", "remote", 2),
            ],
            false,
        );

        consumer.apply_state(&p, 3, false, vec![chunk.clone()]).await.unwrap();
        consumer.apply_state(&p, 3, false, vec![chunk]).await.unwrap();
        assert_eq!(node.container.keys().len(), 2);
        let k0 = node.container.get(b"k0").await.unwrap();
        assert_eq!(k0.value.as_deref(), Some(&b"remote"[..]));
        let k1 = node.container.get(b"k1").await.unwrap();
        assert_eq!(k1.value.as_deref(), Some(&b"local"[..]));

        let stale = StateChunk::new(0, vec![InternalEntry::versioned("old", "x", 1)], true);
        consumer.apply_state(&p, 2, false, vec![stale]).await.unwrap();
        let unrequested = StateChunk::new(1, vec![InternalEntry::versioned("k2", "x", 1)], true);
        consumer.apply_state(&p, 3, false, vec![unrequested.clone()]).await.unwrap();
        let wrong_origin = StateChunk::new(0, vec![InternalEntry::versioned("k3", "x", 1)], true);
        consumer
            .apply_state(&Address::new("Q"), 3, false, vec![wrong_origin])
            .await
            .unwrap();
        assert_eq!(node.container.keys().len(), 2);
        assert_eq!(node.manager.metrics().snapshot().chunks_discarded, 3);

        // Pushes pass the same topology check and land on write-owned
        // segments only.
        let stale_push = StateChunk::new(2, vec![InternalEntry::versioned("k5", "merged", 9)], true);
        consumer.apply_state(&p, 1, true, vec![stale_push]).await.unwrap();
        assert!(node.container.get(b"k5").await.is_none());

        let pushed = StateChunk::new(2, vec![InternalEntry::versioned("k4", "merged", 9)], true);
        consumer.apply_state(&p, 3, true, vec![pushed]).await.unwrap();
        consumer.apply_state(&p, 3, true, vec![unrequested]).await.unwrap();
        assert!(node.container.get(b"k4").await.is_some());
        assert!(node.container.get(b"k2").await.is_none());
        assert_eq!(node.manager.metrics().snapshot().chunks_discarded, 5);

        consumer
            .apply_state(&p, 3, false, vec![StateChunk::new(0, Vec::new(), true)])
            .await
            .unwrap();
        assert!(!consumer.has_inbound_transfers());
        assert_eq!(consumer.received_segments(), segments([0]));
        assert!(wait_for(|| node.confirmation.confirmed() == vec![(r.clone(), 3)], SETTLE).await);
    }
}
