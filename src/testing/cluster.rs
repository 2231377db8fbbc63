//! A cache cluster wired over an [`InMemoryNetwork`].
//!
//! One [`ClusterCacheStatus`] plays the coordinator. Every node runs a
//! listener task that installs each topology the coordinator publishes, and
//! nodes confirm rebalances straight back to the coordinator.

use crate::config::{PartitionHandlingConfig, StateTransferConfig};
use crate::conflict::{ConflictManager, DefaultConflictManager};
use crate::error::{Result, TopologyError};
use crate::partition::{strategy_for, TopologyEventListener};
use crate::statetransfer::{
    CacheComponents, ComponentRegistry, DataContainer, LocalTransactionTable, MokaDataContainer,
    StateTransferCommandHandler, StateTransferManager, TransactionTable,
};
use crate::testing::network::{InMemoryNetwork, NetworkEndpoint};
use crate::testing::recording::RecordingEventListener;
use crate::testing::utils::wait_for;
use crate::topology::{
    CacheTopology, ClusterCacheStatus, KeyPartitioner, Phase, RebalanceConfirmation,
    RingConsistentHashFactory, TopologyHolder,
};
use crate::types::{Address, InternalEntry};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// One member of a [`TestCluster`].
pub struct TestNode {
    pub address: Address,
    pub manager: Arc<StateTransferManager>,
    pub container: Arc<MokaDataContainer>,
    pub transactions: Arc<LocalTransactionTable>,
    pub handler: Arc<StateTransferCommandHandler>,
    listener_task: JoinHandle<()>,
}

impl TestNode {
    /// Id of the topology installed on this node.
    pub fn topology_id(&self) -> i32 {
        self.manager.topology().current_topology_id()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

impl std::fmt::Debug for TestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestNode")
            .field("address", &self.address)
            .field("topology_id", &self.topology_id())
            .finish()
    }
}

/// Nodes, coordinator and network of a single cache.
pub struct TestCluster {
    pub cache_name: String,
    pub config: StateTransferConfig,
    pub network: Arc<InMemoryNetwork>,
    pub coordinator: Arc<ClusterCacheStatus>,
    pub events: Arc<RecordingEventListener>,
    pub conflict_manager: Option<Arc<DefaultConflictManager>>,
    coordinator_address: Address,
    coordinator_container: Arc<MokaDataContainer>,
    coordinator_topology: Arc<TopologyHolder>,
    nodes: BTreeMap<Address, TestNode>,
}

impl TestCluster {
    /// Start a cluster whose coordinator runs on `coordinator`, with no
    /// members yet.
    pub fn new(
        coordinator: &str,
        config: StateTransferConfig,
        partition_handling: PartitionHandlingConfig,
    ) -> Self {
        let cache_name = "test-cache".to_string();
        let network = InMemoryNetwork::new();
        let events = RecordingEventListener::new();
        let coordinator_address = Address::new(coordinator);
        let coordinator_container = Self::container_for(&config);
        let coordinator_topology = Arc::new(TopologyHolder::new());

        let conflict_manager = partition_handling.merge_policy.clone().map(|policy| {
            Arc::new(DefaultConflictManager::new(
                cache_name.clone(),
                policy,
                config.timeout,
                config.chunk_size,
                network.endpoint(coordinator_address.clone()),
                Arc::clone(&coordinator_container) as Arc<dyn DataContainer>,
                Arc::clone(&coordinator_topology),
            ))
        });

        let strategy = strategy_for(
            &partition_handling,
            Arc::clone(&events) as Arc<dyn TopologyEventListener>,
            conflict_manager
                .clone()
                .map(|cm| cm as Arc<dyn ConflictManager>),
        );
        let coordinator = Arc::new(ClusterCacheStatus::new(
            cache_name.clone(),
            Arc::new(RingConsistentHashFactory::new()),
            &config,
            strategy,
        ));

        Self {
            cache_name,
            config,
            network,
            coordinator,
            events,
            conflict_manager,
            coordinator_address,
            coordinator_container,
            coordinator_topology,
            nodes: BTreeMap::new(),
        }
    }

    fn container_for(config: &StateTransferConfig) -> Arc<MokaDataContainer> {
        Arc::new(MokaDataContainer::new(KeyPartitioner::new(config.num_segments)))
    }

    /// Start `name` and announce it to the coordinator.
    pub fn join(&mut self, name: &str) -> Result<()> {
        let address = Address::new(name);
        let (container, topology) = if address == self.coordinator_address {
            (
                Arc::clone(&self.coordinator_container),
                Arc::clone(&self.coordinator_topology),
            )
        } else {
            (Self::container_for(&self.config), Arc::new(TopologyHolder::new()))
        };
        let transactions = Arc::new(LocalTransactionTable::new(container.partitioner()));
        let endpoint: Arc<NetworkEndpoint> = self.network.endpoint(address.clone());

        let manager = Arc::new(StateTransferManager::with_topology(
            self.cache_name.clone(),
            self.config.clone(),
            topology,
            Arc::clone(&container) as Arc<dyn DataContainer>,
            Arc::clone(&transactions) as Arc<dyn TransactionTable>,
            endpoint,
            Arc::clone(&self.coordinator) as Arc<dyn RebalanceConfirmation>,
        )?);

        let mut components = CacheComponents::new(Arc::clone(&manager));
        if address == self.coordinator_address {
            if let Some(conflict_manager) = &self.conflict_manager {
                components = components
                    .with_conflict_manager(Arc::clone(conflict_manager) as Arc<dyn ConflictManager>);
            }
        }
        let registry = Arc::new(ComponentRegistry::new());
        registry.register(components);
        let handler = Arc::new(StateTransferCommandHandler::new(registry));
        self.network.register(address.clone(), Arc::clone(&handler));

        let listener_task = self.spawn_topology_listener(Arc::clone(&manager));
        self.nodes.insert(
            address.clone(),
            TestNode {
                address: address.clone(),
                manager,
                container,
                transactions,
                handler,
                listener_task,
            },
        );

        info!(node = %address, "Test node joining");
        self.coordinator.node_joined(address, Some(Uuid::new_v4()));
        Ok(())
    }

    fn spawn_topology_listener(&self, manager: Arc<StateTransferManager>) -> JoinHandle<()> {
        let mut rx = self.coordinator.subscribe();
        tokio::spawn(async move {
            loop {
                let topology = rx.borrow_and_update().clone();
                if let Some(topology) = topology {
                    if let Err(e) = manager.on_topology_update(topology).await {
                        warn!(node = %manager.local_address(), error = %e, "Failed to install topology");
                    }
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Gracefully remove `name`.
    pub fn leave(&mut self, name: &str) -> Option<TestNode> {
        let address = Address::new(name);
        self.coordinator.node_left(address.clone());
        self.nodes.remove(&address)
    }

    /// Crash `name` and report the new view to the coordinator.
    pub fn crash(&mut self, name: &str) -> Option<TestNode> {
        let address = Address::new(name);
        self.network.crash(&address);
        let node = self.nodes.remove(&address);
        self.coordinator
            .cluster_view_changed(self.nodes.keys().cloned().collect());
        node
    }

    /// The node called `name`.
    pub fn node(&self, name: &str) -> &TestNode {
        &self.nodes[&Address::new(name)]
    }

    /// All running nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &TestNode> {
        self.nodes.values()
    }

    /// Write `entry` to every write owner of its segment, the way a
    /// replicated put would.
    pub async fn put(&self, entry: InternalEntry) -> Result<()> {
        let Some(topology) = self.coordinator.current_topology() else {
            return Err(TopologyError::NotInstalled.into());
        };
        let segment = self.coordinator_container.segment_of(&entry.key);
        for owner in topology.write_consistent_hash().owners_for_segment(segment) {
            if let Some(node) = self.nodes.get(owner) {
                node.container.put(entry.clone()).await?;
            }
        }
        Ok(())
    }

    /// Nodes that hold `key` locally.
    pub async fn holders_of(&self, key: &[u8]) -> Vec<Address> {
        let mut holders = Vec::new();
        for node in self.nodes.values() {
            if node.container.get(key).await.is_some() {
                holders.push(node.address.clone());
            }
        }
        holders
    }

    /// Topology installed on the coordinator.
    pub fn current_topology(&self) -> Option<Arc<CacheTopology>> {
        self.coordinator.current_topology()
    }

    /// Wait until no rebalance runs, the hash has `members` members and every
    /// node installed the coordinator's topology.
    pub async fn wait_for_stable(&self, members: usize, timeout: Duration) -> bool {
        wait_for(
            || {
                let Some(topology) = self.coordinator.current_topology() else {
                    return false;
                };
                topology.phase() == Phase::NoRebalance
                    && topology.members().len() == members
                    && self
                        .nodes
                        .values()
                        .all(|n| n.topology_id() == topology.topology_id())
            },
            timeout,
        )
        .await
    }
}

impl std::fmt::Debug for TestCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCluster")
            .field("cache_name", &self.cache_name)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("coordinator", &self.coordinator)
            .finish()
    }
}
