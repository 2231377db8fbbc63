//! Per-cache owner of the topology slot, provider and consumer.

use crate::config::StateTransferConfig;
use crate::error::{Error, Result, TopologyError};
use crate::metrics::StateTransferMetrics;
use crate::statetransfer::collaborators::{DataContainer, TransactionTable};
use crate::statetransfer::consumer::StateConsumer;
use crate::statetransfer::provider::StateProvider;
use crate::statetransfer::transport::StateTransport;
use crate::topology::{CacheTopology, RebalanceConfirmation, TopologyHolder};
use crate::types::Address;
use std::sync::Arc;
use tracing::debug;

/// State transfer for one cache on one node.
pub struct StateTransferManager {
    cache_name: String,
    local: Address,
    config: StateTransferConfig,
    topology: Arc<TopologyHolder>,
    provider: Arc<StateProvider>,
    consumer: Arc<StateConsumer>,
    metrics: Arc<StateTransferMetrics>,
}

impl StateTransferManager {
    /// Create a new manager.
    pub fn new(
        cache_name: impl Into<String>,
        config: StateTransferConfig,
        container: Arc<dyn DataContainer>,
        transactions: Arc<dyn TransactionTable>,
        transport: Arc<dyn StateTransport>,
        confirmation: Arc<dyn RebalanceConfirmation>,
    ) -> Result<Self> {
        Self::with_topology(
            cache_name,
            config,
            Arc::new(TopologyHolder::new()),
            container,
            transactions,
            transport,
            confirmation,
        )
    }

    /// Create a manager installing topologies into a slot shared with other
    /// components of the same node, such as the conflict manager.
    pub fn with_topology(
        cache_name: impl Into<String>,
        config: StateTransferConfig,
        topology: Arc<TopologyHolder>,
        container: Arc<dyn DataContainer>,
        transactions: Arc<dyn TransactionTable>,
        transport: Arc<dyn StateTransport>,
        confirmation: Arc<dyn RebalanceConfirmation>,
    ) -> Result<Self> {
        config.validate()?;
        let cache_name = cache_name.into();
        let local = transport.local_address().clone();
        let metrics = Arc::new(StateTransferMetrics::new());

        let provider = Arc::new(StateProvider::new(
            cache_name.clone(),
            &config,
            Arc::clone(&topology),
            Arc::clone(&container),
            Arc::clone(&transactions),
            Arc::clone(&transport),
            Arc::clone(&metrics),
        ));
        let consumer = Arc::new(StateConsumer::new(
            cache_name.clone(),
            config.clone(),
            Arc::clone(&topology),
            container,
            transactions,
            transport,
            confirmation,
            Arc::clone(&metrics),
        ));

        Ok(Self {
            cache_name,
            local,
            config,
            topology,
            provider,
            consumer,
            metrics,
        })
    }

    /// Name of the cache.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Address of this node.
    pub fn local_address(&self) -> &Address {
        &self.local
    }

    /// Configuration.
    pub fn config(&self) -> &StateTransferConfig {
        &self.config
    }

    /// The topology slot.
    pub fn topology(&self) -> &Arc<TopologyHolder> {
        &self.topology
    }

    /// Outbound side.
    pub fn provider(&self) -> &Arc<StateProvider> {
        &self.provider
    }

    /// Inbound side.
    pub fn consumer(&self) -> &Arc<StateConsumer> {
        &self.consumer
    }

    /// Metrics.
    pub fn metrics(&self) -> &Arc<StateTransferMetrics> {
        &self.metrics
    }

    /// Install a topology and let the provider and consumer react.
    ///
    /// Returns `false` if the topology was not newer than the installed one.
    pub async fn on_topology_update(&self, topology: Arc<CacheTopology>) -> Result<bool> {
        match self.topology.install(Arc::clone(&topology)) {
            Ok(()) => {}
            Err(Error::Topology(TopologyError::Stale { received, current })) => {
                debug!(cache = %self.cache_name, received, current, "Ignoring stale topology");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.provider.on_topology_update(&topology).await;
        self.consumer.on_topology_update(topology).await?;
        Ok(true)
    }

    /// Whether this node is in the cache but does not own data yet.
    pub fn is_joining(&self) -> bool {
        self.topology.current().map_or(true, |t| !t.current_ch().is_member(&self.local))
    }

    /// Wait until this node owns data in the current hash, if configured to.
    pub async fn await_initial_transfer(&self) -> Result<()> {
        if !self.config.await_initial_transfer {
            return Ok(());
        }
        let local = self.local.clone();
        let mut rx = self.topology.subscribe();
        let wait = rx.wait_for(|slot| {
            slot.as_ref()
                .map_or(false, |t| t.current_ch().is_member(&local))
        });
        let result = match tokio::time::timeout(self.config.timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout),
        };
        result
    }
}

impl std::fmt::Debug for StateTransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTransferManager")
            .field("cache_name", &self.cache_name)
            .field("local", &self.local)
            .field("topology_id", &self.topology.current_topology_id())
            .finish()
    }
}
