use crate::conflict::ConflictManager;
use crate::error::{Error, Result};
use crate::statetransfer::collaborators::BiasManager;
use crate::statetransfer::manager::StateTransferManager;
use dashmap::DashMap;
use std::sync::Arc;

/// Components of one cache that state transfer commands are dispatched to.
#[derive(Debug, Clone)]
pub struct CacheComponents {
    pub state_transfer: Arc<StateTransferManager>,
    pub conflict_manager: Option<Arc<dyn ConflictManager>>,
    pub bias_manager: Option<Arc<dyn BiasManager>>,
}

impl CacheComponents {
    /// Components with only state transfer.
    pub fn new(state_transfer: Arc<StateTransferManager>) -> Self {
        Self {
            state_transfer,
            conflict_manager: None,
            bias_manager: None,
        }
    }

    /// Set the conflict manager.
    pub fn with_conflict_manager(mut self, conflict_manager: Arc<dyn ConflictManager>) -> Self {
        self.conflict_manager = Some(conflict_manager);
        self
    }

    /// Set the bias manager.
    pub fn with_bias_manager(mut self, bias_manager: Arc<dyn BiasManager>) -> Self {
        self.bias_manager = Some(bias_manager);
        self
    }
}

/// Per-node lookup of cache components by cache name.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    caches: DashMap<String, Arc<CacheComponents>>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache, replacing any previous registration.
    pub fn register(&self, components: CacheComponents) {
        let name = components.state_transfer.cache_name().to_string();
        self.caches.insert(name, Arc::new(components));
    }

    /// Remove a cache.
    pub fn unregister(&self, cache_name: &str) -> Option<Arc<CacheComponents>> {
        self.caches.remove(cache_name).map(|(_, c)| c)
    }

    /// Look up a cache.
    pub fn get(&self, cache_name: &str) -> Option<Arc<CacheComponents>> {
        self.caches.get(cache_name).map(|c| Arc::clone(&c))
    }

    /// State transfer manager of a cache.
    pub fn state_transfer_manager(&self, cache_name: &str) -> Result<Arc<StateTransferManager>> {
        self.get(cache_name)
            .map(|c| Arc::clone(&c.state_transfer))
            .ok_or_else(|| Error::CacheNotFound(cache_name.to_string()))
    }

    /// Conflict manager of a cache, if it has one.
    pub fn conflict_manager(&self, cache_name: &str) -> Option<Arc<dyn ConflictManager>> {
        self.get(cache_name).and_then(|c| c.conflict_manager.clone())
    }

    /// Names of registered caches.
    pub fn cache_names(&self) -> Vec<String> {
        self.caches.iter().map(|e| e.key().clone()).collect()
    }
}
