//! The single shared topology slot of a cache on one node.
//!
//! Readers capture the `Arc<CacheTopology>` once at the start of an
//! operation; writers replace it wholesale.

use crate::error::{Error, Result, TopologyError};
use crate::topology::cache_topology::CacheTopology;
use crate::types::{TopologyId, UNKNOWN_TOPOLOGY_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Holds the installed topology and lets tasks wait for newer ones.
#[derive(Debug)]
pub struct TopologyHolder {
    tx: watch::Sender<Option<Arc<CacheTopology>>>,
}

impl TopologyHolder {
    /// Create an empty holder.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// The installed topology.
    pub fn current(&self) -> Option<Arc<CacheTopology>> {
        self.tx.borrow().clone()
    }

    /// Id of the installed topology, or `-1` if none.
    pub fn current_topology_id(&self) -> TopologyId {
        self.tx
            .borrow()
            .as_ref()
            .map_or(UNKNOWN_TOPOLOGY_ID, |t| t.topology_id())
    }

    /// Install a topology. Fails with `Stale` unless it is strictly newer.
    pub fn install(&self, topology: Arc<CacheTopology>) -> Result<()> {
        let mut stale = None;
        self.tx.send_if_modified(|slot| match slot {
            Some(current) if current.topology_id() >= topology.topology_id() => {
                stale = Some(current.topology_id());
                false
            }
            _ => {
                *slot = Some(topology.clone());
                true
            }
        });

        match stale {
            Some(current) => Err(TopologyError::Stale {
                received: topology.topology_id(),
                current,
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Subscribe to installs.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CacheTopology>>> {
        self.tx.subscribe()
    }

    /// Wait until a topology with id >= `topology_id` is installed.
    pub async fn wait_for_topology(
        &self,
        topology_id: TopologyId,
        timeout: Duration,
    ) -> Result<Arc<CacheTopology>> {
        let mut rx = self.tx.subscribe();
        let wait = rx.wait_for(|slot| {
            slot.as_ref()
                .map_or(false, |t| t.topology_id() >= topology_id)
        });

        let result = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(slot)) => slot.clone().ok_or(Error::Topology(TopologyError::NotInstalled)),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout),
        };
        result
    }
}

impl Default for TopologyHolder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::consistent_hash::{ConsistentHashFactory, RingConsistentHashFactory};
    use crate::types::Address;

    fn topology(id: TopologyId) -> Arc<CacheTopology> {
        let ch = RingConsistentHashFactory::new()
            .create(&[Address::new("A")], 1, 4)
            .unwrap();
        Arc::new(CacheTopology::builder(id, 1, ch).build().unwrap())
    }

    #[test]
    fn test_install_rejects_stale() {
        let holder = TopologyHolder::new();
        assert_eq!(holder.current_topology_id(), UNKNOWN_TOPOLOGY_ID);

        holder.install(topology(5)).unwrap();
        assert_eq!(holder.current_topology_id(), 5);

        let err = holder.install(topology(5)).unwrap_err();
        assert!(matches!(
            err,
            Error::Topology(TopologyError::Stale { received: 5, current: 5 })
        ));
        assert!(holder.install(topology(4)).is_err());
        holder.install(topology(6)).unwrap();
        assert_eq!(holder.current_topology_id(), 6);
    }

    #[tokio::test]
    async fn test_wait_for_topology() {
        let holder = Arc::new(TopologyHolder::new());
        holder.install(topology(1)).unwrap();

        let waiter = {
            let holder = Arc::clone(&holder);
            tokio::spawn(async move { holder.wait_for_topology(3, Duration::from_secs(5)).await })
        };

        holder.install(topology(2)).unwrap();
        holder.install(topology(3)).unwrap();

        let installed = waiter.await.unwrap().unwrap();
        assert_eq!(installed.topology_id(), 3);
    }

    #[tokio::test]
    async fn test_wait_for_topology_times_out() {
        let holder = TopologyHolder::new();
        let result = holder.wait_for_topology(1, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
