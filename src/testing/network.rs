//! In-process network for exercising the state transfer protocol.
//!
//! Every message is framed with [`Envelope`] and handed to the target's
//! [`StateTransferCommandHandler`] as raw bytes, so the wire codec is on the
//! path of every test that uses it. Links can be cut, nodes crashed, and
//! state responses delayed.

use crate::error::{Result, TransportError};
use crate::statetransfer::{
    CommandResponse, StateTransferCommand, StateTransferCommandHandler, StateTransport, Envelope,
    WireCommand,
};
use crate::types::{Address, SegmentId, TopologyId};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// A state response that reached its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub from: Address,
    pub to: Address,
    pub topology_id: TopologyId,
    pub segments: Vec<SegmentId>,
    pub entries: usize,
    /// Entries that carried a value rather than only a key.
    pub values: usize,
    pub apply_state: bool,
    pub push_transfer: bool,
    pub at: Instant,
}

/// A cut between two groups of nodes.
#[derive(Debug, Clone)]
struct Split {
    side_a: HashSet<Address>,
    side_b: HashSet<Address>,
}

impl Split {
    fn separates(&self, from: &Address, to: &Address) -> bool {
        (self.side_a.contains(from) && self.side_b.contains(to))
            || (self.side_b.contains(from) && self.side_a.contains(to))
    }
}

/// Routes framed commands between registered handlers.
#[derive(Debug, Default)]
pub struct InMemoryNetwork {
    handlers: DashMap<Address, Arc<StateTransferCommandHandler>>,
    crashed: DashSet<Address>,
    splits: RwLock<Vec<Split>>,
    response_delay: Mutex<Option<Duration>>,
    deliveries: Mutex<Vec<Delivery>>,
}

impl InMemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node.
    pub fn register(&self, address: Address, handler: Arc<StateTransferCommandHandler>) {
        self.handlers.insert(address, handler);
    }

    /// Transport for `address`.
    pub fn endpoint(self: &Arc<Self>, address: Address) -> Arc<NetworkEndpoint> {
        Arc::new(NetworkEndpoint {
            local: address,
            network: Arc::clone(self),
        })
    }

    /// Make a node unreachable in both directions.
    pub fn crash(&self, address: &Address) {
        self.crashed.insert(address.clone());
    }

    /// Make a crashed node reachable again.
    pub fn recover(&self, address: &Address) {
        self.crashed.remove(address);
    }

    /// Cut every link between the two groups.
    pub fn split(&self, side_a: &[Address], side_b: &[Address]) {
        self.splits.write().push(Split {
            side_a: side_a.iter().cloned().collect(),
            side_b: side_b.iter().cloned().collect(),
        });
    }

    /// Restore every cut link.
    pub fn heal(&self) {
        self.splits.write().clear();
    }

    /// Delay every state response by `delay` before it is delivered.
    pub fn set_response_delay(&self, delay: Option<Duration>) {
        *self.response_delay.lock() = delay;
    }

    /// State responses delivered so far, in order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Number of state responses delivered so far.
    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().len()
    }

    /// Whether `from` can currently reach `to`.
    pub fn can_reach(&self, from: &Address, to: &Address) -> bool {
        !self.crashed.contains(from)
            && !self.crashed.contains(to)
            && !self.splits.read().iter().any(|s| s.separates(from, to))
    }

    async fn deliver(&self, from: &Address, to: &Address, command: WireCommand) -> Result<Option<Bytes>> {
        if !self.can_reach(from, to) {
            return Err(TransportError::Unreachable(to.clone()).into());
        }
        let handler = self
            .handlers
            .get(to)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| TransportError::Unreachable(to.clone()))?;

        let delivery = match &command {
            WireCommand::StateResponse(response) => {
                let delay = *self.response_delay.lock();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Some(Delivery {
                    from: from.clone(),
                    to: to.clone(),
                    topology_id: response.topology_id,
                    segments: response.chunks.iter().map(|c| c.segment_id).collect(),
                    entries: response.chunks.iter().map(|c| c.len()).sum(),
                    values: response
                        .chunks
                        .iter()
                        .flat_map(|c| &c.entries)
                        .filter(|e| e.has_value())
                        .count(),
                    apply_state: response.apply_state,
                    push_transfer: response.push_transfer,
                    at: Instant::now(),
                })
            }
            WireCommand::StateTransfer(_) => None,
        };

        let frame = Envelope::encode(&command)?.to_bytes();
        trace!(%from, %to, command_id = command.command_id(), bytes = frame.len(), "Delivering frame");
        let response = handler.handle_bytes(from, frame).await?;

        if let Some(delivery) = delivery {
            self.deliveries.lock().push(delivery);
        }
        Ok(response)
    }
}

/// One node's view of an [`InMemoryNetwork`].
#[derive(Debug)]
pub struct NetworkEndpoint {
    local: Address,
    network: Arc<InMemoryNetwork>,
}

#[async_trait::async_trait]
impl StateTransport for NetworkEndpoint {
    fn local_address(&self) -> &Address {
        &self.local
    }

    async fn invoke(
        &self,
        target: &Address,
        command: StateTransferCommand,
    ) -> Result<CommandResponse> {
        let response = self
            .network
            .deliver(&self.local, target, command.into())
            .await?
            .ok_or_else(|| TransportError::UnexpectedResponse("no response".into()))?;
        bincode::deserialize(&response)
            .map_err(|e| TransportError::Decode(e.to_string()).into())
    }

    async fn send(&self, target: &Address, command: WireCommand) -> Result<()> {
        self.network.deliver(&self.local, target, command).await?;
        Ok(())
    }
}
