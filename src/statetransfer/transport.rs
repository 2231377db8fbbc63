use crate::error::Result;
use crate::statetransfer::command::{CommandResponse, StateTransferCommand};
use crate::statetransfer::wire::WireCommand;
use crate::types::Address;

/// Moves state transfer commands between nodes.
///
/// Implementations frame commands with [`crate::statetransfer::Envelope`].
#[async_trait::async_trait]
pub trait StateTransport: Send + Sync + std::fmt::Debug {
    /// Address of this node.
    fn local_address(&self) -> &Address;

    /// Send a command and wait for the target's response.
    async fn invoke(&self, target: &Address, command: StateTransferCommand)
        -> Result<CommandResponse>;

    /// Send a command without waiting for a response. Returns once the
    /// message has been handed to the target.
    async fn send(&self, target: &Address, command: WireCommand) -> Result<()>;
}
