//! Inbound dispatch of state transfer traffic.

use crate::error::{Error, Result};
use crate::metrics::Counter;
use crate::statetransfer::command::{CommandResponse, StateResponseCommand, StateTransferCommand};
use crate::statetransfer::registry::{CacheComponents, ComponentRegistry};
use crate::statetransfer::wire::{Decoded, Envelope, WireCommand};
use crate::types::Address;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes decoded commands to the components of the target cache.
#[derive(Debug)]
pub struct StateTransferCommandHandler {
    registry: Arc<ComponentRegistry>,
    unknown_commands: Counter,
}

impl StateTransferCommandHandler {
    /// Create a handler over a registry.
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        Self {
            registry,
            unknown_commands: Counter::new("unknown_commands_ignored"),
        }
    }

    /// The registry commands are dispatched to.
    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    /// Number of frames ignored because their command id is unknown.
    pub fn unknown_commands(&self) -> u64 {
        self.unknown_commands.get()
    }

    /// Handle a raw frame. Returns the encoded response for commands that
    /// expect one.
    pub async fn handle_bytes(&self, origin: &Address, frame: Bytes) -> Result<Option<Bytes>> {
        let envelope = Envelope::from_bytes(frame)?;
        match envelope.decode()? {
            Decoded::Unknown(command_id) => {
                self.unknown_commands.inc();
                debug!(%origin, command_id, "Ignoring unknown command");
                Ok(None)
            }
            Decoded::Command(command) => {
                let expects_response = command.expects_response();
                let response = self.handle(origin, command).await;
                if expects_response {
                    Ok(Some(Bytes::from(bincode::serialize(&response)?)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Handle a decoded command.
    pub async fn handle(&self, origin: &Address, command: WireCommand) -> CommandResponse {
        match command {
            WireCommand::StateTransfer(command) => self.handle_command(origin, command).await,
            WireCommand::StateResponse(response) => {
                self.handle_state_response(origin, response).await;
                CommandResponse::Ack
            }
        }
    }

    async fn handle_command(&self, origin: &Address, command: StateTransferCommand) -> CommandResponse {
        let Some(components) = self.registry.get(command.cache_name()) else {
            debug!(%origin, cache = command.cache_name(), "Command for unknown cache");
            return CommandResponse::UnknownCache;
        };

        let state_transfer = &components.state_transfer;
        let current = state_transfer.topology().current_topology_id();
        if command.is_stale(current) {
            state_transfer.metrics().stale_commands.inc();
            debug!(
                %origin,
                command_id = command.command_id(),
                topology_id = command.topology_id(),
                current,
                "Dropping stale command"
            );
            return CommandResponse::Ignored;
        }

        let command_id = command.command_id();
        match self.dispatch(origin, &components, command).await {
            Ok(response) => response,
            Err(e) => {
                warn!(%origin, command_id, error = %e, "State transfer command failed");
                CommandResponse::Error(e.to_string())
            }
        }
    }

    async fn dispatch(
        &self,
        origin: &Address,
        components: &CacheComponents,
        command: StateTransferCommand,
    ) -> Result<CommandResponse> {
        let state_transfer = &components.state_transfer;
        let topology = state_transfer.topology();
        let provider = state_transfer.provider();
        let config = state_transfer.config();

        match command {
            StateTransferCommand::StartOutbound {
                topology_id,
                segments,
                is_rebalance,
                ..
            } => {
                topology.wait_for_topology(topology_id, config.timeout).await?;
                provider
                    .start_outbound_transfer(origin, topology_id, &segments, is_rebalance)
                    .await?;
                Ok(CommandResponse::Ack)
            }
            StateTransferCommand::CancelOutbound {
                topology_id,
                segments,
                ..
            } => {
                provider
                    .cancel_outbound_transfer(origin, topology_id, &segments)
                    .await;
                Ok(CommandResponse::Ack)
            }
            StateTransferCommand::ConflictResolutionStart {
                topology_id,
                segments,
                ..
            } => {
                provider
                    .start_outbound_transfer(origin, topology_id, &segments, false)
                    .await?;
                Ok(CommandResponse::Ack)
            }
            StateTransferCommand::GetTransactions {
                topology_id,
                segments,
                ..
            } => {
                topology.wait_for_topology(topology_id, config.timeout).await?;
                Ok(CommandResponse::Transactions(
                    provider.get_transactions_for_segments(origin, topology_id, &segments),
                ))
            }
            StateTransferCommand::ConfirmRevokedSegments {
                topology_id,
                segments,
                ..
            } => {
                require_scattered(components)?;
                provider
                    .confirm_revoked_segments(topology_id, &segments, config.timeout)
                    .await?;
                if let Some(bias_manager) = &components.bias_manager {
                    bias_manager.revoke_local_bias_for_segments(&segments);
                }
                Ok(CommandResponse::Ack)
            }
            StateTransferCommand::GetKeysForSegments {
                topology_id,
                segments,
                ..
            } => {
                require_scattered(components)?;
                topology.wait_for_topology(topology_id, config.timeout).await?;
                provider
                    .start_keys_transfer(origin, topology_id, &segments)
                    .await?;
                Ok(CommandResponse::Ack)
            }
        }
    }

    async fn handle_state_response(&self, origin: &Address, response: StateResponseCommand) {
        let Some(components) = self.registry.get(&response.cache_name) else {
            debug!(%origin, cache = %response.cache_name, "State for unknown cache");
            return;
        };

        let result = if response.apply_state {
            components
                .state_transfer
                .consumer()
                .apply_state(
                    origin,
                    response.topology_id,
                    response.push_transfer,
                    response.chunks,
                )
                .await
        } else if let Some(conflict_manager) = &components.conflict_manager {
            conflict_manager
                .state_receiver()
                .receive_state(origin, response.topology_id, response.chunks)
                .await
        } else {
            debug!(%origin, "No conflict manager, discarding state");
            components
                .state_transfer
                .metrics()
                .chunks_discarded
                .inc_by(response.chunks.len() as u64);
            Ok(())
        };

        if let Err(e) = result {
            warn!(%origin, cache = %response.cache_name, error = %e, "Failed to apply state");
        }
    }
}

fn require_scattered(components: &CacheComponents) -> Result<()> {
    if components.state_transfer.config().cache_mode.is_scattered() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "cache {} is not scattered",
            components.state_transfer.cache_name()
        )))
    }
}
