//! Wire framing for state transfer traffic.
//!
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ command id │ bincode payload              │
//! │   1 byte   │ (command or state response)  │
//! └────────────┴──────────────────────────────┘
//! ```
//!
//! A node that does not recognize a command id decodes it as
//! [`Decoded::Unknown`] and ignores it.

use crate::error::{Result, TransportError};
use crate::statetransfer::command::{ids, StateResponseCommand, StateTransferCommand};
use bytes::{BufMut, Bytes, BytesMut};

/// Any message carried over the state transfer wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireCommand {
    StateTransfer(StateTransferCommand),
    StateResponse(StateResponseCommand),
}

impl WireCommand {
    /// Wire id.
    pub fn command_id(&self) -> u8 {
        match self {
            WireCommand::StateTransfer(command) => command.command_id(),
            WireCommand::StateResponse(_) => ids::STATE_RESPONSE,
        }
    }

    /// Whether the sender waits for a response.
    pub fn expects_response(&self) -> bool {
        match self {
            WireCommand::StateTransfer(command) => command.expects_response(),
            WireCommand::StateResponse(_) => false,
        }
    }

    /// Name of the target cache.
    pub fn cache_name(&self) -> &str {
        match self {
            WireCommand::StateTransfer(command) => command.cache_name(),
            WireCommand::StateResponse(response) => &response.cache_name,
        }
    }
}

impl From<StateTransferCommand> for WireCommand {
    fn from(command: StateTransferCommand) -> Self {
        WireCommand::StateTransfer(command)
    }
}

impl From<StateResponseCommand> for WireCommand {
    fn from(response: StateResponseCommand) -> Self {
        WireCommand::StateResponse(response)
    }
}

/// Result of decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Command(WireCommand),
    /// A command id this node does not know.
    Unknown(u8),
}

/// A framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub command_id: u8,
    pub payload: Bytes,
}

impl Envelope {
    /// Frame a command.
    pub fn encode(command: &WireCommand) -> Result<Self> {
        let payload = match command {
            WireCommand::StateTransfer(command) => bincode::serialize(command),
            WireCommand::StateResponse(response) => bincode::serialize(response),
        }
        .map_err(|e| TransportError::Encode(e.to_string()))?;

        Ok(Self {
            command_id: command.command_id(),
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload according to the command id.
    pub fn decode(&self) -> Result<Decoded> {
        match self.command_id {
            ids::STATE_RESPONSE => {
                let response: StateResponseCommand =
                    bincode::deserialize(&self.payload).map_err(decode_error)?;
                Ok(Decoded::Command(WireCommand::StateResponse(response)))
            }
            ids::CONFLICT_RESOLUTION_START
            | ids::SCATTERED_STATE_GET_KEYS
            | ids::SCATTERED_STATE_CONFIRM_REVOKED
            | ids::STATE_TRANSFER_START
            | ids::STATE_TRANSFER_CANCEL
            | ids::STATE_TRANSFER_GET_TRANSACTIONS => {
                let command: StateTransferCommand =
                    bincode::deserialize(&self.payload).map_err(decode_error)?;
                if command.command_id() != self.command_id {
                    return Err(TransportError::Decode(format!(
                        "command id {} does not match payload {}",
                        self.command_id,
                        command.command_id()
                    ))
                    .into());
                }
                Ok(Decoded::Command(WireCommand::StateTransfer(command)))
            }
            other => Ok(Decoded::Unknown(other)),
        }
    }

    /// Serialize to a single buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.command_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a buffer produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        if bytes.is_empty() {
            return Err(TransportError::Decode("empty frame".into()).into());
        }
        let command_id = bytes[0];
        Ok(Self {
            command_id,
            payload: bytes.slice(1..),
        })
    }
}

fn decode_error(e: bincode::Error) -> TransportError {
    TransportError::Decode(e.to_string())
}
