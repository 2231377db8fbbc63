//! State transfer between nodes.
//!
//! ```text
//!   destination (consumer)                         source (provider)
//!   ──────────────────────                         ─────────────────
//!   topology N installed
//!   GetTransactions(N, segs) ────────────────────► transactions touching segs
//!   StartOutbound(N, segs)   ────────────────────► spawn outbound task
//!                            ◄──────────────────── StateResponse(N, chunk..)
//!                            ◄──────────────────── StateResponse(N, last chunk)
//!   all last chunks ─► confirm rebalance to coordinator
//!
//!   topology N+1 installed
//!   CancelOutbound(N+1, segs) ───────────────────► stop sending segs
//!   (chunks stamped N are now dropped on arrival)
//! ```
//!
//! Every command and response carries the topology id it was issued under.
//! Receivers with a newer topology drop it.

mod chunk;
mod collaborators;
mod command;
mod consumer;
mod container;
mod handler;
mod manager;
mod provider;
mod registry;
mod transport;
mod wire;

pub use chunk::StateChunk;
pub use collaborators::{
    BiasManager, DataContainer, LocalBiasManager, LocalTransactionTable, TransactionTable,
};
pub use command::{ids, CommandResponse, StateResponseCommand, StateTransferCommand};
pub use consumer::StateConsumer;
pub use container::MokaDataContainer;
pub use handler::StateTransferCommandHandler;
pub use manager::StateTransferManager;
pub use provider::{StateProvider, TransferMode};
pub use registry::{CacheComponents, ComponentRegistry};
pub use transport::StateTransport;
pub use wire::{Decoded, Envelope, WireCommand};
