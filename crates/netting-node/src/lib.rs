//! Netting node
//!
//! A participant in an off-chain payment channel network: mirrors the
//! settlement ledger per asset, coordinates hash-locked transfers as
//! initiator, mediator, or target, watches lock expirations, and exposes
//! transfers through awaitable handles. [`simulation::Network`] wires many
//! nodes together in one process.

pub mod error;
pub mod config;
pub mod handle;
pub mod asset;
pub mod coordinator;
pub mod node;
mod inbound;
mod sweeper;
pub mod simulation;

pub use asset::AssetManager;
pub use config::{LoggingConfig, NettingConfig, SimulationConfig, SimulationMode};
pub use coordinator::{Role, TransferRecord, TransferStatus};
pub use error::NodeError;
pub use handle::{transfer_handle, wait_all, AsyncTransferHandle, FailureCause, TransferOutcome, TransferResolver};
pub use node::{Node, NodeServices};
pub use simulation::{Network, OpenedChannel, SimulationReport};
