use netting_channel::{ChannelError, LedgerError};
use netting_core::{Address, CoreError, SecretHash};
use netting_network::NetworkError;
use netting_routing::RoutingError;

/// Node-level errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("unknown asset: {0}")]
    UnknownAsset(Address),

    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("no transfer for hashlock {0}")]
    UnknownTransfer(SecretHash),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl NodeError {
    /// The partner broke the channel protocol; the channel must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Channel(e) if e.is_fatal())
    }
}
