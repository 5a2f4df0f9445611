//! Network error types.

use netting_core::Address;

/// Errors that can occur in the network layer.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// No endpoint is registered for the recipient.
    #[error("unknown peer: {0}")]
    UnknownPeer(Address),

    /// An endpoint is already registered for the address.
    #[error("peer already registered: {0}")]
    AlreadyRegistered(Address),

    /// Serialization / deserialization error.
    #[error("codec error: {0}")]
    Codec(String),

    /// The envelope signature does not match its claimed sender.
    #[error("invalid signature from {0}")]
    InvalidSignature(Address),

    /// The recipient's inbound queue is gone.
    #[error("peer {0} has shut down")]
    ShutDown(Address),

    /// Error from the core layer.
    #[error("core error: {0}")]
    Core(#[from] netting_core::CoreError),
}

impl From<serde_json::Error> for NetworkError {
    fn from(e: serde_json::Error) -> Self {
        NetworkError::Codec(e.to_string())
    }
}
