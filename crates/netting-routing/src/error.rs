use netting_core::Address;

/// Errors that can occur within the routing layer.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("no path found from {from} to {to}")]
    NoPathFound { from: Address, to: Address },

    #[error("no edge from {from} to {to}")]
    UnknownEdge { from: Address, to: Address },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
