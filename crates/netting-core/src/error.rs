use crate::state_machine::ChannelState;

/// Core protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid channel state transition from {from} to {to}")]
    InvalidStateTransition {
        from: ChannelState,
        to: ChannelState,
    },

    #[error("message validation failed: {0}")]
    ValidationError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),
}
