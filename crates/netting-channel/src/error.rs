use netting_core::{Address, BlockNumber, ChannelState, CoreError, Nonce, SecretHash, TokenAmount};

/// Errors raised by the ledger, surfaced to callers unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("a channel between {participant} and {partner} already exists")]
    ChannelExists {
        participant: Address,
        partner: Address,
    },

    #[error("settle timeout {given} is below the minimum of {min}")]
    InvalidSettleTimeout { given: u64, min: u64 },

    #[error("no such channel: {0}")]
    NoSuchChannel(Address),

    #[error("transaction reverted: {0}")]
    TransactionReverted(String),
}

/// Channel-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {channel} is {state}")]
    InvalidState {
        channel: Address,
        state: ChannelState,
    },

    #[error("{0} is not a participant of the channel")]
    NotParticipant(Address),

    #[error("insufficient capacity: available {available}, required {required}")]
    InsufficientCapacity {
        available: TokenAmount,
        required: TokenAmount,
    },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed or mismatching proof; the message is dropped.
    #[error("invalid balance proof: {0}")]
    InvalidBalanceProof(String),

    /// Validly signed proof that does not supersede the stored one.
    #[error("stale balance proof: nonce {received}, stored {stored}")]
    StaleOrInvalidProof { received: Nonce, stored: Nonce },

    #[error("balance proof with nonce {0} already applied")]
    Duplicate(Nonce),

    #[error("nonce gap: expected {expected}, received {received}")]
    NonceGap { expected: Nonce, received: Nonce },

    #[error("lock {0} already pending")]
    DuplicateLock(SecretHash),

    #[error("unknown lock {0}")]
    UnknownLock(SecretHash),

    #[error("lock {0} has expired")]
    LockExpired(SecretHash),

    #[error("lock {0} already claimed")]
    LockAlreadyClaimed(SecretHash),

    #[error("not allowed: {0}")]
    Unauthorized(String),

    #[error("settlement not possible before block {settle_block} (now {now})")]
    SettleTooEarly {
        settle_block: BlockNumber,
        now: BlockNumber,
    },

    #[error("settle window ended at block {settle_block} (now {now})")]
    SettleWindowElapsed {
        settle_block: BlockNumber,
        now: BlockNumber,
    },

    #[error("no such channel: {0}")]
    NoSuchChannel(Address),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl ChannelError {
    /// Whether the partner misbehaved badly enough that the channel must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StaleOrInvalidProof { .. })
    }
}
