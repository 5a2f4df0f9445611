pub mod error;
pub mod types;
pub mod messages;
pub mod state_machine;
pub mod config;
pub mod clock;

pub use clock::BlockClock;
pub use config::ProtocolConfig;
pub use error::CoreError;
pub use messages::{BalanceProof, FailureReason, Lock, Message};
pub use state_machine::{ChannelEvent, ChannelState, ChannelStateMachine};
pub use types::{
    Address, BlockNumber, BlockTimeout, Locksroot, Nonce, Secret, SecretHash, TokenAmount,
    TransferId,
};
