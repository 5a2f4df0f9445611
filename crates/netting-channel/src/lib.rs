//! Netting channel layer
//!
//! Per-pair channel state machine with balance-proof acceptance rules, lock
//! bookkeeping, the per-asset channel manager, and the settlement ledger
//! interface with an in-process implementation.

pub mod error;
pub mod lock;
pub mod channel;
pub mod ledger;
pub mod manager;
pub mod adapters;

pub use adapters::{InMemoryLedger, LedgerClient};
pub use channel::{Channel, ChannelEnd, Payouts};
pub use error::{ChannelError, LedgerError};
pub use ledger::{ChannelInfo, LedgerEvent, LedgerGateway};
pub use lock::{LockSet, PendingLock};
pub use manager::{ChannelHandle, ChannelManager, ChannelRegistry};
