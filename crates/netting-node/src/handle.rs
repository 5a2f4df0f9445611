//! Handles for transfers that complete in the background.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

use netting_core::TransferId;

/// Why a transfer did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCause {
    /// Every usable route was tried, or none existed.
    NoPathFound,
    /// The secret was revealed but the lock expired before the first hop unlocked it.
    Expired,
    /// The transfer was dropped before it resolved.
    Abandoned,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPathFound => write!(f, "no path found"),
            Self::Expired => write!(f, "expired"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Final result of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferOutcome {
    Success,
    Failed(FailureCause),
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

type Slot = Option<TransferOutcome>;

/// Awaitable result of a transfer started with `transfer_async`.
///
/// Cloning yields another handle observing the same transfer.
#[derive(Debug, Clone)]
pub struct AsyncTransferHandle {
    id: TransferId,
    started_at: DateTime<Utc>,
    receiver: watch::Receiver<Slot>,
}

/// The single write side of an [`AsyncTransferHandle`].
///
/// Dropping it unresolved resolves the handle as `Failed(Abandoned)`.
#[derive(Debug)]
pub struct TransferResolver {
    id: TransferId,
    sender: Option<watch::Sender<Slot>>,
}

/// Create a pending handle and its resolver.
pub fn transfer_handle() -> (AsyncTransferHandle, TransferResolver) {
    let id = TransferId::new();
    let (sender, receiver) = watch::channel(None);
    (
        AsyncTransferHandle {
            id,
            started_at: Utc::now(),
            receiver,
        },
        TransferResolver {
            id,
            sender: Some(sender),
        },
    )
}

impl AsyncTransferHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The outcome if already resolved.
    pub fn outcome(&self) -> Option<TransferOutcome> {
        *self.receiver.borrow()
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome().is_some()
    }

    /// Wait for the outcome. Returns immediately once resolved.
    pub async fn wait(&self) -> TransferOutcome {
        let mut receiver = self.receiver.clone();
        let result = match receiver.wait_for(|slot| slot.is_some()).await {
            Ok(slot) => *slot,
            Err(_) => None,
        };
        result.unwrap_or(TransferOutcome::Failed(FailureCause::Abandoned))
    }
}

impl TransferResolver {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn resolve(mut self, outcome: TransferOutcome) {
        self.publish(outcome);
    }

    fn publish(&mut self, outcome: TransferOutcome) {
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome));
            tracing::info!(transfer_id = %self.id, outcome = ?outcome, "transfer resolved");
        }
    }
}

impl Drop for TransferResolver {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.publish(TransferOutcome::Failed(FailureCause::Abandoned));
        }
    }
}

/// Wait for every handle; outcomes are returned in input order.
pub async fn wait_all(handles: &[AsyncTransferHandle]) -> Vec<TransferOutcome> {
    futures::future::join_all(handles.iter().map(|h| h.wait())).await
}
