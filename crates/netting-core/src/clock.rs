//! Shared monotonic block counter.

use tokio::sync::watch;

use crate::types::BlockNumber;

/// Monotonic block clock shared by the ledger and every node of a network.
///
/// Cloning yields another handle to the same clock.
#[derive(Debug, Clone)]
pub struct BlockClock {
    sender: watch::Sender<BlockNumber>,
}

impl BlockClock {
    pub fn new(start: BlockNumber) -> Self {
        let (sender, _) = watch::channel(start);
        Self { sender }
    }

    /// Current block number.
    pub fn now(&self) -> BlockNumber {
        *self.sender.borrow()
    }

    /// Advance the clock by `blocks` and return the new height.
    pub fn advance(&self, blocks: BlockNumber) -> BlockNumber {
        self.sender.send_modify(|height| *height += blocks);
        let now = self.now();
        tracing::trace!(block = now, "block clock advanced");
        now
    }

    /// Wait until the clock reaches `target`.
    pub async fn wait_until(&self, target: BlockNumber) -> BlockNumber {
        let mut receiver = self.sender.subscribe();
        let reached = match receiver.wait_for(|height| *height >= target).await {
            Ok(height) => *height,
            // The sender lives in `self`, so it cannot be dropped while we wait.
            Err(_) => self.now(),
        };
        reached
    }

    /// Receiver notified on every tick.
    pub fn subscribe(&self) -> watch::Receiver<BlockNumber> {
        self.sender.subscribe()
    }
}

impl Default for BlockClock {
    fn default() -> Self {
        Self::new(0)
    }
}
