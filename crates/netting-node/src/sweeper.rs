//! Block-driven maintenance of a node's channels.
//!
//! Runs on every block: removes locks we sent that expired, closes channels
//! where a lock we could claim is about to expire without an off-chain
//! unlock, claims known locks on closed channels, settles channels whose
//! settle window has elapsed, and forgets transfer records that finished
//! long enough ago.

use std::sync::Arc;

use netting_channel::{Channel, ChannelHandle};
use netting_core::{BlockNumber, ChannelState, Message};

use crate::asset::AssetManager;
use crate::node::NodeInner;

impl NodeInner {
    pub(crate) async fn sweep(&self, now: BlockNumber) {
        let managers: Vec<Arc<AssetManager>> =
            self.assets.iter().map(|entry| entry.value().clone()).collect();
        for manager in managers {
            for (_, handle) in manager.channels().our_channels() {
                self.sweep_channel(&manager, &handle, now).await;
            }
        }
        self.forget_finished(now);
    }

    fn forget_finished(&self, now: BlockNumber) {
        let retention = self.config.record_retention;
        let before = self.transfers.len();
        self.transfers
            .retain(|_, record| record.finished_at.map_or(true, |at| now < at + retention));
        let forgotten = before.saturating_sub(self.transfers.len());
        if forgotten > 0 {
            tracing::debug!(node = %self.address, forgotten, "finished transfer records forgotten");
        }
    }

    async fn sweep_channel(&self, manager: &AssetManager, handle: &ChannelHandle, now: BlockNumber) {
        let mut channel = handle.lock().await;
        match channel.state {
            ChannelState::Open => {
                self.remove_expired_locks(manager, &mut channel, now).await;
                let at_risk = channel
                    .unlocks_at_risk(&self.address, now, self.config.reveal_timeout)
                    .unwrap_or_default();
                if !at_risk.is_empty() {
                    tracing::warn!(
                        channel = %channel.address,
                        locks = at_risk.len(),
                        "closing channel to claim locks before they expire"
                    );
                    if let Err(e) = self.close_locked(manager, &mut channel).await {
                        tracing::error!(error = %e, channel = %channel.address, "close failed");
                    }
                }
            }
            ChannelState::Closed => match channel.settle_block() {
                Some(settle_block) if now >= settle_block => {
                    match self.ledger.settle(channel.address).await {
                        Ok(payouts) => tracing::info!(
                            channel = %channel.address,
                            total = payouts.total(),
                            "channel settled"
                        ),
                        Err(e) => tracing::debug!(error = %e, channel = %channel.address, "settle rejected"),
                    }
                }
                _ => self.claim_known_locks(&channel).await,
            },
            ChannelState::Empty | ChannelState::Settled => {}
        }
    }

    async fn remove_expired_locks(&self, manager: &AssetManager, channel: &mut Channel, now: BlockNumber) {
        let expired = match channel.expired_locks(&self.address, now) {
            Ok(locks) => locks,
            Err(_) => return,
        };
        if expired.is_empty() {
            return;
        }
        let Ok(partner) = channel.partner_of(&self.address) else {
            return;
        };
        for lock in expired {
            if !self.release_expired(&lock.hashlock) {
                continue;
            }
            match channel.create_remove_lock(&self.keypair, &lock.hashlock) {
                Ok(balance_proof) => {
                    tracing::debug!(channel = %channel.address, hashlock = %lock.hashlock, "expired lock removed");
                    self.send(
                        partner,
                        Message::RemoveLock {
                            hashlock: lock.hashlock,
                            balance_proof,
                        },
                    )
                    .await;
                }
                Err(e) => tracing::warn!(error = %e, hashlock = %lock.hashlock, "expired lock removal failed"),
            }
        }
        manager.refresh_capacity(channel);
    }
}
