//! Per-asset state held by a node: its channels and the routing graph.

use std::sync::Arc;

use netting_channel::{Channel, ChannelError, ChannelManager, LedgerEvent, LedgerGateway};
use netting_core::{Address, ProtocolConfig};
use netting_crypto::Crypto;
use netting_routing::ChannelGraph;

/// Channels and routing graph for one asset.
///
/// Graph capacities follow the mirrored channels: for a channel this node is
/// part of they track the exact distributable balance after every update,
/// for remote channels they track the on-ledger deposits.
pub struct AssetManager {
    asset: Address,
    channels: ChannelManager,
    graph: ChannelGraph,
}

impl AssetManager {
    pub fn new(
        asset: Address,
        ledger: Arc<dyn LedgerGateway>,
        crypto: Arc<dyn Crypto>,
        config: &ProtocolConfig,
    ) -> Self {
        Self {
            asset,
            channels: ChannelManager::new(asset, ledger, crypto, config),
            graph: ChannelGraph::new(asset),
        }
    }

    pub fn asset(&self) -> Address {
        self.asset
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn graph(&self) -> &ChannelGraph {
        &self.graph
    }

    /// Copy both directions' distributable balances into the graph.
    pub fn refresh_capacity(&self, channel: &Channel) {
        if !channel.state.is_usable() {
            self.graph.remove_channel(&channel.address);
            return;
        }
        let (p1, p2) = (channel.participants[0].address, channel.participants[1].address);
        if self.graph.edge(&p1, &p2).is_none() {
            self.graph.add_channel(channel.address, p1, p2);
        }
        for end in &channel.participants {
            let Ok(partner) = channel.partner_of(&end.address) else {
                continue;
            };
            let capacity = channel.distributable(&end.address).unwrap_or(0);
            if let Err(e) = self.graph.set_capacity(&end.address, &partner, capacity) {
                tracing::warn!(error = %e, channel = %channel.address, "capacity update failed");
            }
        }
    }

    /// Apply a ledger event for this asset to the mirrored channels and the graph.
    pub async fn apply_ledger_event(&self, event: &LedgerEvent) -> Result<(), ChannelError> {
        match event {
            LedgerEvent::ChannelOpened {
                channel,
                participant1,
                participant2,
                settle_timeout,
                block,
                ..
            } => {
                let handle = self.channels.on_channel_opened(
                    *channel,
                    *participant1,
                    *participant2,
                    *settle_timeout,
                    *block,
                )?;
                let local = handle.lock().await;
                self.refresh_capacity(&local);
            }
            LedgerEvent::Deposited {
                channel,
                participant,
                total_deposit,
                ..
            } => {
                self.channels
                    .on_deposited(channel, participant, *total_deposit)
                    .await?;
                if let Some(handle) = self.channels.channel(channel) {
                    let local = handle.lock().await;
                    self.refresh_capacity(&local);
                }
            }
            LedgerEvent::ChannelClosed {
                channel,
                closing_participant,
                block,
                ..
            } => {
                self.graph.remove_channel(channel);
                self.channels
                    .on_closed(channel, closing_participant, *block)
                    .await?;
            }
            LedgerEvent::ChannelSettled { channel, .. } => {
                self.graph.remove_channel(channel);
                self.channels.on_settled(channel).await?;
            }
            LedgerEvent::LockClaimed {
                channel,
                claimant,
                secret,
                block,
                ..
            } => {
                if let Some(handle) = self.channels.channel(channel) {
                    handle.lock().await.claim_lock(claimant, secret, *block)?;
                }
            }
            LedgerEvent::AssetAdded { .. } | LedgerEvent::TransferUpdated { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netting_channel::InMemoryLedger;
    use netting_core::BlockClock;
    use netting_crypto::{DefaultCrypto, KeyPair};

    fn addr(b: u8) -> Address {
        Address([b; 32])
    }

    async fn setup() -> (Arc<InMemoryLedger>, AssetManager, KeyPair) {
        let config = ProtocolConfig::default();
        let crypto: Arc<dyn Crypto> = Arc::new(DefaultCrypto);
        let ledger = Arc::new(InMemoryLedger::new(BlockClock::new(1), &config, crypto.clone()));
        let asset = addr(0xAA);
        ledger.register_asset(asset).await.unwrap();
        let keypair = KeyPair::from_label("asset-test");
        let client = Arc::new(ledger.client(keypair.address()));
        let manager = AssetManager::new(asset, client, crypto, &config);
        (ledger, manager, keypair)
    }

    #[tokio::test]
    async fn test_remote_channel_capacity_follows_deposits() {
        let (ledger, manager, _) = setup().await;
        let (a, b) = (addr(1), addr(2));
        ledger.mint(manager.asset(), a, 100);
        let channel = ledger.open_channel(a, manager.asset(), b, 10).await.unwrap();
        let info = ledger.channel_info(channel).await.unwrap();
        manager
            .apply_ledger_event(&LedgerEvent::ChannelOpened {
                channel,
                asset: manager.asset(),
                participant1: a,
                participant2: b,
                settle_timeout: 10,
                block: info.opened_at.unwrap_or_default(),
            })
            .await
            .unwrap();
        assert_eq!(manager.graph().capacity(&a, &b), Some(0));

        manager
            .apply_ledger_event(&LedgerEvent::Deposited {
                channel,
                asset: manager.asset(),
                participant: a,
                total_deposit: 40,
                block: 1,
            })
            .await
            .unwrap();
        assert_eq!(manager.graph().capacity(&a, &b), Some(40));
        assert_eq!(manager.graph().capacity(&b, &a), Some(0));
        assert_eq!(manager.channels().channels_of(&a).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_leaves_graph() {
        let (_ledger, manager, _) = setup().await;
        let (a, b, channel) = (addr(1), addr(2), addr(9));
        let opened = LedgerEvent::ChannelOpened {
            channel,
            asset: manager.asset(),
            participant1: a,
            participant2: b,
            settle_timeout: 10,
            block: 1,
        };
        manager.apply_ledger_event(&opened).await.unwrap();
        assert!(manager.graph().edge(&a, &b).is_some());

        manager
            .apply_ledger_event(&LedgerEvent::ChannelClosed {
                channel,
                asset: manager.asset(),
                closing_participant: a,
                block: 2,
            })
            .await
            .unwrap();
        assert!(manager.graph().edge(&a, &b).is_none());
        // still mirrored until settlement
        assert_eq!(manager.channels().channels_of(&a).len(), 1);
    }

    #[tokio::test]
    async fn test_own_channel_capacity_after_deposit() {
        let (ledger, manager, keypair) = setup().await;
        let me = keypair.address();
        let partner = addr(7);
        ledger.mint(manager.asset(), me, 500);
        let handle = manager.channels().open(partner, 10).await.unwrap();
        manager.channels().deposit(&partner, 120).await.unwrap();
        let local = handle.lock().await;
        manager.refresh_capacity(&local);
        assert_eq!(manager.graph().capacity(&me, &partner), Some(120));
        assert_eq!(manager.graph().capacity(&partner, &me), Some(0));
    }
}
