use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::sync::Mutex;

use netting_core::{Address, BlockNumber, BlockTimeout, ProtocolConfig, TokenAmount};
use netting_crypto::Crypto;

use crate::channel::Channel;
use crate::error::{ChannelError, LedgerError};
use crate::ledger::LedgerGateway;

/// Per-asset index of channels by participant.
///
/// Lookups go `participant → partner → channel`, so either participant finds
/// the channel without any canonical ordering of the pair. Only non-settled
/// channels are indexed; at most one exists per pair.
pub struct ChannelRegistry<T> {
    channels: DashMap<Address, T>,
    index: DashMap<Address, BTreeMap<Address, Address>>,
}

impl<T> ChannelRegistry<T> {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Index a new channel between `participant1` and `participant2`.
    pub fn register(
        &self,
        channel: Address,
        participant1: Address,
        participant2: Address,
        value: T,
    ) -> Result<(), LedgerError> {
        match self.channels.entry(channel) {
            Entry::Occupied(_) => Err(LedgerError::ChannelExists {
                participant: participant1,
                partner: participant2,
            }),
            Entry::Vacant(slot) => {
                self.index_pair(channel, participant1, participant2)?;
                slot.insert(value);
                Ok(())
            }
        }
    }

    /// Index `channel` unless it already is, and return the stored value.
    /// A different channel between the same pair is still an error.
    pub fn get_or_register(
        &self,
        channel: Address,
        participant1: Address,
        participant2: Address,
        value: T,
    ) -> Result<T, LedgerError>
    where
        T: Clone,
    {
        match self.channels.entry(channel) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                self.index_pair(channel, participant1, participant2)?;
                slot.insert(value.clone());
                Ok(value)
            }
        }
    }

    // Callers hold the channel's entry, so the pair check and insert cannot interleave.
    fn index_pair(
        &self,
        channel: Address,
        participant1: Address,
        participant2: Address,
    ) -> Result<(), LedgerError> {
        if self.channel_between(&participant1, &participant2).is_some() {
            return Err(LedgerError::ChannelExists {
                participant: participant1,
                partner: participant2,
            });
        }
        self.index
            .entry(participant1)
            .or_default()
            .insert(participant2, channel);
        self.index
            .entry(participant2)
            .or_default()
            .insert(participant1, channel);
        Ok(())
    }

    /// Drop the pair index of a settled channel; the record itself is kept.
    pub fn release(&self, participant1: &Address, participant2: &Address) {
        if let Some(mut partners) = self.index.get_mut(participant1) {
            partners.remove(participant2);
        }
        if let Some(mut partners) = self.index.get_mut(participant2) {
            partners.remove(participant1);
        }
    }

    pub fn channel_between(&self, participant: &Address, partner: &Address) -> Option<Address> {
        self.index
            .get(participant)
            .and_then(|partners| partners.get(partner).copied())
    }

    /// Non-settled channels of `participant`.
    pub fn channels_of(&self, participant: &Address) -> BTreeSet<Address> {
        self.index
            .get(participant)
            .map(|partners| partners.values().copied().collect())
            .unwrap_or_default()
    }

    /// `(partner, channel)` pairs of `participant`, ordered by partner.
    pub fn partners_of(&self, participant: &Address) -> Vec<(Address, Address)> {
        self.index
            .get(participant)
            .map(|partners| partners.iter().map(|(p, c)| (*p, *c)).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, channel: &Address) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn get_mut(&self, channel: &Address) -> Option<RefMut<'_, Address, T>> {
        self.channels.get_mut(channel)
    }

    /// Every channel ever registered, settled ones included.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl<T: Clone> ChannelRegistry<T> {
    pub fn get(&self, channel: &Address) -> Option<T> {
        self.channels.get(channel).map(|entry| entry.value().clone())
    }
}

impl<T> Default for ChannelRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a node's local view of one channel.
pub type ChannelHandle = Arc<Mutex<Channel>>;

/// A node's channels for one asset.
///
/// Mirrors every channel the ledger reports for the asset, so the node can
/// answer `channels_of` for any participant, and opens or funds channels on
/// behalf of its own address.
pub struct ChannelManager {
    asset: Address,
    our_address: Address,
    min_settle_timeout: BlockTimeout,
    ledger: Arc<dyn LedgerGateway>,
    crypto: Arc<dyn Crypto>,
    registry: ChannelRegistry<ChannelHandle>,
}

impl ChannelManager {
    pub fn new(
        asset: Address,
        ledger: Arc<dyn LedgerGateway>,
        crypto: Arc<dyn Crypto>,
        config: &ProtocolConfig,
    ) -> Self {
        Self {
            asset,
            our_address: ledger.caller(),
            min_settle_timeout: config.min_settle_timeout,
            ledger,
            crypto,
            registry: ChannelRegistry::new(),
        }
    }

    pub fn asset(&self) -> Address {
        self.asset
    }

    /// Open a channel with `partner` on the ledger and return the local view.
    pub async fn open(
        &self,
        partner: Address,
        settle_timeout: BlockTimeout,
    ) -> Result<ChannelHandle, ChannelError> {
        if settle_timeout < self.min_settle_timeout {
            return Err(LedgerError::InvalidSettleTimeout {
                given: settle_timeout,
                min: self.min_settle_timeout,
            }
            .into());
        }
        if partner == self.our_address {
            return Err(ChannelError::Unauthorized(
                "cannot open a channel with oneself".into(),
            ));
        }
        if self.registry.channel_between(&self.our_address, &partner).is_some() {
            return Err(LedgerError::ChannelExists {
                participant: self.our_address,
                partner,
            }
            .into());
        }

        let address = self
            .ledger
            .open_channel(self.asset, partner, settle_timeout)
            .await?;
        let info = self.ledger.channel_info(address).await?;
        let handle = self.on_channel_opened(
            info.channel,
            info.participants[0],
            info.participants[1],
            info.settle_timeout,
            info.opened_at.unwrap_or_default(),
        )?;
        tracing::info!(asset = %self.asset, channel = %address, partner = %partner, "channel opened");
        Ok(handle)
    }

    /// Our non-settled channel with `partner`.
    pub fn channel_with(&self, partner: &Address) -> Result<ChannelHandle, ChannelError> {
        self.registry
            .channel_between(&self.our_address, partner)
            .and_then(|address| self.registry.get(&address))
            .ok_or(ChannelError::NoSuchChannel(*partner))
    }

    pub fn channel(&self, address: &Address) -> Option<ChannelHandle> {
        self.registry.get(address)
    }

    /// Non-settled channels `participant` takes part in.
    pub fn channels_of(&self, participant: &Address) -> BTreeSet<Address> {
        self.registry.channels_of(participant)
    }

    /// Our non-settled channels as `(partner, handle)`.
    pub fn our_channels(&self) -> Vec<(Address, ChannelHandle)> {
        self.registry
            .partners_of(&self.our_address)
            .into_iter()
            .filter_map(|(partner, address)| self.registry.get(&address).map(|h| (partner, h)))
            .collect()
    }

    /// Add `amount` to our deposit in the channel with `partner`.
    pub async fn deposit(
        &self,
        partner: &Address,
        amount: TokenAmount,
    ) -> Result<TokenAmount, ChannelError> {
        let handle = self.channel_with(partner)?;
        let address = handle.lock().await.address;
        let total = self.ledger.deposit(address, amount).await?;
        handle.lock().await.set_deposit(&self.our_address, total)?;
        tracing::info!(channel = %address, amount, total, "deposit made");
        Ok(total)
    }

    /// Mirror a `ChannelOpened` ledger event. Idempotent.
    pub fn on_channel_opened(
        &self,
        channel: Address,
        participant1: Address,
        participant2: Address,
        settle_timeout: BlockTimeout,
        block: BlockNumber,
    ) -> Result<ChannelHandle, ChannelError> {
        if let Some(existing) = self.registry.get(&channel) {
            return Ok(existing);
        }
        // The ledger-event task may mirror the same channel concurrently.
        let mut local = Channel::new(
            channel,
            self.asset,
            participant1,
            participant2,
            settle_timeout,
            self.crypto.clone(),
        );
        local.open(block)?;
        let handle = self.registry.get_or_register(
            channel,
            participant1,
            participant2,
            Arc::new(Mutex::new(local)),
        )?;
        tracing::debug!(asset = %self.asset, channel = %channel, "channel mirrored");
        Ok(handle)
    }

    pub async fn on_deposited(
        &self,
        channel: &Address,
        participant: &Address,
        total: TokenAmount,
    ) -> Result<(), ChannelError> {
        let handle = self
            .registry
            .get(channel)
            .ok_or(ChannelError::NoSuchChannel(*channel))?;
        let result = handle.lock().await.set_deposit(participant, total);
        result
    }

    pub async fn on_closed(
        &self,
        channel: &Address,
        closer: &Address,
        block: BlockNumber,
    ) -> Result<(), ChannelError> {
        let handle = self
            .registry
            .get(channel)
            .ok_or(ChannelError::NoSuchChannel(*channel))?;
        let result = handle.lock().await.on_closed(closer, block);
        result
    }

    /// Mirror a settlement and free the pair for a new channel.
    pub async fn on_settled(&self, channel: &Address) -> Result<(), ChannelError> {
        let handle = self
            .registry
            .get(channel)
            .ok_or(ChannelError::NoSuchChannel(*channel))?;
        let mut local = handle.lock().await;
        local.on_settled()?;
        self.registry
            .release(&local.participants[0].address, &local.participants[1].address);
        Ok(())
    }
}
