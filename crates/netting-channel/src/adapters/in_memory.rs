use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex};

use netting_core::{
    Address, BalanceProof, BlockClock, BlockTimeout, Lock, ProtocolConfig, Secret, TokenAmount,
};
use netting_crypto::Crypto;

use crate::channel::{Channel, Payouts};
use crate::error::{ChannelError, LedgerError};
use crate::ledger::{ChannelInfo, LedgerEvent, LedgerGateway};
use crate::manager::ChannelRegistry;

#[derive(Default)]
struct LedgerState {
    assets: BTreeMap<Address, ChannelRegistry<Channel>>,
    channel_assets: HashMap<Address, Address>,
    channels_created: u64,
}

impl LedgerState {
    fn registry(&self, asset: &Address) -> Result<&ChannelRegistry<Channel>, LedgerError> {
        self.assets
            .get(asset)
            .ok_or_else(|| LedgerError::TransactionReverted(format!("unknown asset {}", asset)))
    }

    /// Run `f` against a channel record, mapping channel errors to reverts.
    fn with_channel<R>(
        &self,
        channel: &Address,
        f: impl FnOnce(&mut Channel) -> Result<R, ChannelError>,
    ) -> Result<(R, Address), LedgerError> {
        let asset = *self
            .channel_assets
            .get(channel)
            .ok_or(LedgerError::NoSuchChannel(*channel))?;
        let registry = self.registry(&asset)?;
        let mut record = registry
            .get_mut(channel)
            .ok_or(LedgerError::NoSuchChannel(*channel))?;
        let result = f(record.value_mut()).map_err(revert)?;
        Ok((result, asset))
    }
}

fn revert(err: ChannelError) -> LedgerError {
    match err {
        ChannelError::Ledger(inner) => inner,
        other => LedgerError::TransactionReverted(other.to_string()),
    }
}

/// In-process settlement ledger.
///
/// Holds the authoritative channel records and token balances of one network
/// run. Every state change is applied under a single lock, stamped with the
/// current block and published as a [`LedgerEvent`].
pub struct InMemoryLedger {
    clock: BlockClock,
    min_settle_timeout: BlockTimeout,
    crypto: Arc<dyn Crypto>,
    state: Mutex<LedgerState>,
    /// Token balances keyed by (asset, holder).
    balances: DashMap<(Address, Address), TokenAmount>,
    events: broadcast::Sender<LedgerEvent>,
}

impl InMemoryLedger {
    pub fn new(clock: BlockClock, config: &ProtocolConfig, crypto: Arc<dyn Crypto>) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            clock,
            min_settle_timeout: config.min_settle_timeout,
            crypto,
            state: Mutex::new(LedgerState::default()),
            balances: DashMap::new(),
            events,
        }
    }

    /// Gateway acting as `caller`.
    pub fn client(self: &Arc<Self>, caller: Address) -> LedgerClient {
        LedgerClient {
            ledger: self.clone(),
            caller,
        }
    }

    pub fn clock(&self) -> &BlockClock {
        &self.clock
    }

    fn publish(&self, event: LedgerEvent) {
        tracing::debug!(event = ?event, "ledger event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    pub async fn register_asset(&self, asset: Address) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if state.assets.contains_key(&asset) {
            return Err(LedgerError::TransactionReverted(format!(
                "asset {} already registered",
                asset
            )));
        }
        state.assets.insert(asset, ChannelRegistry::new());
        tracing::info!(asset = %asset, "asset registered");
        self.publish(LedgerEvent::AssetAdded {
            asset,
            block: self.clock.now(),
        });
        Ok(())
    }

    /// Credit `amount` of `asset` to `holder`.
    pub fn mint(&self, asset: Address, holder: Address, amount: TokenAmount) {
        *self.balances.entry((asset, holder)).or_insert(0) += amount;
    }

    pub fn balance_of(&self, asset: Address, holder: Address) -> TokenAmount {
        self.balances
            .get(&(asset, holder))
            .map(|b| *b)
            .unwrap_or(0)
    }

    pub async fn assets(&self) -> Vec<Address> {
        self.state.lock().await.assets.keys().copied().collect()
    }

    pub async fn open_channel(
        &self,
        caller: Address,
        asset: Address,
        partner: Address,
        settle_timeout: BlockTimeout,
    ) -> Result<Address, LedgerError> {
        if settle_timeout < self.min_settle_timeout {
            return Err(LedgerError::InvalidSettleTimeout {
                given: settle_timeout,
                min: self.min_settle_timeout,
            });
        }
        if caller == partner {
            return Err(LedgerError::TransactionReverted(
                "cannot open a channel with oneself".into(),
            ));
        }

        let mut state = self.state.lock().await;
        state.channels_created += 1;
        let mut seed = Vec::with_capacity(104);
        seed.extend_from_slice(asset.as_bytes());
        seed.extend_from_slice(caller.as_bytes());
        seed.extend_from_slice(partner.as_bytes());
        seed.extend_from_slice(&state.channels_created.to_be_bytes());
        let address = Address::derive("netting/channel", &seed);

        let now = self.clock.now();
        let mut channel = Channel::new(
            address,
            asset,
            caller,
            partner,
            settle_timeout,
            self.crypto.clone(),
        );
        channel.open(now).map_err(revert)?;
        state.registry(&asset)?.register(address, caller, partner, channel)?;
        state.channel_assets.insert(address, asset);

        tracing::info!(asset = %asset, channel = %address, participant1 = %caller, participant2 = %partner, "channel created on ledger");
        self.publish(LedgerEvent::ChannelOpened {
            channel: address,
            asset,
            participant1: caller,
            participant2: partner,
            settle_timeout,
            block: now,
        });
        Ok(address)
    }

    pub async fn channel_of(
        &self,
        asset: Address,
        participant: Address,
        partner: Address,
    ) -> Result<Address, LedgerError> {
        let state = self.state.lock().await;
        state
            .registry(&asset)?
            .channel_between(&participant, &partner)
            .ok_or(LedgerError::NoSuchChannel(partner))
    }

    pub async fn channels_of(
        &self,
        asset: Address,
        participant: Address,
    ) -> Result<BTreeSet<Address>, LedgerError> {
        let state = self.state.lock().await;
        Ok(state.registry(&asset)?.channels_of(&participant))
    }

    pub async fn channel_info(&self, channel: Address) -> Result<ChannelInfo, LedgerError> {
        let state = self.state.lock().await;
        let (info, _) = state.with_channel(&channel, |c| Ok(ChannelInfo::from(&*c)))?;
        Ok(info)
    }

    pub async fn deposit(
        &self,
        caller: Address,
        channel: Address,
        amount: TokenAmount,
    ) -> Result<TokenAmount, LedgerError> {
        let state = self.state.lock().await;
        let asset = *state
            .channel_assets
            .get(&channel)
            .ok_or(LedgerError::NoSuchChannel(channel))?;
        let available = self.balance_of(asset, caller);
        if available < amount {
            return Err(LedgerError::TransactionReverted(format!(
                "insufficient balance: available {}, required {}",
                available, amount
            )));
        }
        let (total, _) = state.with_channel(&channel, |c| c.deposit(&caller, amount))?;
        if let Some(mut balance) = self.balances.get_mut(&(asset, caller)) {
            *balance -= amount;
        }
        self.publish(LedgerEvent::Deposited {
            channel,
            asset,
            participant: caller,
            total_deposit: total,
            block: self.clock.now(),
        });
        Ok(total)
    }

    pub async fn close(
        &self,
        caller: Address,
        channel: Address,
        partner_proof: Option<BalanceProof>,
        locks: Vec<Lock>,
    ) -> Result<(), LedgerError> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let (_, asset) =
            state.with_channel(&channel, |c| c.close(&caller, partner_proof, locks, now))?;
        self.publish(LedgerEvent::ChannelClosed {
            channel,
            asset,
            closing_participant: caller,
            block: now,
        });
        Ok(())
    }

    pub async fn update_transfer(
        &self,
        caller: Address,
        channel: Address,
        proof: BalanceProof,
        locks: Vec<Lock>,
    ) -> Result<(), LedgerError> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let nonce = proof.nonce;
        let (_, asset) = state.with_channel(&channel, |c| c.dispute(&caller, proof, locks, now))?;
        self.publish(LedgerEvent::TransferUpdated {
            channel,
            asset,
            submitter: caller,
            nonce,
            block: now,
        });
        Ok(())
    }

    pub async fn claim_lock(
        &self,
        caller: Address,
        channel: Address,
        secret: Secret,
    ) -> Result<(), LedgerError> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let (lock, asset) = state.with_channel(&channel, |c| c.claim_lock(&caller, &secret, now))?;
        self.publish(LedgerEvent::LockClaimed {
            channel,
            asset,
            claimant: caller,
            hashlock: lock.hashlock,
            secret,
            block: now,
        });
        Ok(())
    }

    /// Settle a channel. Anyone may call once the settle window has elapsed.
    pub async fn settle(&self, channel: Address) -> Result<Payouts, LedgerError> {
        let state = self.state.lock().await;
        let now = self.clock.now();
        let (payouts, asset) = state.with_channel(&channel, |c| c.settle(now))?;
        for (holder, amount) in payouts.entries {
            if amount > 0 {
                self.mint(asset, holder, amount);
            }
        }
        state
            .registry(&asset)?
            .release(&payouts.entries[0].0, &payouts.entries[1].0);
        self.publish(LedgerEvent::ChannelSettled {
            channel,
            asset,
            payouts: payouts.clone(),
            block: now,
        });
        Ok(payouts)
    }
}

/// [`LedgerGateway`] for one participant of an [`InMemoryLedger`].
#[derive(Clone)]
pub struct LedgerClient {
    ledger: Arc<InMemoryLedger>,
    caller: Address,
}

impl LedgerClient {
    pub fn ledger(&self) -> &Arc<InMemoryLedger> {
        &self.ledger
    }
}

#[async_trait]
impl LedgerGateway for LedgerClient {
    fn caller(&self) -> Address {
        self.caller
    }

    async fn open_channel(
        &self,
        asset: Address,
        partner: Address,
        settle_timeout: BlockTimeout,
    ) -> Result<Address, LedgerError> {
        self.ledger
            .open_channel(self.caller, asset, partner, settle_timeout)
            .await
    }

    async fn channel_of(&self, asset: Address, partner: Address) -> Result<Address, LedgerError> {
        self.ledger.channel_of(asset, self.caller, partner).await
    }

    async fn channels_of(
        &self,
        asset: Address,
        participant: Address,
    ) -> Result<BTreeSet<Address>, LedgerError> {
        self.ledger.channels_of(asset, participant).await
    }

    async fn assets(&self) -> Vec<Address> {
        self.ledger.assets().await
    }

    async fn channel_info(&self, channel: Address) -> Result<ChannelInfo, LedgerError> {
        self.ledger.channel_info(channel).await
    }

    async fn deposit(
        &self,
        channel: Address,
        amount: TokenAmount,
    ) -> Result<TokenAmount, LedgerError> {
        self.ledger.deposit(self.caller, channel, amount).await
    }

    async fn close(
        &self,
        channel: Address,
        partner_proof: Option<BalanceProof>,
        locks: Vec<Lock>,
    ) -> Result<(), LedgerError> {
        self.ledger
            .close(self.caller, channel, partner_proof, locks)
            .await
    }

    async fn update_transfer(
        &self,
        channel: Address,
        proof: BalanceProof,
        locks: Vec<Lock>,
    ) -> Result<(), LedgerError> {
        self.ledger
            .update_transfer(self.caller, channel, proof, locks)
            .await
    }

    async fn claim_lock(&self, channel: Address, secret: Secret) -> Result<(), LedgerError> {
        self.ledger.claim_lock(self.caller, channel, secret).await
    }

    async fn settle(&self, channel: Address) -> Result<Payouts, LedgerError> {
        self.ledger.settle(channel).await
    }

    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.ledger.subscribe()
    }
}
