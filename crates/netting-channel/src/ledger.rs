use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use netting_core::{
    Address, BalanceProof, BlockNumber, BlockTimeout, ChannelState, Lock, Nonce, Secret,
    SecretHash, TokenAmount,
};

use crate::channel::{Channel, Payouts};
use crate::error::LedgerError;

/// Ledger view of a channel, as returned by [`LedgerGateway::channel_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel: Address,
    pub asset: Address,
    /// Creator first.
    pub participants: [Address; 2],
    pub deposits: [TokenAmount; 2],
    pub settle_timeout: BlockTimeout,
    pub state: ChannelState,
    pub opened_at: Option<BlockNumber>,
    pub closed_at: Option<BlockNumber>,
    pub closing_participant: Option<Address>,
}

impl From<&Channel> for ChannelInfo {
    fn from(channel: &Channel) -> Self {
        Self {
            channel: channel.address,
            asset: channel.asset,
            participants: [
                channel.participants[0].address,
                channel.participants[1].address,
            ],
            deposits: [
                channel.participants[0].deposit,
                channel.participants[1].deposit,
            ],
            settle_timeout: channel.settle_timeout,
            state: channel.state,
            opened_at: channel.opened_at,
            closed_at: channel.closed_at,
            closing_participant: channel.closing_participant,
        }
    }
}

/// Events published by the ledger, in the order they were applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    AssetAdded {
        asset: Address,
        block: BlockNumber,
    },
    ChannelOpened {
        channel: Address,
        asset: Address,
        /// The participant that created the channel.
        participant1: Address,
        participant2: Address,
        settle_timeout: BlockTimeout,
        block: BlockNumber,
    },
    Deposited {
        channel: Address,
        asset: Address,
        participant: Address,
        total_deposit: TokenAmount,
        block: BlockNumber,
    },
    ChannelClosed {
        channel: Address,
        asset: Address,
        closing_participant: Address,
        block: BlockNumber,
    },
    TransferUpdated {
        channel: Address,
        asset: Address,
        submitter: Address,
        nonce: Nonce,
        block: BlockNumber,
    },
    LockClaimed {
        channel: Address,
        asset: Address,
        claimant: Address,
        hashlock: SecretHash,
        secret: Secret,
        block: BlockNumber,
    },
    ChannelSettled {
        channel: Address,
        asset: Address,
        payouts: Payouts,
        block: BlockNumber,
    },
}

impl LedgerEvent {
    /// Channel the event refers to, if any.
    pub fn channel(&self) -> Option<Address> {
        match self {
            Self::AssetAdded { .. } => None,
            Self::ChannelOpened { channel, .. }
            | Self::Deposited { channel, .. }
            | Self::ChannelClosed { channel, .. }
            | Self::TransferUpdated { channel, .. }
            | Self::LockClaimed { channel, .. }
            | Self::ChannelSettled { channel, .. } => Some(*channel),
        }
    }

    pub fn asset(&self) -> Address {
        match self {
            Self::AssetAdded { asset, .. }
            | Self::ChannelOpened { asset, .. }
            | Self::Deposited { asset, .. }
            | Self::ChannelClosed { asset, .. }
            | Self::TransferUpdated { asset, .. }
            | Self::LockClaimed { asset, .. }
            | Self::ChannelSettled { asset, .. } => *asset,
        }
    }

    pub fn block(&self) -> BlockNumber {
        match self {
            Self::AssetAdded { block, .. }
            | Self::ChannelOpened { block, .. }
            | Self::Deposited { block, .. }
            | Self::ChannelClosed { block, .. }
            | Self::TransferUpdated { block, .. }
            | Self::LockClaimed { block, .. }
            | Self::ChannelSettled { block, .. } => *block,
        }
    }
}

/// Settlement ledger interface, bound to the calling participant.
///
/// Every state-changing call is attributed to [`LedgerGateway::caller`].
/// Errors are the ledger's own and are surfaced to callers unchanged.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Address the gateway acts for.
    fn caller(&self) -> Address;

    /// Open a channel with `partner` for `asset`. The caller becomes participant1.
    async fn open_channel(
        &self,
        asset: Address,
        partner: Address,
        settle_timeout: BlockTimeout,
    ) -> Result<Address, LedgerError>;

    /// The caller's non-settled channel with `partner`.
    async fn channel_of(&self, asset: Address, partner: Address) -> Result<Address, LedgerError>;

    /// Non-settled channels `participant` takes part in.
    async fn channels_of(
        &self,
        asset: Address,
        participant: Address,
    ) -> Result<BTreeSet<Address>, LedgerError>;

    /// Registered assets.
    async fn assets(&self) -> Vec<Address>;

    async fn channel_info(&self, channel: Address) -> Result<ChannelInfo, LedgerError>;

    /// Add to the caller's deposit. Returns the new total deposit.
    async fn deposit(&self, channel: Address, amount: TokenAmount)
        -> Result<TokenAmount, LedgerError>;

    /// Close with the partner's latest balance proof and its pending locks.
    async fn close(
        &self,
        channel: Address,
        partner_proof: Option<BalanceProof>,
        locks: Vec<Lock>,
    ) -> Result<(), LedgerError>;

    /// Submit the closer's newer proof during the settle window.
    async fn update_transfer(
        &self,
        channel: Address,
        proof: BalanceProof,
        locks: Vec<Lock>,
    ) -> Result<(), LedgerError>;

    /// Reveal a secret on the ledger to claim a lock the partner sent.
    async fn claim_lock(&self, channel: Address, secret: Secret) -> Result<(), LedgerError>;

    async fn settle(&self, channel: Address) -> Result<Payouts, LedgerError>;

    /// Stream of ledger events from this point on.
    fn subscribe(&self) -> broadcast::Receiver<LedgerEvent>;
}
