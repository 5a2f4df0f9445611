//! Netting node: ties the per-asset channel managers, the transfer
//! coordinator, and the background tasks together.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use netting_channel::{
    Channel, ChannelError, ChannelHandle, LedgerEvent, LedgerGateway, Payouts,
};
use netting_core::{
    Address, BlockClock, BlockTimeout, Message, ProtocolConfig, SecretHash, TokenAmount,
};
use netting_crypto::{Crypto, KeyPair};
use netting_network::{IncomingMessage, SignedMessage, Transport};

use crate::asset::AssetManager;
use crate::coordinator::{InitiatorEvent, TransferRecord, TransferStatus};
use crate::error::NodeError;
use crate::handle::{transfer_handle, AsyncTransferHandle};
use crate::inbound::ProofStream;

/// External services a node runs against.
pub struct NodeServices {
    pub ledger: Arc<dyn LedgerGateway>,
    pub transport: Arc<dyn Transport>,
    /// Raw payloads addressed to this node.
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    pub clock: BlockClock,
    pub crypto: Arc<dyn Crypto>,
}

/// State shared by the node's public API and its background tasks.
pub(crate) struct NodeInner {
    pub(crate) keypair: KeyPair,
    pub(crate) address: Address,
    pub(crate) config: ProtocolConfig,
    pub(crate) crypto: Arc<dyn Crypto>,
    pub(crate) ledger: Arc<dyn LedgerGateway>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) clock: BlockClock,
    pub(crate) assets: DashMap<Address, Arc<AssetManager>>,
    pub(crate) transfers: DashMap<SecretHash, TransferRecord>,
    pub(crate) initiators: DashMap<SecretHash, mpsc::UnboundedSender<InitiatorEvent>>,
    /// Inbound ordering state per `(channel, sender)`.
    pub(crate) streams: DashMap<(Address, Address), ProofStream>,
}

/// A running netting node.
pub struct Node {
    inner: Arc<NodeInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a node: subscribe to the ledger, mirror the registered assets and
    /// spawn the inbound, ledger-event, and expiry tasks.
    pub async fn start(
        keypair: KeyPair,
        config: ProtocolConfig,
        services: NodeServices,
    ) -> Result<Self, NodeError> {
        let NodeServices {
            ledger,
            transport,
            inbound,
            clock,
            crypto,
        } = services;

        let address = keypair.address();
        if ledger.caller() != address {
            return Err(NodeError::Ledger(netting_channel::LedgerError::TransactionReverted(
                format!("ledger gateway acts for {}, not {}", ledger.caller(), address),
            )));
        }

        // Subscribe before reading assets so nothing registered in between is missed.
        let events = ledger.subscribe();

        let inner = Arc::new(NodeInner {
            keypair,
            address,
            config,
            crypto,
            ledger,
            transport,
            clock,
            assets: DashMap::new(),
            transfers: DashMap::new(),
            initiators: DashMap::new(),
            streams: DashMap::new(),
        });
        for asset in inner.ledger.assets().await {
            inner.ensure_asset(asset);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(run_inbound(inner.clone(), inbound, shutdown_rx.clone())),
            tokio::spawn(run_ledger_events(inner.clone(), events, shutdown_rx.clone())),
            tokio::spawn(run_sweeper(inner.clone(), shutdown_rx)),
        ];

        tracing::info!(node = %address, "netting node started");
        Ok(Self {
            inner,
            shutdown_tx,
            tasks,
        })
    }

    pub fn address(&self) -> Address {
        self.inner.address
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.inner.config
    }

    pub fn assets(&self) -> Vec<Address> {
        self.inner.assets.iter().map(|entry| *entry.key()).collect()
    }

    pub fn asset_manager(&self, asset: &Address) -> Result<Arc<AssetManager>, NodeError> {
        self.inner.asset_manager(asset)
    }

    /// Open a channel with `partner` and return its address.
    pub async fn open_channel(
        &self,
        asset: Address,
        partner: Address,
        settle_timeout: BlockTimeout,
    ) -> Result<Address, NodeError> {
        let manager = self.inner.asset_manager(&asset)?;
        let handle = manager.channels().open(partner, settle_timeout).await?;
        let channel = handle.lock().await;
        manager.refresh_capacity(&channel);
        Ok(channel.address)
    }

    /// Add to our deposit in the channel with `partner`. Returns the new total.
    pub async fn deposit(
        &self,
        asset: Address,
        partner: Address,
        amount: TokenAmount,
    ) -> Result<TokenAmount, NodeError> {
        let manager = self.inner.asset_manager(&asset)?;
        let total = manager.channels().deposit(&partner, amount).await?;
        let handle = manager.channels().channel_with(&partner)?;
        let channel = handle.lock().await;
        manager.refresh_capacity(&channel);
        Ok(total)
    }

    /// Close our channel with `partner` on the ledger and claim every lock we
    /// hold a secret for.
    pub async fn close_channel(&self, asset: Address, partner: Address) -> Result<(), NodeError> {
        let manager = self.inner.asset_manager(&asset)?;
        let handle = manager.channels().channel_with(&partner)?;
        let mut channel = handle.lock().await;
        self.inner.close_locked(&manager, &mut channel).await
    }

    /// Settle a closed channel once its settle window has elapsed.
    pub async fn settle_channel(&self, asset: Address, partner: Address) -> Result<Payouts, NodeError> {
        let manager = self.inner.asset_manager(&asset)?;
        let handle = manager.channels().channel_with(&partner)?;
        let address = handle.lock().await.address;
        Ok(self.inner.ledger.settle(address).await?)
    }

    /// Copy of our channel with `partner`.
    pub async fn channel_snapshot(&self, asset: Address, partner: Address) -> Result<Channel, NodeError> {
        let manager = self.inner.asset_manager(&asset)?;
        let handle = manager.channels().channel_with(&partner)?;
        let channel = handle.lock().await.clone();
        Ok(channel)
    }

    /// Pay `amount` to `target`, directly when a funded channel exists,
    /// otherwise over a mediated route. Returns without waiting.
    pub async fn transfer_async(
        &self,
        asset: Address,
        amount: TokenAmount,
        target: Address,
    ) -> Result<AsyncTransferHandle, NodeError> {
        self.start_transfer(asset, amount, target, true)
    }

    /// Like [`Node::transfer_async`] but always over a hash-locked route.
    pub async fn mediated_transfer_async(
        &self,
        asset: Address,
        amount: TokenAmount,
        target: Address,
    ) -> Result<AsyncTransferHandle, NodeError> {
        self.start_transfer(asset, amount, target, false)
    }

    fn start_transfer(
        &self,
        asset: Address,
        amount: TokenAmount,
        target: Address,
        allow_direct: bool,
    ) -> Result<AsyncTransferHandle, NodeError> {
        if amount == 0 {
            return Err(NodeError::InvalidTransfer("amount must be positive".into()));
        }
        if target == self.inner.address {
            return Err(NodeError::InvalidTransfer("cannot pay oneself".into()));
        }
        let manager = self.inner.asset_manager(&asset)?;
        let (handle, resolver) = transfer_handle();
        tracing::info!(
            transfer_id = %handle.id(),
            asset = %asset,
            target = %target,
            amount,
            "transfer started"
        );
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner
                .run_transfer(manager, amount, target, allow_direct, resolver)
                .await;
        });
        Ok(handle)
    }

    /// This node's view of the transfer locked with `hashlock`.
    pub fn transfer_record(&self, hashlock: &SecretHash) -> Option<TransferRecord> {
        self.inner.transfers.get(hashlock).map(|r| r.clone())
    }

    /// Transfer records in which this node took part, any role.
    pub fn transfer_records(&self) -> Vec<TransferRecord> {
        self.inner.transfers.iter().map(|r| r.value().clone()).collect()
    }

    /// Out-of-order proofs waiting for their predecessor, over all channels.
    pub fn held_proofs(&self) -> usize {
        self.inner.streams.iter().map(|s| s.held()).sum()
    }

    /// Stop the background tasks and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "node task failed");
            }
        }
        tracing::info!(node = %self.inner.address, "netting node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl NodeInner {
    pub(crate) fn ensure_asset(&self, asset: Address) -> Arc<AssetManager> {
        self.assets
            .entry(asset)
            .or_insert_with(|| {
                tracing::debug!(node = %self.address, asset = %asset, "asset tracked");
                Arc::new(AssetManager::new(
                    asset,
                    self.ledger.clone(),
                    self.crypto.clone(),
                    &self.config,
                ))
            })
            .clone()
    }

    pub(crate) fn asset_manager(&self, asset: &Address) -> Result<Arc<AssetManager>, NodeError> {
        self.assets
            .get(asset)
            .map(|m| m.clone())
            .ok_or(NodeError::UnknownAsset(*asset))
    }

    /// Locate a channel by address across all assets.
    pub(crate) fn channel_for(
        &self,
        channel: &Address,
    ) -> Result<(Arc<AssetManager>, ChannelHandle), NodeError> {
        let managers: Vec<Arc<AssetManager>> =
            self.assets.iter().map(|entry| entry.value().clone()).collect();
        managers
            .into_iter()
            .find_map(|m| m.channels().channel(channel).map(|h| (m, h)))
            .ok_or(NodeError::Channel(ChannelError::NoSuchChannel(*channel)))
    }

    /// Sign and send `message` to `recipient`. Failures are logged.
    pub(crate) async fn send(&self, recipient: Address, message: Message) {
        let kind = message.kind();
        let payload = SignedMessage::sign(message, &self.keypair, self.crypto.as_ref())
            .and_then(|envelope| envelope.encode());
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, kind, "failed to encode message");
                return;
            }
        };
        if let Err(e) = self.transport.send(recipient, payload).await {
            tracing::warn!(error = %e, peer = %recipient, kind, "failed to send message");
        } else {
            tracing::trace!(peer = %recipient, kind, "message sent");
        }
    }

    /// Atomically move the record for `hashlock` to `to` if its status is one
    /// of `from`. Returns the record as it was before the change.
    pub(crate) fn transition(
        &self,
        hashlock: &SecretHash,
        from: &[TransferStatus],
        to: TransferStatus,
    ) -> Option<TransferRecord> {
        let mut record = self.transfers.get_mut(hashlock)?;
        if !from.contains(&record.status) {
            return None;
        }
        let before = record.clone();
        record.status = to;
        if to.is_final() {
            record.finished_at = Some(self.clock.now());
        }
        tracing::debug!(
            hashlock = %hashlock,
            role = ?record.role,
            from = ?before.status,
            to = ?to,
            "transfer state transition"
        );
        Some(before)
    }

    /// Close `channel` on the ledger with the partner's latest proof, then
    /// claim the locks we know secrets for.
    pub(crate) async fn close_locked(
        &self,
        manager: &AssetManager,
        channel: &mut Channel,
    ) -> Result<(), NodeError> {
        if !channel.state.is_usable() {
            return Err(ChannelError::InvalidState {
                channel: channel.address,
                state: channel.state,
            }
            .into());
        }
        let (proof, locks) = channel.closing_evidence(&self.address)?;
        self.ledger.close(channel.address, proof, locks).await?;
        manager.graph().remove_channel(&channel.address);
        tracing::info!(node = %self.address, channel = %channel.address, "channel closed");
        self.claim_known_locks(channel).await;
        Ok(())
    }

    /// Claim on the ledger every lock sent to us whose secret we know.
    pub(crate) async fn claim_known_locks(&self, channel: &Channel) {
        let secrets = match channel.claimable_secrets(&self.address) {
            Ok(secrets) => secrets,
            Err(e) => {
                tracing::warn!(error = %e, channel = %channel.address, "cannot list claimable locks");
                return;
            }
        };
        for secret in secrets {
            match self.ledger.claim_lock(channel.address, secret).await {
                Ok(()) => tracing::info!(
                    channel = %channel.address,
                    hashlock = %secret.hashlock(),
                    "lock claimed on ledger"
                ),
                Err(e) => tracing::debug!(error = %e, channel = %channel.address, "lock claim rejected"),
            }
        }
    }

    /// Close the channel a misbehaving partner sent a proof on.
    async fn close_for_violation(&self, channel: &Address) {
        let Ok((manager, handle)) = self.channel_for(channel) else {
            return;
        };
        let mut local = handle.lock().await;
        if let Err(e) = self.close_locked(&manager, &mut local).await {
            tracing::error!(error = %e, channel = %channel, "failed to close channel after violation");
        }
    }

    /// Process one authenticated message, then any held successors it unblocks.
    async fn dispatch(&self, incoming: IncomingMessage) {
        let mut queue = VecDeque::from([incoming]);
        while let Some(msg) = queue.pop_front() {
            let proof = msg
                .message
                .balance_proof()
                .map(|p| (p.channel, p.nonce, p.digest()));
            if let Some((channel, nonce, digest)) = proof {
                let duplicate = self
                    .streams
                    .get(&(channel, msg.sender))
                    .is_some_and(|stream| stream.is_duplicate(nonce, &digest));
                if duplicate {
                    tracing::trace!(sender = %msg.sender, nonce, "duplicate proof ignored");
                    continue;
                }
            }

            match self.handle_message(&msg).await {
                Ok(()) => {
                    let Some((channel, nonce, digest)) = proof else {
                        continue;
                    };
                    let next = self
                        .streams
                        .entry((channel, msg.sender))
                        .or_default()
                        .applied(nonce, digest);
                    if let Some(next) = next {
                        queue.push_back(next);
                    }
                }
                Err(NodeError::Channel(ChannelError::NonceGap { expected, received })) => {
                    let Some((channel, nonce, _)) = proof else {
                        continue;
                    };
                    let sender = msg.sender;
                    let held = self
                        .streams
                        .entry((channel, sender))
                        .or_default()
                        .hold(expected, nonce, msg);
                    if held {
                        tracing::debug!(
                            channel = %channel,
                            sender = %sender,
                            expected,
                            received,
                            "holding out-of-order message"
                        );
                    } else {
                        tracing::warn!(
                            channel = %channel,
                            sender = %sender,
                            expected,
                            received,
                            "dropping message too far ahead of the channel"
                        );
                    }
                }
                Err(NodeError::Channel(ChannelError::Duplicate(nonce))) => {
                    tracing::trace!(sender = %msg.sender, nonce, "duplicate message ignored");
                }
                Err(e) if e.is_fatal() => {
                    tracing::warn!(error = %e, sender = %msg.sender, "partner violated the protocol");
                    if let Some((channel, _, _)) = proof {
                        self.close_for_violation(&channel).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        sender = %msg.sender,
                        kind = msg.message.kind(),
                        "message rejected"
                    );
                }
            }
        }
    }

    async fn on_ledger_event(&self, event: LedgerEvent) {
        let manager = self.ensure_asset(event.asset());
        if let Err(e) = manager.apply_ledger_event(&event).await {
            tracing::debug!(error = %e, block = event.block(), "ledger event not mirrored");
        }

        if let LedgerEvent::ChannelClosed { channel, .. } | LedgerEvent::ChannelSettled { channel, .. } =
            &event
        {
            self.streams.retain(|(stream_channel, _), _| stream_channel != channel);
        }

        match event {
            LedgerEvent::ChannelClosed {
                channel,
                closing_participant,
                ..
            } if closing_participant != self.address => {
                self.contest_close(&manager, &channel).await;
            }
            LedgerEvent::LockClaimed {
                claimant, secret, ..
            } if claimant != self.address => {
                self.on_secret_claimed(claimant, secret).await;
            }
            _ => {}
        }
    }

    /// The partner closed: submit their latest proof and claim our locks.
    async fn contest_close(&self, manager: &AssetManager, channel: &Address) {
        let Some(handle) = manager.channels().channel(channel) else {
            return;
        };
        let local = handle.lock().await;
        if !local.is_participant(&self.address) {
            return;
        }
        match local.closing_evidence(&self.address) {
            Ok((Some(proof), locks)) => {
                let nonce = proof.nonce;
                match self.ledger.update_transfer(*channel, proof, locks).await {
                    Ok(()) => tracing::info!(channel = %channel, nonce, "closing proof updated"),
                    Err(e) => tracing::warn!(error = %e, channel = %channel, "update transfer failed"),
                }
            }
            Ok((None, _)) => {}
            Err(e) => tracing::warn!(error = %e, channel = %channel, "no closing evidence"),
        }
        self.claim_known_locks(&local).await;
    }
}

async fn run_inbound(
    inner: Arc<NodeInner>,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            payload = inbound.recv() => {
                let Some(payload) = payload else { break };
                match SignedMessage::open(&payload, inner.crypto.as_ref()) {
                    Ok(envelope) => {
                        inner.dispatch(envelope.into()).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, node = %inner.address, "dropping invalid message");
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::debug!(node = %inner.address, "inbound loop stopped");
}

async fn run_ledger_events(
    inner: Arc<NodeInner>,
    mut events: broadcast::Receiver<LedgerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => inner.on_ledger_event(event).await,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(node = %inner.address, skipped = n, "ledger event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::debug!(node = %inner.address, "ledger event loop stopped");
}

async fn run_sweeper(inner: Arc<NodeInner>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut blocks = inner.clock.subscribe();
    loop {
        tokio::select! {
            changed = blocks.changed() => {
                if changed.is_err() {
                    break;
                }
                let now = *blocks.borrow_and_update();
                inner.sweep(now).await;
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    tracing::debug!(node = %inner.address, "sweeper stopped");
}
