//! Mediated transfer coordination.
//!
//! A node plays one of three roles per hashlock. The initiator picks a route,
//! locks funds towards the first hop, and reveals the secret to the target
//! once the target asks for it. Mediators forward the lock with a shorter
//! expiration and pass secrets back towards the initiator. The target asks
//! the initiator for the secret and reveals it to its payer.
//!
//! Every handler runs on the node's inbound loop, one message at a time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use netting_core::{
    Address, BalanceProof, BlockNumber, FailureReason, Lock, Message, Secret, SecretHash,
    TokenAmount,
};
use netting_crypto::generate_secret;
use netting_network::IncomingMessage;
use netting_routing::{ExcludedEdges, Path};

use crate::asset::AssetManager;
use crate::error::NodeError;
use crate::handle::{FailureCause, TransferOutcome, TransferResolver};
use crate::node::NodeInner;

/// Part this node plays in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Initiator,
    Mediator,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    /// Lock sent or received, secret not yet known to this node's payee side.
    Pending,
    /// Secret revealed: to the target (initiator), by the payee (mediator),
    /// or by the initiator (target).
    SecretRevealed,
    Completed,
    Failed,
    Expired,
}

impl TransferStatus {
    /// No further transition leaves this status.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

/// One node's view of a hash-locked transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferRecord {
    pub role: Role,
    pub asset: Address,
    pub hashlock: SecretHash,
    pub initiator: Address,
    pub target: Address,
    pub amount: TokenAmount,
    #[serde(skip)]
    pub secret: Option<Secret>,
    /// Node that locked funds towards us.
    pub payer: Option<Address>,
    /// Node we locked funds towards.
    pub payee: Option<Address>,
    pub incoming: Option<Lock>,
    pub outgoing: Option<Lock>,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    /// Block at which the record reached a final status.
    pub finished_at: Option<BlockNumber>,
}

/// Signals from the inbound loop to a waiting initiator task.
#[derive(Debug, Clone)]
pub(crate) enum InitiatorEvent {
    /// The first hop was paid.
    Unlocked,
    /// A node on the route refused the transfer.
    Failed {
        edge: (Address, Address),
        reason: FailureReason,
    },
    /// The lock expired before the first hop was paid.
    Expired { revealed: bool },
}

/// How one route attempt ended.
enum RouteResult {
    Unlocked,
    Expired,
    Rejected((Address, Address)),
}

const OPEN: &[TransferStatus] = &[TransferStatus::Pending, TransferStatus::SecretRevealed];

impl NodeInner {
    // ---- initiator ----

    pub(crate) async fn run_transfer(
        self: Arc<Self>,
        manager: Arc<AssetManager>,
        amount: TokenAmount,
        target: Address,
        allow_direct: bool,
        resolver: TransferResolver,
    ) {
        if allow_direct && self.try_direct(&manager, amount, target).await {
            resolver.resolve(TransferOutcome::Success);
            return;
        }

        let candidates = match manager.graph().find_paths(
            &self.address,
            &target,
            amount,
            &ExcludedEdges::new(),
            self.config.max_hops,
        ) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::debug!(transfer_id = %resolver.id(), error = %e, "no route to target");
                Vec::new()
            }
        };

        // Each candidate is tried at most once; a refusal rules out every
        // later candidate through the failed edge.
        let mut excluded = ExcludedEdges::new();
        for (attempt, path) in candidates.iter().enumerate() {
            if path.edges().any(|edge| excluded.contains(&edge)) {
                continue;
            }
            tracing::debug!(transfer_id = %resolver.id(), attempt = attempt + 1, path = %path, "trying route");
            match self.attempt_route(&manager, path, amount).await {
                RouteResult::Unlocked => {
                    resolver.resolve(TransferOutcome::Success);
                    return;
                }
                RouteResult::Expired => {
                    resolver.resolve(TransferOutcome::Failed(FailureCause::Expired));
                    return;
                }
                RouteResult::Rejected(edge) => {
                    excluded.insert(edge);
                }
            }
        }
        tracing::debug!(transfer_id = %resolver.id(), tried = candidates.len(), "routes exhausted");
        resolver.resolve(TransferOutcome::Failed(FailureCause::NoPathFound));
    }

    async fn try_direct(&self, manager: &AssetManager, amount: TokenAmount, target: Address) -> bool {
        let Ok(handle) = manager.channels().channel_with(&target) else {
            return false;
        };
        let mut channel = handle.lock().await;
        if !channel.state.is_usable() || channel.distributable(&self.address).unwrap_or(0) < amount {
            return false;
        }
        match channel.create_direct_transfer(&self.keypair, amount) {
            Ok(balance_proof) => {
                manager.refresh_capacity(&channel);
                self.send(target, Message::DirectTransfer { balance_proof }).await;
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, target = %target, "direct transfer not possible");
                false
            }
        }
    }

    async fn attempt_route(&self, manager: &AssetManager, path: &Path, amount: TokenAmount) -> RouteResult {
        let me = self.address;
        let target = path.target();
        let Some(payee) = path.next_after(&me) else {
            return RouteResult::Rejected((me, target));
        };
        let first_edge = (me, payee);
        let Ok(handle) = manager.channels().channel_with(&payee) else {
            return RouteResult::Rejected(first_edge);
        };

        let secret = generate_secret();
        let hashlock = secret.hashlock();
        let now = self.clock.now();
        let lock = Lock::new(
            amount,
            hashlock,
            self.config.initial_expiration(now, path.hop_count()),
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        self.initiators.insert(hashlock, events_tx);
        {
            let mut channel = handle.lock().await;
            let balance_proof = match channel.create_mediated_transfer(&self.keypair, lock, now) {
                Ok(proof) => proof,
                Err(e) => {
                    tracing::debug!(error = %e, payee = %payee, "cannot lock towards first hop");
                    self.initiators.remove(&hashlock);
                    return RouteResult::Rejected(first_edge);
                }
            };
            manager.refresh_capacity(&channel);
            self.transfers.insert(
                hashlock,
                TransferRecord {
                    role: Role::Initiator,
                    asset: manager.asset(),
                    hashlock,
                    initiator: me,
                    target,
                    amount,
                    secret: Some(secret),
                    payer: None,
                    payee: Some(payee),
                    incoming: None,
                    outgoing: Some(lock),
                    status: TransferStatus::Pending,
                    created_at: Utc::now(),
                    finished_at: None,
                },
            );
            self.send(
                payee,
                Message::MediatedTransfer {
                    initiator: me,
                    target,
                    path: path.nodes().to_vec(),
                    lock,
                    balance_proof,
                },
            )
            .await;
        }

        let result = tokio::select! {
            event = events_rx.recv() => match event {
                Some(InitiatorEvent::Unlocked) => RouteResult::Unlocked,
                Some(InitiatorEvent::Failed { edge, reason }) => {
                    tracing::info!(hashlock = %hashlock, from = %edge.0, to = %edge.1, %reason, "route refused");
                    RouteResult::Rejected(edge)
                }
                Some(InitiatorEvent::Expired { revealed }) => Self::expired_route(&hashlock, revealed, first_edge),
                None => RouteResult::Rejected(first_edge),
            },
            _ = self.clock.wait_until(lock.expiration) => {
                match self.transition(&hashlock, OPEN, TransferStatus::Expired) {
                    Some(before) => Self::expired_route(
                        &hashlock,
                        before.status == TransferStatus::SecretRevealed,
                        first_edge,
                    ),
                    None => match events_rx.try_recv() {
                        Ok(InitiatorEvent::Unlocked) => RouteResult::Unlocked,
                        Ok(InitiatorEvent::Failed { edge, .. }) => RouteResult::Rejected(edge),
                        Ok(InitiatorEvent::Expired { revealed }) => {
                            Self::expired_route(&hashlock, revealed, first_edge)
                        }
                        Err(_) => RouteResult::Rejected(first_edge),
                    },
                }
            }
        };
        self.initiators.remove(&hashlock);
        result
    }

    /// A revealed secret may still be claimed downstream, so that route is
    /// not retried with a fresh secret.
    fn expired_route(hashlock: &SecretHash, revealed: bool, first_edge: (Address, Address)) -> RouteResult {
        if revealed {
            tracing::warn!(hashlock = %hashlock, "lock expired after the secret was revealed");
            RouteResult::Expired
        } else {
            tracing::debug!(hashlock = %hashlock, "lock expired unanswered");
            RouteResult::Rejected(first_edge)
        }
    }

    fn notify_initiator(&self, hashlock: &SecretHash, event: InitiatorEvent) {
        if let Some(tx) = self.initiators.get(hashlock) {
            let _ = tx.send(event);
        }
    }

    // ---- inbound messages ----

    pub(crate) async fn handle_message(&self, msg: &IncomingMessage) -> Result<(), NodeError> {
        let sender = msg.sender;
        match &msg.message {
            Message::DirectTransfer { balance_proof } => {
                self.on_direct_transfer(sender, balance_proof).await
            }
            Message::MediatedTransfer {
                initiator,
                target,
                path,
                lock,
                balance_proof,
            } => {
                self.on_mediated_transfer(sender, *initiator, *target, path, *lock, balance_proof)
                    .await
            }
            Message::SecretRequest { hashlock, amount } => {
                self.on_secret_request(sender, hashlock, *amount).await
            }
            Message::RevealSecret { secret } => self.on_reveal_secret(sender, secret).await,
            Message::Unlock {
                secret,
                balance_proof,
            } => self.on_unlock(sender, secret, balance_proof).await,
            Message::RemoveLock {
                hashlock,
                balance_proof,
            } => self.on_remove_lock(sender, hashlock, balance_proof).await,
            Message::TransferFailed {
                hashlock,
                failed_edge,
                reason,
            } => self.on_transfer_failed(sender, hashlock, *failed_edge, *reason).await,
        }
    }

    async fn on_direct_transfer(&self, sender: Address, proof: &BalanceProof) -> Result<(), NodeError> {
        let (manager, handle) = self.channel_for(&proof.channel)?;
        let mut channel = handle.lock().await;
        let amount = channel.register_direct_transfer(&sender, proof.clone())?;
        manager.refresh_capacity(&channel);
        tracing::info!(node = %self.address, from = %sender, amount, "direct transfer received");
        Ok(())
    }

    async fn on_mediated_transfer(
        &self,
        sender: Address,
        initiator: Address,
        target: Address,
        path: &[Address],
        lock: Lock,
        proof: &BalanceProof,
    ) -> Result<(), NodeError> {
        let (manager, handle) = self.channel_for(&proof.channel)?;
        let now = self.clock.now();
        {
            let mut channel = handle.lock().await;
            channel.register_mediated_transfer(&sender, lock, proof.clone(), now)?;
            manager.refresh_capacity(&channel);
        }

        let hashlock = lock.hashlock;
        if self.transfers.contains_key(&hashlock) {
            tracing::warn!(hashlock = %hashlock, from = %sender, "hashlock already in use");
            self.refuse(&manager, sender, hashlock, (sender, self.address), FailureReason::InvalidRoute)
                .await;
            return Ok(());
        }

        let mut record = TransferRecord {
            role: Role::Mediator,
            asset: manager.asset(),
            hashlock,
            initiator,
            target,
            amount: lock.amount,
            secret: None,
            payer: Some(sender),
            payee: None,
            incoming: Some(lock),
            outgoing: None,
            status: TransferStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
        };

        if target == self.address {
            record.role = Role::Target;
            self.transfers.insert(hashlock, record);
            tracing::debug!(hashlock = %hashlock, initiator = %initiator, "requesting secret");
            self.send(
                initiator,
                Message::SecretRequest {
                    hashlock,
                    amount: lock.amount,
                },
            )
            .await;
            return Ok(());
        }

        let route = Path::new(path.to_vec()).ok();
        let payee = route
            .as_ref()
            .filter(|r| r.previous_before(&self.address) == Some(sender))
            .and_then(|r| r.next_after(&self.address));
        let Some(payee) = payee else {
            self.refuse(&manager, sender, hashlock, (sender, self.address), FailureReason::InvalidRoute)
                .await;
            return Ok(());
        };
        let edge = (self.address, payee);

        if lock.expiration < now + self.config.min_forward_margin() {
            self.refuse(&manager, sender, hashlock, edge, FailureReason::InsufficientTimeMargin)
                .await;
            return Ok(());
        }
        let Ok(out_handle) = manager.channels().channel_with(&payee) else {
            self.refuse(&manager, sender, hashlock, edge, FailureReason::NoChannel)
                .await;
            return Ok(());
        };

        let outgoing = Lock::new(lock.amount, hashlock, lock.expiration - self.config.reveal_timeout);
        let mut out = out_handle.lock().await;
        match out.create_mediated_transfer(&self.keypair, outgoing, now) {
            Ok(balance_proof) => {
                manager.refresh_capacity(&out);
                record.payee = Some(payee);
                record.outgoing = Some(outgoing);
                self.transfers.insert(hashlock, record);
                tracing::debug!(hashlock = %hashlock, from = %sender, to = %payee, "forwarding transfer");
                self.send(
                    payee,
                    Message::MediatedTransfer {
                        initiator,
                        target,
                        path: path.to_vec(),
                        lock: outgoing,
                        balance_proof,
                    },
                )
                .await;
            }
            Err(e) => {
                drop(out);
                tracing::debug!(error = %e, payee = %payee, "cannot forward transfer");
                self.refuse(&manager, sender, hashlock, edge, FailureReason::InsufficientCapacity)
                    .await;
            }
        }
        Ok(())
    }

    /// Decline an incoming lock and tell the payer which edge failed.
    async fn refuse(
        &self,
        manager: &AssetManager,
        payer: Address,
        hashlock: SecretHash,
        failed_edge: (Address, Address),
        reason: FailureReason,
    ) {
        if let Ok(handle) = manager.channels().channel_with(&payer) {
            handle.lock().await.decline_lock(hashlock);
        }
        tracing::info!(hashlock = %hashlock, payer = %payer, %reason, "transfer refused");
        self.send(
            payer,
            Message::TransferFailed {
                hashlock,
                failed_edge,
                reason,
            },
        )
        .await;
    }

    async fn on_secret_request(
        &self,
        sender: Address,
        hashlock: &SecretHash,
        amount: TokenAmount,
    ) -> Result<(), NodeError> {
        let record = self
            .transfers
            .get(hashlock)
            .map(|r| r.clone())
            .ok_or(NodeError::UnknownTransfer(*hashlock))?;
        if record.role != Role::Initiator || record.target != sender || record.amount != amount {
            return Err(NodeError::UnexpectedMessage(format!(
                "secret request from {} for {}",
                sender, hashlock
            )));
        }
        let Some(secret) = record.secret else {
            return Err(NodeError::UnexpectedMessage("initiator lost its secret".into()));
        };
        if !OPEN.contains(&record.status) {
            return Ok(());
        }
        if self
            .transition(hashlock, &[TransferStatus::Pending], TransferStatus::SecretRevealed)
            .is_some()
            || record.status == TransferStatus::SecretRevealed
        {
            self.send(sender, Message::RevealSecret { secret }).await;
        }
        Ok(())
    }

    async fn on_reveal_secret(&self, sender: Address, secret: &Secret) -> Result<(), NodeError> {
        let hashlock = secret.hashlock();
        let record = self
            .transfers
            .get(&hashlock)
            .map(|r| r.clone())
            .ok_or(NodeError::UnknownTransfer(hashlock))?;

        match record.role {
            Role::Initiator if record.payee == Some(sender) => {
                if self.transition(&hashlock, OPEN, TransferStatus::Completed).is_some() {
                    self.unlock_payee(&record, secret).await;
                    self.notify_initiator(&hashlock, InitiatorEvent::Unlocked);
                }
            }
            Role::Mediator if record.payee == Some(sender) => {
                let expired = record
                    .outgoing
                    .is_some_and(|lock| lock.is_expired_at(self.clock.now()));
                if expired {
                    // the outgoing lock lapses and nothing travels upstream
                    if self
                        .transition(&hashlock, &[TransferStatus::Pending], TransferStatus::Expired)
                        .is_some()
                    {
                        tracing::warn!(hashlock = %hashlock, "secret arrived after outgoing lock expired");
                    }
                } else if self
                    .transition(&hashlock, &[TransferStatus::Pending], TransferStatus::SecretRevealed)
                    .is_some()
                {
                    self.record_secret(&hashlock, secret);
                    self.unlock_payee(&record, secret).await;
                    self.reveal_to_payer(&record, secret).await;
                }
            }
            Role::Target if record.initiator == sender => {
                if self
                    .transition(&hashlock, &[TransferStatus::Pending], TransferStatus::SecretRevealed)
                    .is_some()
                {
                    self.record_secret(&hashlock, secret);
                    self.reveal_to_payer(&record, secret).await;
                }
            }
            _ => {
                tracing::debug!(hashlock = %hashlock, from = %sender, "ignoring secret reveal");
            }
        }
        Ok(())
    }

    fn record_secret(&self, hashlock: &SecretHash, secret: &Secret) {
        if let Some(mut record) = self.transfers.get_mut(hashlock) {
            record.secret = Some(*secret);
        }
    }

    /// Pay the payee's lock off-chain.
    async fn unlock_payee(&self, record: &TransferRecord, secret: &Secret) {
        let Some(payee) = record.payee else { return };
        let Ok(manager) = self.asset_manager(&record.asset) else { return };
        let Ok(handle) = manager.channels().channel_with(&payee) else {
            tracing::warn!(hashlock = %record.hashlock, payee = %payee, "no channel to unlock");
            return;
        };
        let mut channel = handle.lock().await;
        match channel.create_unlock(&self.keypair, secret) {
            Ok(balance_proof) => {
                manager.refresh_capacity(&channel);
                self.send(
                    payee,
                    Message::Unlock {
                        secret: *secret,
                        balance_proof,
                    },
                )
                .await;
            }
            Err(e) => tracing::warn!(error = %e, hashlock = %record.hashlock, "unlock failed"),
        }
    }

    /// Register the secret on the payer's channel and pass it upstream.
    async fn reveal_to_payer(&self, record: &TransferRecord, secret: &Secret) {
        let Some(payer) = record.payer else { return };
        if let Ok(manager) = self.asset_manager(&record.asset) {
            if let Ok(handle) = manager.channels().channel_with(&payer) {
                handle.lock().await.register_secret(secret);
            }
        }
        self.send(payer, Message::RevealSecret { secret: *secret }).await;
    }

    async fn on_unlock(
        &self,
        sender: Address,
        secret: &Secret,
        proof: &BalanceProof,
    ) -> Result<(), NodeError> {
        let (manager, handle) = self.channel_for(&proof.channel)?;
        let lock = {
            let mut channel = handle.lock().await;
            let lock = channel.register_unlock(&sender, secret, proof.clone())?;
            manager.refresh_capacity(&channel);
            lock
        };
        let is_payer = self
            .transfers
            .get(&lock.hashlock)
            .is_some_and(|r| r.payer == Some(sender));
        if is_payer {
            if let Some(before) = self.transition(&lock.hashlock, OPEN, TransferStatus::Completed) {
                if before.role == Role::Target {
                    tracing::info!(
                        node = %self.address,
                        initiator = %before.initiator,
                        amount = lock.amount,
                        "mediated transfer received"
                    );
                }
            }
        }
        Ok(())
    }

    async fn on_remove_lock(
        &self,
        sender: Address,
        hashlock: &SecretHash,
        proof: &BalanceProof,
    ) -> Result<(), NodeError> {
        let (manager, handle) = self.channel_for(&proof.channel)?;
        let now = self.clock.now();
        {
            let mut channel = handle.lock().await;
            channel.register_remove_lock(&sender, hashlock, proof.clone(), now)?;
            manager.refresh_capacity(&channel);
        }
        let is_payer = self
            .transfers
            .get(hashlock)
            .is_some_and(|r| r.payer == Some(sender));
        if is_payer {
            self.transition(hashlock, OPEN, TransferStatus::Failed);
        }
        Ok(())
    }

    async fn on_transfer_failed(
        &self,
        sender: Address,
        hashlock: &SecretHash,
        failed_edge: (Address, Address),
        reason: FailureReason,
    ) -> Result<(), NodeError> {
        let record = self
            .transfers
            .get(hashlock)
            .map(|r| r.clone())
            .ok_or(NodeError::UnknownTransfer(*hashlock))?;
        if record.payee != Some(sender) {
            return Err(NodeError::UnexpectedMessage(format!(
                "transfer failure for {} from non-payee {}",
                hashlock, sender
            )));
        }
        if self
            .transition(hashlock, &[TransferStatus::Pending], TransferStatus::Failed)
            .is_none()
        {
            return Ok(());
        }

        let manager = self.asset_manager(&record.asset)?;
        if let Ok(handle) = manager.channels().channel_with(&sender) {
            let mut channel = handle.lock().await;
            match channel.create_remove_lock(&self.keypair, hashlock) {
                Ok(balance_proof) => {
                    manager.refresh_capacity(&channel);
                    self.send(
                        sender,
                        Message::RemoveLock {
                            hashlock: *hashlock,
                            balance_proof,
                        },
                    )
                    .await;
                }
                Err(e) => tracing::warn!(error = %e, hashlock = %hashlock, "lock removal failed"),
            }
        }

        match (record.role, record.payer) {
            (Role::Initiator, _) => {
                self.notify_initiator(hashlock, InitiatorEvent::Failed { edge: failed_edge, reason });
            }
            (Role::Mediator, Some(payer)) => {
                if let Ok(handle) = manager.channels().channel_with(&payer) {
                    handle.lock().await.decline_lock(*hashlock);
                }
                self.send(
                    payer,
                    Message::TransferFailed {
                        hashlock: *hashlock,
                        failed_edge,
                        reason,
                    },
                )
                .await;
            }
            _ => {}
        }
        Ok(())
    }

    /// A partner claimed one of our locks on the ledger, so its secret is public.
    pub(crate) async fn on_secret_claimed(&self, claimant: Address, secret: Secret) {
        let hashlock = secret.hashlock();
        let Some(record) = self.transfers.get(&hashlock).map(|r| r.clone()) else {
            return;
        };
        if record.payee != Some(claimant) {
            return;
        }
        match record.role {
            Role::Initiator => {
                if self.transition(&hashlock, OPEN, TransferStatus::Completed).is_some() {
                    tracing::info!(hashlock = %hashlock, "first hop claimed on ledger");
                    self.notify_initiator(&hashlock, InitiatorEvent::Unlocked);
                }
            }
            Role::Mediator => {
                if self
                    .transition(&hashlock, &[TransferStatus::Pending], TransferStatus::SecretRevealed)
                    .is_some()
                {
                    self.record_secret(&hashlock, &secret);
                    self.reveal_to_payer(&record, &secret).await;
                }
            }
            Role::Target => {}
        }
    }

    /// Whether a lock we sent may be removed after expiring. Marks the
    /// transfer expired unless it already completed.
    pub(crate) fn release_expired(&self, hashlock: &SecretHash) -> bool {
        let (before, role) = {
            let Some(mut record) = self.transfers.get_mut(hashlock) else {
                return true;
            };
            let before = record.status;
            match before {
                TransferStatus::Completed => return false,
                TransferStatus::Pending | TransferStatus::SecretRevealed => {
                    record.status = TransferStatus::Expired;
                    record.finished_at = Some(self.clock.now());
                }
                TransferStatus::Failed | TransferStatus::Expired => {}
            }
            (before, record.role)
        };
        if role == Role::Initiator && OPEN.contains(&before) {
            self.notify_initiator(
                hashlock,
                InitiatorEvent::Expired {
                    revealed: before == TransferStatus::SecretRevealed,
                },
            );
        }
        true
    }
}
