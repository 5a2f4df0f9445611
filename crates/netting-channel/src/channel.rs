use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use netting_core::{
    Address, BalanceProof, BlockNumber, BlockTimeout, ChannelEvent, ChannelState,
    ChannelStateMachine, Lock, Locksroot, Nonce, Secret, SecretHash, TokenAmount,
};
use netting_crypto::{Crypto, KeyPair};

use crate::error::ChannelError;
use crate::lock::LockSet;

/// One participant's side of a channel.
#[derive(Debug, Clone)]
pub struct ChannelEnd {
    pub address: Address,
    pub deposit: TokenAmount,
    /// Latest proof signed by this participant.
    pub balance_proof: Option<BalanceProof>,
    /// Locks this participant has pending toward its partner.
    pub locks: LockSet,
    /// Locks sent by this participant that the partner claimed on the ledger.
    pub claimed: BTreeMap<SecretHash, Lock>,
}

impl ChannelEnd {
    fn new(address: Address) -> Self {
        Self {
            address,
            deposit: 0,
            balance_proof: None,
            locks: LockSet::new(),
            claimed: BTreeMap::new(),
        }
    }

    pub fn nonce(&self) -> Nonce {
        self.balance_proof.as_ref().map(|p| p.nonce).unwrap_or(0)
    }

    /// Cumulative amount sent to the partner.
    pub fn transferred(&self) -> TokenAmount {
        self.balance_proof
            .as_ref()
            .map(|p| p.transferred_amount)
            .unwrap_or(0)
    }

    pub fn claimed_amount(&self) -> TokenAmount {
        self.claimed.values().map(|l| l.amount).sum()
    }
}

/// Final distribution of a settled channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payouts {
    pub channel: Address,
    pub entries: [(Address, TokenAmount); 2],
}

impl Payouts {
    pub fn amount_for(&self, participant: &Address) -> TokenAmount {
        self.entries
            .iter()
            .find(|(addr, _)| addr == participant)
            .map(|(_, amount)| *amount)
            .unwrap_or(0)
    }

    pub fn total(&self) -> TokenAmount {
        self.entries.iter().map(|(_, amount)| amount).sum()
    }
}

/// A bilateral payment channel.
///
/// The same type backs the ledger's authoritative record and each node's local
/// view. `participants[0]` is always the creator. Off-chain operations only
/// apply while the channel is open; the ledger operations `close`, `dispute`,
/// `claim_lock` and `settle` drive it through the rest of its lifecycle.
#[derive(Clone)]
pub struct Channel {
    pub address: Address,
    pub asset: Address,
    pub participants: [ChannelEnd; 2],
    pub settle_timeout: BlockTimeout,
    pub state: ChannelState,
    pub opened_at: Option<BlockNumber>,
    pub closed_at: Option<BlockNumber>,
    pub closing_participant: Option<Address>,
    /// Incoming locks this node refused to forward; their sender may remove them early.
    declined: BTreeSet<SecretHash>,
    crypto: Arc<dyn Crypto>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.address)
            .field("asset", &self.asset)
            .field("participants", &self.participants)
            .field("settle_timeout", &self.settle_timeout)
            .field("state", &self.state)
            .field("closed_at", &self.closed_at)
            .field("closing_participant", &self.closing_participant)
            .finish()
    }
}

impl Channel {
    /// Create a channel record in the `Empty` state.
    pub fn new(
        address: Address,
        asset: Address,
        creator: Address,
        partner: Address,
        settle_timeout: BlockTimeout,
        crypto: Arc<dyn Crypto>,
    ) -> Self {
        Self {
            address,
            asset,
            participants: [ChannelEnd::new(creator), ChannelEnd::new(partner)],
            settle_timeout,
            state: ChannelState::Empty,
            opened_at: None,
            closed_at: None,
            closing_participant: None,
            declined: BTreeSet::new(),
            crypto,
        }
    }

    // ---- accessors ----

    pub fn is_participant(&self, address: &Address) -> bool {
        self.participants.iter().any(|end| end.address == *address)
    }

    fn index_of(&self, participant: &Address) -> Result<usize, ChannelError> {
        self.participants
            .iter()
            .position(|end| end.address == *participant)
            .ok_or(ChannelError::NotParticipant(*participant))
    }

    pub fn end(&self, participant: &Address) -> Result<&ChannelEnd, ChannelError> {
        Ok(&self.participants[self.index_of(participant)?])
    }

    /// `(participant's end, partner's end)`.
    pub fn ends(&self, participant: &Address) -> Result<(&ChannelEnd, &ChannelEnd), ChannelError> {
        let i = self.index_of(participant)?;
        Ok((&self.participants[i], &self.participants[1 - i]))
    }

    fn ends_mut(
        &mut self,
        participant: &Address,
    ) -> Result<(&mut ChannelEnd, &mut ChannelEnd), ChannelError> {
        let i = self.index_of(participant)?;
        let (first, second) = self.participants.split_at_mut(1);
        if i == 0 {
            Ok((&mut first[0], &mut second[0]))
        } else {
            Ok((&mut second[0], &mut first[0]))
        }
    }

    pub fn partner_of(&self, participant: &Address) -> Result<Address, ChannelError> {
        Ok(self.ends(participant)?.1.address)
    }

    /// Amount `participant` can still send: deposit + received − sent − locked.
    pub fn distributable(&self, participant: &Address) -> Result<TokenAmount, ChannelError> {
        let (me, partner) = self.ends(participant)?;
        Ok((me.deposit + partner.transferred())
            .saturating_sub(me.transferred() + me.locks.total_locked()))
    }

    /// Off-chain balance ignoring pending locks: deposit + received − sent.
    pub fn balance(&self, participant: &Address) -> Result<TokenAmount, ChannelError> {
        let (me, partner) = self.ends(participant)?;
        Ok((me.deposit + partner.transferred()).saturating_sub(me.transferred()))
    }

    pub fn total_deposit(&self) -> TokenAmount {
        self.participants.iter().map(|end| end.deposit).sum()
    }

    /// First block at which the channel may be settled.
    pub fn settle_block(&self) -> Option<BlockNumber> {
        self.closed_at.map(|closed| closed + self.settle_timeout)
    }

    /// Secret for a hashlock pending in either direction, if known.
    pub fn known_secret(&self, hashlock: &SecretHash) -> Option<Secret> {
        self.participants
            .iter()
            .filter_map(|end| end.locks.get(hashlock))
            .find_map(|pending| pending.secret)
    }

    /// Evidence `closer` posts when closing: the partner's latest proof and its locks.
    pub fn closing_evidence(
        &self,
        closer: &Address,
    ) -> Result<(Option<BalanceProof>, Vec<Lock>), ChannelError> {
        let (_, partner) = self.ends(closer)?;
        Ok((partner.balance_proof.clone(), partner.locks.locks()))
    }

    /// Secrets `claimant` knows for locks its partner sent it.
    pub fn claimable_secrets(&self, claimant: &Address) -> Result<Vec<Secret>, ChannelError> {
        let (_, partner) = self.ends(claimant)?;
        Ok(partner
            .locks
            .iter()
            .filter(|pending| !partner.claimed.contains_key(&pending.lock.hashlock))
            .filter_map(|pending| pending.secret)
            .collect())
    }

    /// Locks sent by `sender` that can no longer be claimed at `now`.
    pub fn expired_locks(&self, sender: &Address, now: BlockNumber) -> Result<Vec<Lock>, ChannelError> {
        Ok(self.end(sender)?.locks.expired(now))
    }

    /// Locks received by `receiver` whose secret is known but which are within
    /// `margin` blocks of expiring without an off-chain unlock.
    pub fn unlocks_at_risk(
        &self,
        receiver: &Address,
        now: BlockNumber,
        margin: BlockTimeout,
    ) -> Result<Vec<Lock>, ChannelError> {
        let (_, partner) = self.ends(receiver)?;
        Ok(partner
            .locks
            .iter()
            .filter(|pending| pending.secret.is_some())
            .filter(|pending| now + margin >= pending.lock.expiration)
            .filter(|pending| !pending.lock.is_expired_at(now))
            .map(|pending| pending.lock)
            .collect())
    }

    fn require_state(&self, expected: ChannelState) -> Result<(), ChannelError> {
        if self.state != expected {
            return Err(ChannelError::InvalidState {
                channel: self.address,
                state: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, event: ChannelEvent) -> Result<(), ChannelError> {
        self.state = ChannelStateMachine::transition(self.state, event)?;
        Ok(())
    }

    // ---- off-chain: sender side ----

    fn sign_next(
        &mut self,
        keypair: &KeyPair,
        transferred_amount: TokenAmount,
        locksroot: Locksroot,
    ) -> Result<BalanceProof, ChannelError> {
        let sender = keypair.address();
        let nonce = self.end(&sender)?.nonce() + 1;
        let mut proof = BalanceProof::new(self.address, nonce, transferred_amount, locksroot);
        proof.signature = self.crypto.sign(keypair, &proof.signing_payload());
        let (me, _) = self.ends_mut(&sender)?;
        me.balance_proof = Some(proof.clone());
        Ok(proof)
    }

    /// Sign a proof that pays `amount` directly to the partner.
    pub fn create_direct_transfer(
        &mut self,
        keypair: &KeyPair,
        amount: TokenAmount,
    ) -> Result<BalanceProof, ChannelError> {
        self.require_state(ChannelState::Open)?;
        if amount == 0 {
            return Err(ChannelError::InvalidAmount("transfer amount must be positive".into()));
        }
        let sender = keypair.address();
        let available = self.distributable(&sender)?;
        if amount > available {
            return Err(ChannelError::InsufficientCapacity {
                available,
                required: amount,
            });
        }

        let me = self.end(&sender)?;
        let transferred = me.transferred() + amount;
        let locksroot = me.locks.locksroot();
        let proof = self.sign_next(keypair, transferred, locksroot)?;
        tracing::debug!(channel = %self.address, nonce = proof.nonce, amount, "direct transfer created");
        Ok(proof)
    }

    /// Reserve `lock.amount` and sign a proof committing to the new lock.
    pub fn create_mediated_transfer(
        &mut self,
        keypair: &KeyPair,
        lock: Lock,
        now: BlockNumber,
    ) -> Result<BalanceProof, ChannelError> {
        self.require_state(ChannelState::Open)?;
        if lock.amount == 0 {
            return Err(ChannelError::InvalidAmount("lock amount must be positive".into()));
        }
        if lock.is_expired_at(now) {
            return Err(ChannelError::LockExpired(lock.hashlock));
        }
        let sender = keypair.address();
        let available = self.distributable(&sender)?;
        if lock.amount > available {
            return Err(ChannelError::InsufficientCapacity {
                available,
                required: lock.amount,
            });
        }

        let me = self.end(&sender)?;
        if me.locks.contains(&lock.hashlock) {
            return Err(ChannelError::DuplicateLock(lock.hashlock));
        }
        let transferred = me.transferred();
        let locksroot = me.locks.locksroot_with(&lock);
        let proof = self.sign_next(keypair, transferred, locksroot)?;
        self.ends_mut(&sender)?.0.locks.insert(lock)?;
        tracing::debug!(
            channel = %self.address,
            hashlock = %lock.hashlock,
            nonce = proof.nonce,
            amount = lock.amount,
            expiration = lock.expiration,
            "lock created"
        );
        Ok(proof)
    }

    /// Settle a pending lock off-chain: remove it and add its amount to the transferred total.
    pub fn create_unlock(
        &mut self,
        keypair: &KeyPair,
        secret: &Secret,
    ) -> Result<BalanceProof, ChannelError> {
        self.require_state(ChannelState::Open)?;
        let sender = keypair.address();
        let hashlock = secret.hashlock();
        let me = self.end(&sender)?;
        let lock = me
            .locks
            .get(&hashlock)
            .map(|p| p.lock)
            .ok_or(ChannelError::UnknownLock(hashlock))?;
        let transferred = me.transferred() + lock.amount;
        let locksroot = me.locks.locksroot_without(&hashlock);
        let proof = self.sign_next(keypair, transferred, locksroot)?;
        self.ends_mut(&sender)?.0.locks.remove(&hashlock);
        tracing::debug!(channel = %self.address, hashlock = %hashlock, nonce = proof.nonce, "lock unlocked");
        Ok(proof)
    }

    /// Drop a pending lock without paying it.
    pub fn create_remove_lock(
        &mut self,
        keypair: &KeyPair,
        hashlock: &SecretHash,
    ) -> Result<BalanceProof, ChannelError> {
        self.require_state(ChannelState::Open)?;
        let sender = keypair.address();
        let me = self.end(&sender)?;
        if !me.locks.contains(hashlock) {
            return Err(ChannelError::UnknownLock(*hashlock));
        }
        let transferred = me.transferred();
        let locksroot = me.locks.locksroot_without(hashlock);
        let proof = self.sign_next(keypair, transferred, locksroot)?;
        self.ends_mut(&sender)?.0.locks.remove(hashlock);
        tracing::debug!(channel = %self.address, hashlock = %hashlock, nonce = proof.nonce, "lock removed");
        Ok(proof)
    }

    // ---- off-chain: receiver side ----

    /// Acceptance rule shared by every incoming proof.
    fn check_incoming(&self, sender: &Address, proof: &BalanceProof) -> Result<(), ChannelError> {
        self.require_state(ChannelState::Open)?;
        let end = self.end(sender)?;
        if proof.channel != self.address {
            return Err(ChannelError::InvalidBalanceProof(format!(
                "proof is for channel {}",
                proof.channel
            )));
        }
        if let Some(stored) = &end.balance_proof {
            if stored.digest() == proof.digest() {
                return Err(ChannelError::Duplicate(proof.nonce));
            }
        }
        if !self
            .crypto
            .verify(sender, &proof.signing_payload(), &proof.signature)
        {
            return Err(ChannelError::InvalidBalanceProof(
                "signature does not match sender".into(),
            ));
        }
        let expected = end.nonce() + 1;
        if proof.nonce > expected {
            return Err(ChannelError::NonceGap {
                expected,
                received: proof.nonce,
            });
        }
        if proof.nonce < expected {
            return Err(ChannelError::StaleOrInvalidProof {
                received: proof.nonce,
                stored: end.nonce(),
            });
        }
        Ok(())
    }

    fn store_proof(&mut self, sender: &Address, proof: BalanceProof) -> Result<(), ChannelError> {
        self.ends_mut(sender)?.0.balance_proof = Some(proof);
        Ok(())
    }

    /// Apply a direct transfer from `sender`. Returns the amount received.
    pub fn register_direct_transfer(
        &mut self,
        sender: &Address,
        proof: BalanceProof,
    ) -> Result<TokenAmount, ChannelError> {
        self.check_incoming(sender, &proof)?;
        let end = self.end(sender)?;
        if proof.transferred_amount <= end.transferred() {
            return Err(ChannelError::InvalidBalanceProof(
                "direct transfer must increase the transferred amount".into(),
            ));
        }
        let amount = proof.transferred_amount - end.transferred();
        if proof.locksroot != end.locks.locksroot() {
            return Err(ChannelError::InvalidBalanceProof(
                "direct transfer must not change the locksroot".into(),
            ));
        }
        let available = self.distributable(sender)?;
        if amount > available {
            return Err(ChannelError::InvalidBalanceProof(format!(
                "transfer of {} exceeds sender capacity {}",
                amount, available
            )));
        }
        self.store_proof(sender, proof)?;
        tracing::debug!(channel = %self.address, amount, "direct transfer received");
        Ok(amount)
    }

    /// Apply a new lock from `sender`.
    pub fn register_mediated_transfer(
        &mut self,
        sender: &Address,
        lock: Lock,
        proof: BalanceProof,
        now: BlockNumber,
    ) -> Result<(), ChannelError> {
        self.check_incoming(sender, &proof)?;
        if lock.amount == 0 {
            return Err(ChannelError::InvalidBalanceProof("lock amount is zero".into()));
        }
        if lock.is_expired_at(now) {
            return Err(ChannelError::LockExpired(lock.hashlock));
        }
        let end = self.end(sender)?;
        if end.locks.contains(&lock.hashlock) {
            return Err(ChannelError::DuplicateLock(lock.hashlock));
        }
        if proof.transferred_amount != end.transferred() {
            return Err(ChannelError::InvalidBalanceProof(
                "locked transfer must not change the transferred amount".into(),
            ));
        }
        if proof.locksroot != end.locks.locksroot_with(&lock) {
            return Err(ChannelError::InvalidBalanceProof(
                "locksroot does not include the new lock".into(),
            ));
        }
        let available = self.distributable(sender)?;
        if lock.amount > available {
            return Err(ChannelError::InvalidBalanceProof(format!(
                "lock of {} exceeds sender capacity {}",
                lock.amount, available
            )));
        }
        let (end, _) = self.ends_mut(sender)?;
        end.locks.insert(lock)?;
        end.balance_proof = Some(proof);
        tracing::debug!(channel = %self.address, hashlock = %lock.hashlock, amount = lock.amount, "lock received");
        Ok(())
    }

    /// Apply an unlock from `sender`. Returns the unlocked lock.
    pub fn register_unlock(
        &mut self,
        sender: &Address,
        secret: &Secret,
        proof: BalanceProof,
    ) -> Result<Lock, ChannelError> {
        self.check_incoming(sender, &proof)?;
        let hashlock = secret.hashlock();
        let end = self.end(sender)?;
        let lock = end
            .locks
            .get(&hashlock)
            .map(|p| p.lock)
            .ok_or(ChannelError::UnknownLock(hashlock))?;
        if proof.transferred_amount != end.transferred() + lock.amount {
            return Err(ChannelError::InvalidBalanceProof(
                "unlock must add exactly the lock amount".into(),
            ));
        }
        if proof.locksroot != end.locks.locksroot_without(&hashlock) {
            return Err(ChannelError::InvalidBalanceProof(
                "locksroot still contains the unlocked lock".into(),
            ));
        }
        let (end, _) = self.ends_mut(sender)?;
        end.locks.remove(&hashlock);
        end.balance_proof = Some(proof);
        tracing::debug!(channel = %self.address, hashlock = %hashlock, amount = lock.amount, "unlock received");
        Ok(lock)
    }

    /// Apply a lock removal from `sender`.
    ///
    /// Accepted only when the lock has expired or this node declined to forward it.
    pub fn register_remove_lock(
        &mut self,
        sender: &Address,
        hashlock: &SecretHash,
        proof: BalanceProof,
        now: BlockNumber,
    ) -> Result<Lock, ChannelError> {
        self.check_incoming(sender, &proof)?;
        let end = self.end(sender)?;
        let lock = end
            .locks
            .get(hashlock)
            .map(|p| p.lock)
            .ok_or(ChannelError::UnknownLock(*hashlock))?;
        if !lock.is_expired_at(now) && !self.declined.contains(hashlock) {
            return Err(ChannelError::InvalidBalanceProof(
                "lock is still claimable".into(),
            ));
        }
        if proof.transferred_amount != end.transferred() {
            return Err(ChannelError::InvalidBalanceProof(
                "lock removal must not change the transferred amount".into(),
            ));
        }
        if proof.locksroot != end.locks.locksroot_without(hashlock) {
            return Err(ChannelError::InvalidBalanceProof(
                "locksroot still contains the removed lock".into(),
            ));
        }
        let (end, _) = self.ends_mut(sender)?;
        end.locks.remove(hashlock);
        end.balance_proof = Some(proof);
        self.declined.remove(hashlock);
        tracing::debug!(channel = %self.address, hashlock = %hashlock, "lock removal received");
        Ok(lock)
    }

    /// Mark an incoming lock as refused, allowing its sender to remove it.
    pub fn decline_lock(&mut self, hashlock: SecretHash) {
        self.declined.insert(hashlock);
    }

    /// Record a revealed secret against matching locks in both directions.
    pub fn register_secret(&mut self, secret: &Secret) -> bool {
        let mut found = false;
        for end in self.participants.iter_mut() {
            found |= end.locks.register_secret(secret);
        }
        found
    }

    // ---- ledger operations ----

    pub fn open(&mut self, now: BlockNumber) -> Result<(), ChannelError> {
        self.transition(ChannelEvent::Opened)?;
        self.opened_at = Some(now);
        Ok(())
    }

    /// Add to `participant`'s deposit. Returns the new total.
    pub fn deposit(
        &mut self,
        participant: &Address,
        amount: TokenAmount,
    ) -> Result<TokenAmount, ChannelError> {
        self.require_state(ChannelState::Open)?;
        if amount == 0 {
            return Err(ChannelError::InvalidAmount("deposit must be positive".into()));
        }
        let (end, _) = self.ends_mut(participant)?;
        end.deposit += amount;
        Ok(end.deposit)
    }

    /// Mirror a deposit total reported by the ledger.
    pub fn set_deposit(
        &mut self,
        participant: &Address,
        total: TokenAmount,
    ) -> Result<(), ChannelError> {
        let (end, _) = self.ends_mut(participant)?;
        end.deposit = end.deposit.max(total);
        Ok(())
    }

    /// Check a proof posted on the ledger, signed by `signer`, with its locks.
    fn check_posted(
        &self,
        signer: &Address,
        proof: &BalanceProof,
        locks: &[Lock],
    ) -> Result<(), ChannelError> {
        if proof.channel != self.address {
            return Err(ChannelError::InvalidBalanceProof(format!(
                "proof is for channel {}",
                proof.channel
            )));
        }
        if !self
            .crypto
            .verify(signer, &proof.signing_payload(), &proof.signature)
        {
            return Err(ChannelError::InvalidBalanceProof(
                "proof is not signed by the counterparty".into(),
            ));
        }
        if netting_crypto::locksroot(locks.iter()) != proof.locksroot {
            return Err(ChannelError::InvalidBalanceProof(
                "locks do not match the locksroot".into(),
            ));
        }
        Ok(())
    }

    fn apply_posted(
        &mut self,
        signer: &Address,
        proof: BalanceProof,
        locks: Vec<Lock>,
    ) -> Result<(), ChannelError> {
        let mut lockset = LockSet::from_locks(locks)?;
        let (end, _) = self.ends_mut(signer)?;
        for pending in end.locks.iter() {
            if let Some(secret) = pending.secret {
                lockset.register_secret(&secret);
            }
        }
        end.locks = lockset;
        end.balance_proof = Some(proof);
        Ok(())
    }

    /// Close the channel with the partner's latest proof.
    pub fn close(
        &mut self,
        closer: &Address,
        partner_proof: Option<BalanceProof>,
        locks: Vec<Lock>,
        now: BlockNumber,
    ) -> Result<(), ChannelError> {
        self.require_state(ChannelState::Open)?;
        let partner = self.partner_of(closer)?;
        match partner_proof {
            Some(proof) => {
                self.check_posted(&partner, &proof, &locks)?;
                let stored = self.end(&partner)?.nonce();
                if proof.nonce < stored {
                    return Err(ChannelError::StaleOrInvalidProof {
                        received: proof.nonce,
                        stored,
                    });
                }
                self.apply_posted(&partner, proof, locks)?;
            }
            None if !locks.is_empty() => {
                return Err(ChannelError::InvalidBalanceProof(
                    "locks posted without a balance proof".into(),
                ));
            }
            None => {}
        }
        self.transition(ChannelEvent::Closed)?;
        self.closed_at = Some(now);
        self.closing_participant = Some(*closer);
        tracing::info!(channel = %self.address, closer = %closer, block = now, "channel closed");
        Ok(())
    }

    /// Non-closing participant submits the closer's newer proof during the settle window.
    pub fn dispute(
        &mut self,
        submitter: &Address,
        proof: BalanceProof,
        locks: Vec<Lock>,
        now: BlockNumber,
    ) -> Result<(), ChannelError> {
        self.require_state(ChannelState::Closed)?;
        self.require_window_open(now)?;
        let closer = self
            .closing_participant
            .ok_or_else(|| ChannelError::InvariantViolation("closed channel without closer".into()))?;
        if !self.is_participant(submitter) {
            return Err(ChannelError::NotParticipant(*submitter));
        }
        if *submitter == closer {
            return Err(ChannelError::Unauthorized(
                "only the non-closing participant may update the closer's proof".into(),
            ));
        }
        self.check_posted(&closer, &proof, &locks)?;
        let stored = self.end(&closer)?.nonce();
        if proof.nonce <= stored {
            return Err(ChannelError::StaleOrInvalidProof {
                received: proof.nonce,
                stored,
            });
        }
        let nonce = proof.nonce;
        self.apply_posted(&closer, proof, locks)?;
        tracing::info!(channel = %self.address, submitter = %submitter, nonce, "closing proof updated");
        Ok(())
    }

    /// Claim a lock the partner sent, by revealing its secret on the ledger.
    pub fn claim_lock(
        &mut self,
        claimant: &Address,
        secret: &Secret,
        now: BlockNumber,
    ) -> Result<Lock, ChannelError> {
        self.require_state(ChannelState::Closed)?;
        self.require_window_open(now)?;
        let hashlock = secret.hashlock();
        let (_, sender) = self.ends_mut(claimant)?;
        if sender.claimed.contains_key(&hashlock) {
            return Err(ChannelError::LockAlreadyClaimed(hashlock));
        }
        let lock = sender
            .locks
            .get(&hashlock)
            .map(|p| p.lock)
            .ok_or(ChannelError::UnknownLock(hashlock))?;
        if lock.is_expired_at(now) {
            return Err(ChannelError::LockExpired(hashlock));
        }
        sender.locks.register_secret(secret);
        sender.claimed.insert(hashlock, lock);
        tracing::info!(channel = %self.address, claimant = %claimant, hashlock = %hashlock, "lock claimed on ledger");
        Ok(lock)
    }

    fn require_window_open(&self, now: BlockNumber) -> Result<(), ChannelError> {
        let settle_block = self
            .settle_block()
            .ok_or_else(|| ChannelError::InvariantViolation("closed channel without close block".into()))?;
        if now >= settle_block {
            return Err(ChannelError::SettleWindowElapsed { settle_block, now });
        }
        Ok(())
    }

    /// Distribute the deposits once the settle window has elapsed.
    pub fn settle(&mut self, now: BlockNumber) -> Result<Payouts, ChannelError> {
        self.require_state(ChannelState::Closed)?;
        let settle_block = self
            .settle_block()
            .ok_or_else(|| ChannelError::InvariantViolation("closed channel without close block".into()))?;
        if now < settle_block {
            return Err(ChannelError::SettleTooEarly { settle_block, now });
        }

        let payouts = self.compute_payouts();
        self.transition(ChannelEvent::Settled)?;
        tracing::info!(
            channel = %self.address,
            payout0 = payouts.entries[0].1,
            payout1 = payouts.entries[1].1,
            "channel settled"
        );
        Ok(payouts)
    }

    fn compute_payouts(&self) -> Payouts {
        let [a, b] = &self.participants;
        let total = a.deposit + b.deposit;
        let credit = a.deposit + b.transferred() + b.claimed_amount();
        let debit = a.transferred() + a.claimed_amount();
        let unclamped = credit.saturating_sub(debit);
        if credit < debit || unclamped > total {
            tracing::error!(channel = %self.address, credit, debit, total, "payout clamped to deposits");
        }
        let payout_a = unclamped.min(total);
        Payouts {
            channel: self.address,
            entries: [(a.address, payout_a), (b.address, total - payout_a)],
        }
    }

    // ---- ledger mirror ----

    pub fn on_closed(&mut self, closer: &Address, block: BlockNumber) -> Result<(), ChannelError> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        if !self.is_participant(closer) {
            return Err(ChannelError::NotParticipant(*closer));
        }
        self.transition(ChannelEvent::Closed)?;
        self.closed_at = Some(block);
        self.closing_participant = Some(*closer);
        Ok(())
    }

    pub fn on_settled(&mut self) -> Result<(), ChannelError> {
        if self.state == ChannelState::Settled {
            return Ok(());
        }
        self.transition(ChannelEvent::Settled)
    }
}
