use std::collections::BTreeMap;

use netting_core::{BlockNumber, Lock, Locksroot, Secret, SecretHash, TokenAmount};

use crate::error::ChannelError;

/// A lock committed in a participant's locksroot, with the secret once known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLock {
    pub lock: Lock,
    pub secret: Option<Secret>,
}

/// The set of locks one participant has pending toward its partner.
///
/// Keyed by hashlock: a participant never has two pending locks with the same
/// hashlock in one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
    locks: BTreeMap<SecretHash, PendingLock>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from locks posted on the ledger.
    pub fn from_locks<I>(locks: I) -> Result<Self, ChannelError>
    where
        I: IntoIterator<Item = Lock>,
    {
        let mut set = Self::new();
        for lock in locks {
            set.insert(lock)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, lock: Lock) -> Result<(), ChannelError> {
        if self.locks.contains_key(&lock.hashlock) {
            return Err(ChannelError::DuplicateLock(lock.hashlock));
        }
        self.locks.insert(lock.hashlock, PendingLock { lock, secret: None });
        Ok(())
    }

    pub fn remove(&mut self, hashlock: &SecretHash) -> Option<PendingLock> {
        self.locks.remove(hashlock)
    }

    pub fn get(&self, hashlock: &SecretHash) -> Option<&PendingLock> {
        self.locks.get(hashlock)
    }

    pub fn contains(&self, hashlock: &SecretHash) -> bool {
        self.locks.contains_key(hashlock)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingLock> {
        self.locks.values()
    }

    /// Sum of all pending lock amounts.
    pub fn total_locked(&self) -> TokenAmount {
        self.locks.values().map(|p| p.lock.amount).sum()
    }

    /// Pending locks, in hashlock order.
    pub fn locks(&self) -> Vec<Lock> {
        self.locks.values().map(|p| p.lock).collect()
    }

    pub fn locksroot(&self) -> Locksroot {
        netting_crypto::locksroot(self.locks.values().map(|p| &p.lock))
    }

    /// Root the set would have after adding `lock`.
    pub fn locksroot_with(&self, lock: &Lock) -> Locksroot {
        netting_crypto::locksroot(self.locks.values().map(|p| &p.lock).chain(std::iter::once(lock)))
    }

    /// Root the set would have after removing `hashlock`.
    pub fn locksroot_without(&self, hashlock: &SecretHash) -> Locksroot {
        netting_crypto::locksroot(
            self.locks
                .values()
                .filter(|p| p.lock.hashlock != *hashlock)
                .map(|p| &p.lock),
        )
    }

    /// Record a revealed secret. Returns whether a matching lock exists.
    pub fn register_secret(&mut self, secret: &Secret) -> bool {
        match self.locks.get_mut(&secret.hashlock()) {
            Some(pending) => {
                pending.secret = Some(*secret);
                true
            }
            None => false,
        }
    }

    /// Locks that can no longer be claimed at `now`.
    pub fn expired(&self, now: BlockNumber) -> Vec<Lock> {
        self.locks
            .values()
            .filter(|p| p.lock.is_expired_at(now))
            .map(|p| p.lock)
            .collect()
    }
}
