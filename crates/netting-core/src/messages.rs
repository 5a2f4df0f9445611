//! Balance proofs, locks, and the logical messages exchanged between nodes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::CoreError;
use crate::types::{Address, BlockNumber, Locksroot, Nonce, Secret, SecretHash, TokenAmount};

/// Serde helper to encode signature bytes as hex.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// A hash time-lock: `amount` is claimable by the receiver only by revealing the
/// preimage of `hashlock` strictly before block `expiration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lock {
    pub amount: TokenAmount,
    pub hashlock: SecretHash,
    pub expiration: BlockNumber,
}

impl Lock {
    pub fn new(amount: TokenAmount, hashlock: SecretHash, expiration: BlockNumber) -> Self {
        Self {
            amount,
            hashlock,
            expiration,
        }
    }

    /// Canonical encoding: amount (16, be) ‖ hashlock (32) ‖ expiration (8, be).
    pub fn encode(&self) -> [u8; 56] {
        let mut out = [0u8; 56];
        out[..16].copy_from_slice(&self.amount.to_be_bytes());
        out[16..48].copy_from_slice(self.hashlock.as_bytes());
        out[48..].copy_from_slice(&self.expiration.to_be_bytes());
        out
    }

    /// Leaf digest of this lock in a locksroot.
    pub fn digest(&self) -> [u8; 32] {
        *blake3::hash(&self.encode()).as_bytes()
    }

    /// A lock can no longer be claimed once the clock reaches its expiration.
    pub fn is_expired_at(&self, now: BlockNumber) -> bool {
        now >= self.expiration
    }
}

/// Signed snapshot of one participant's side of a channel.
///
/// `transferred_amount` is cumulative and never decreases; `locksroot` commits
/// to every lock the signer currently has pending toward its partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceProof {
    pub channel: Address,
    pub nonce: Nonce,
    pub transferred_amount: TokenAmount,
    pub locksroot: Locksroot,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl BalanceProof {
    /// Create an unsigned proof.
    pub fn new(
        channel: Address,
        nonce: Nonce,
        transferred_amount: TokenAmount,
        locksroot: Locksroot,
    ) -> Self {
        Self {
            channel,
            nonce,
            transferred_amount,
            locksroot,
            signature: Vec::new(),
        }
    }

    /// Canonical signing payload:
    /// channel (32) ‖ nonce (8, be) ‖ transferred_amount (16, be) ‖ locksroot (32).
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(88);
        payload.extend_from_slice(self.channel.as_bytes());
        payload.extend_from_slice(&self.nonce.to_be_bytes());
        payload.extend_from_slice(&self.transferred_amount.to_be_bytes());
        payload.extend_from_slice(self.locksroot.as_bytes());
        payload
    }

    /// Digest over payload and signature; identifies an exact replay.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.signing_payload());
        hasher.update(&self.signature);
        *hasher.finalize().as_bytes()
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

/// Why a hop refused to carry a mediated transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The outgoing channel cannot reserve the lock amount.
    InsufficientCapacity,
    /// The remaining lock lifetime is too short to forward safely.
    InsufficientTimeMargin,
    /// The hop has no open channel with the next path element.
    NoChannel,
    /// The message's path does not place the receiver after the sender.
    InvalidRoute,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientCapacity => write!(f, "insufficient capacity"),
            Self::InsufficientTimeMargin => write!(f, "insufficient time margin"),
            Self::NoChannel => write!(f, "no channel"),
            Self::InvalidRoute => write!(f, "invalid route"),
        }
    }
}

/// Logical messages of the transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// Single-hop payment: raises `transferred_amount`, no lock.
    DirectTransfer { balance_proof: BalanceProof },
    /// Adds `lock` to the sender's locksroot. `path` runs initiator → target.
    MediatedTransfer {
        initiator: Address,
        target: Address,
        path: Vec<Address>,
        lock: Lock,
        balance_proof: BalanceProof,
    },
    /// Target → initiator: ready to receive `amount` under `hashlock`.
    SecretRequest {
        hashlock: SecretHash,
        amount: TokenAmount,
    },
    /// Discloses a secret. Flows initiator → target, then hop by hop backwards.
    RevealSecret { secret: Secret },
    /// Removes the lock opened by `secret` and credits its amount.
    Unlock {
        secret: Secret,
        balance_proof: BalanceProof,
    },
    /// Removes a failed or expired lock without paying it.
    RemoveLock {
        hashlock: SecretHash,
        balance_proof: BalanceProof,
    },
    /// Hop-by-hop refusal, travelling back toward the initiator.
    TransferFailed {
        hashlock: SecretHash,
        failed_edge: (Address, Address),
        reason: FailureReason,
    },
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DirectTransfer { .. } => "direct_transfer",
            Self::MediatedTransfer { .. } => "mediated_transfer",
            Self::SecretRequest { .. } => "secret_request",
            Self::RevealSecret { .. } => "reveal_secret",
            Self::Unlock { .. } => "unlock",
            Self::RemoveLock { .. } => "remove_lock",
            Self::TransferFailed { .. } => "transfer_failed",
        }
    }

    /// The balance proof carried by this message, if any.
    pub fn balance_proof(&self) -> Option<&BalanceProof> {
        match self {
            Self::DirectTransfer { balance_proof }
            | Self::MediatedTransfer { balance_proof, .. }
            | Self::Unlock { balance_proof, .. }
            | Self::RemoveLock { balance_proof, .. } => Some(balance_proof),
            _ => None,
        }
    }

    /// The hashlock this message refers to, if any.
    pub fn hashlock(&self) -> Option<SecretHash> {
        match self {
            Self::MediatedTransfer { lock, .. } => Some(lock.hashlock),
            Self::SecretRequest { hashlock, .. }
            | Self::RemoveLock { hashlock, .. }
            | Self::TransferFailed { hashlock, .. } => Some(*hashlock),
            Self::RevealSecret { secret } | Self::Unlock { secret, .. } => Some(secret.hashlock()),
            Self::DirectTransfer { .. } => None,
        }
    }

    /// Structural checks that need no channel state.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(proof) = self.balance_proof() {
            if !proof.is_signed() {
                return Err(CoreError::MissingField("balance_proof.signature".into()));
            }
            if proof.nonce == 0 {
                return Err(CoreError::ValidationError(
                    "balance proof nonce must be greater than zero".into(),
                ));
            }
        }

        match self {
            Self::MediatedTransfer {
                initiator,
                target,
                path,
                lock,
                ..
            } => {
                if lock.amount == 0 {
                    return Err(CoreError::InvalidAmount(
                        "lock amount must be greater than zero".into(),
                    ));
                }
                if initiator == target {
                    return Err(CoreError::ValidationError(
                        "initiator and target must be different".into(),
                    ));
                }
                if path.len() < 2 {
                    return Err(CoreError::ValidationError(
                        "path must contain at least two addresses".into(),
                    ));
                }
                if path.first() != Some(initiator) || path.last() != Some(target) {
                    return Err(CoreError::ValidationError(
                        "path must run from initiator to target".into(),
                    ));
                }
                let unique: HashSet<&Address> = path.iter().collect();
                if unique.len() != path.len() {
                    return Err(CoreError::ValidationError(
                        "path must not revisit an address".into(),
                    ));
                }
            }
            Self::SecretRequest { amount, .. } if *amount == 0 => {
                return Err(CoreError::InvalidAmount(
                    "requested amount must be greater than zero".into(),
                ));
            }
            _ => {}
        }

        Ok(())
    }

    /// Deterministic bytes covered by the envelope signature.
    pub fn signing_payload(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec(self)?)
    }
}
