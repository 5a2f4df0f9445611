use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

/// Value in the asset's smallest unit.
pub type TokenAmount = u128;

/// Per-participant balance proof counter.
pub type Nonce = u64;

/// Height reported by the shared block clock.
pub type BlockNumber = u64;

/// A duration measured in blocks.
pub type BlockTimeout = u64;

/// Defines a 32-byte identifier newtype that serializes as a hex string.
macro_rules! bytes32 {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// The all-zero value.
            pub const ZERO: Self = Self([0u8; 32]);

            /// Create from a byte slice that must be exactly 32 bytes long.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
                let arr: [u8; 32] = bytes.try_into().map_err(|_| CoreError::InvalidLength {
                    expected: 32,
                    actual: bytes.len(),
                })?;
                Ok(Self(arr))
            }

            /// Raw bytes.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// Lowercase hex encoding without prefix.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Decode from hex, with or without a `0x` prefix.
            pub fn from_hex(s: &str) -> Result<Self, CoreError> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s).map_err(|e| CoreError::InvalidHex(e.to_string()))?;
                Self::from_slice(&bytes)
            }

            /// Abbreviated form used in logs.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", self.short())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

bytes32!(
    /// Participant, asset, or channel identifier.
    ///
    /// Participant addresses are Ed25519 verifying keys, so a signature can be
    /// checked against an address without any key lookup.
    Address
);

bytes32!(
    /// Preimage of a hashlock. Known only to the initiator until revealed.
    Secret
);

bytes32!(
    /// BLAKE3 hash of a [`Secret`].
    SecretHash
);

bytes32!(
    /// Merkle root over a participant's pending lock digests.
    Locksroot
);

impl Address {
    /// Derive a deterministic identifier from a domain tag and arbitrary bytes.
    ///
    /// Used for asset identifiers and ledger-assigned channel addresses.
    pub fn derive(domain: &str, data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }
}

impl Secret {
    /// The hashlock committing to this secret.
    pub fn hashlock(&self) -> SecretHash {
        SecretHash(*blake3::hash(&self.0).as_bytes())
    }

    /// Whether this secret opens the given hashlock.
    pub fn matches(&self, hashlock: &SecretHash) -> bool {
        self.hashlock() == *hashlock
    }
}

/// Unique identifier of a transfer initiated by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    /// Create a new time-ordered transfer ID (UUID v7).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
