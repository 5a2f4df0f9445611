use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroize;

use netting_core::Address;

use crate::error::CryptoError;

/// Ed25519 key pair of a network participant.
///
/// The participant's [`Address`] is its verifying key.
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair using OS-provided entropy.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create a key pair from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Create a key pair from raw seed bytes (32 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let mut seed: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        let kp = Self::from_seed(&seed);
        seed.zeroize();
        Ok(kp)
    }

    /// Deterministic key pair derived from a label; used by simulations and tests.
    pub fn from_label(label: &str) -> Self {
        let mut seed = *blake3::hash(label.as_bytes()).as_bytes();
        let kp = Self::from_seed(&seed);
        seed.zeroize();
        kp
    }

    /// The participant address (verifying key bytes).
    pub fn address(&self) -> Address {
        Address(self.signing_key.verifying_key().to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Parse an address as an Ed25519 verifying key.
pub fn verifying_key(address: &Address) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_bytes(address.as_bytes())
        .map_err(|e| CryptoError::InvalidInput(format!("address is not a valid public key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = KeyPair::from_seed(&[7u8; 32]);
        let b = KeyPair::from_seed(&[7u8; 32]);
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn test_generate_unique() {
        assert_ne!(KeyPair::generate().address(), KeyPair::generate().address());
    }

    #[test]
    fn test_from_bytes_wrong_length() {
        let result = KeyPair::from_bytes(&[1u8; 16]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_from_label() {
        assert_eq!(
            KeyPair::from_label("node-1").address(),
            KeyPair::from_label("node-1").address()
        );
        assert_ne!(
            KeyPair::from_label("node-1").address(),
            KeyPair::from_label("node-2").address()
        );
    }

    #[test]
    fn test_address_is_verifying_key() {
        let kp = KeyPair::generate();
        assert!(verifying_key(&kp.address()).is_ok());
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = KeyPair::from_seed(&[3u8; 32]);
        let debug = format!("{:?}", kp);
        assert!(debug.contains("address"));
        assert!(!debug.contains(&hex::encode([3u8; 32])));
    }
}
