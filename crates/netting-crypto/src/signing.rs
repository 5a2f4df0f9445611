use ed25519_dalek::{Signer, Verifier};

use netting_core::{Address, BalanceProof};

use crate::error::CryptoError;
use crate::keys::{verifying_key, KeyPair};

/// Ed25519 signature (64 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

impl Signature {
    /// Get the raw bytes (64 bytes).
    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    /// Create from raw bytes (64 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_arr: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidInput(format!("signature must be 64 bytes, got {}", bytes.len()))
        })?;
        Ok(Self {
            inner: ed25519_dalek::Signature::from_bytes(&bytes_arr),
        })
    }

    /// Encode as hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Sign a message using Ed25519.
pub fn sign(message: &[u8], keypair: &KeyPair) -> Signature {
    Signature {
        inner: keypair.signing_key().sign(message),
    }
}

/// Verify an Ed25519 signature against a participant address.
pub fn verify(message: &[u8], signature: &Signature, signer: &Address) -> Result<(), CryptoError> {
    verifying_key(signer)?
        .verify(message, &signature.inner)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

/// Sign a balance proof in place.
pub fn sign_balance_proof(proof: &mut BalanceProof, keypair: &KeyPair) {
    proof.signature = sign(&proof.signing_payload(), keypair).to_bytes().to_vec();
}

/// Verify that `signer` signed the balance proof.
pub fn verify_balance_proof(proof: &BalanceProof, signer: &Address) -> Result<(), CryptoError> {
    let sig = Signature::from_bytes(&proof.signature)?;
    verify(&proof.signing_payload(), &sig, signer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netting_core::Locksroot;

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let sig = sign(b"netting", &kp);
        assert!(verify(b"netting", &sig, &kp.address()).is_ok());
    }

    #[test]
    fn test_verify_wrong_signer() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = sign(b"netting", &kp);
        assert!(matches!(
            verify(b"netting", &sig, &other.address()),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_signature_wrong_length() {
        assert!(Signature::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_balance_proof_signature() {
        let kp = KeyPair::from_label("alice");
        let mut proof = BalanceProof::new(Address([1u8; 32]), 1, 50, Locksroot::ZERO);
        sign_balance_proof(&mut proof, &kp);
        assert!(proof.is_signed());
        assert!(verify_balance_proof(&proof, &kp.address()).is_ok());

        proof.transferred_amount = 60;
        assert!(verify_balance_proof(&proof, &kp.address()).is_err());
    }

    #[test]
    fn test_unsigned_balance_proof_fails() {
        let kp = KeyPair::generate();
        let proof = BalanceProof::new(Address([1u8; 32]), 1, 50, Locksroot::ZERO);
        assert!(matches!(
            verify_balance_proof(&proof, &kp.address()),
            Err(CryptoError::InvalidInput(_))
        ));
    }
}
