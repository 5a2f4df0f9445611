use netting_core::Address;

use crate::hashing::{self, Hash};
use crate::keys::KeyPair;
use crate::signing::{self, Signature};

/// Cryptographic capability used by channels and the transport envelope.
pub trait Crypto: Send + Sync {
    fn sign(&self, keypair: &KeyPair, payload: &[u8]) -> Vec<u8>;

    /// Returns `false` for malformed signatures as well as wrong signers.
    fn verify(&self, signer: &Address, payload: &[u8], signature: &[u8]) -> bool;

    fn hash(&self, data: &[u8]) -> Hash;
}

/// Ed25519 signatures with BLAKE3 hashing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCrypto;

impl Crypto for DefaultCrypto {
    fn sign(&self, keypair: &KeyPair, payload: &[u8]) -> Vec<u8> {
        signing::sign(payload, keypair).to_bytes().to_vec()
    }

    fn verify(&self, signer: &Address, payload: &[u8], signature: &[u8]) -> bool {
        match Signature::from_bytes(signature) {
            Ok(sig) => signing::verify(payload, &sig, signer).is_ok(),
            Err(e) => {
                tracing::trace!(error = %e, "malformed signature");
                false
            }
        }
    }

    fn hash(&self, data: &[u8]) -> Hash {
        hashing::hash(data)
    }
}
