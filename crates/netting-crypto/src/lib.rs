pub mod error;
pub mod keys;
pub mod signing;
pub mod hashing;
pub mod provider;

pub use error::CryptoError;
pub use hashing::{generate_secret, hash, locksroot, merkle_root, Hash};
pub use keys::KeyPair;
pub use provider::{Crypto, DefaultCrypto};
pub use signing::{sign, sign_balance_proof, verify, verify_balance_proof, Signature};
