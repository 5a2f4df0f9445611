//! Signed message envelope and its JSON codec.

use serde::{Deserialize, Serialize};

use netting_core::{Address, Message};
use netting_crypto::{Crypto, KeyPair};

use crate::error::NetworkError;

/// Version tag carried in every envelope.
pub const PROTOCOL_VERSION: u16 = 1;

/// A protocol message together with its sender and the sender's signature
/// over the message's canonical payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub version: u16,
    pub sender: Address,
    pub message: Message,
    #[serde(with = "hex_signature")]
    pub signature: Vec<u8>,
}

mod hex_signature {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

impl SignedMessage {
    /// Wrap and sign `message` as `keypair`.
    pub fn sign(
        message: Message,
        keypair: &KeyPair,
        crypto: &dyn Crypto,
    ) -> Result<Self, NetworkError> {
        let payload = message.signing_payload()?;
        let signature = crypto.sign(keypair, &payload);
        Ok(Self {
            version: PROTOCOL_VERSION,
            sender: keypair.address(),
            message,
            signature,
        })
    }

    /// Check the signature against the claimed sender.
    pub fn verify(&self, crypto: &dyn Crypto) -> Result<(), NetworkError> {
        let payload = self.message.signing_payload()?;
        if !crypto.verify(&self.sender, &payload, &self.signature) {
            return Err(NetworkError::InvalidSignature(self.sender));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetworkError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(NetworkError::Codec(format!(
                "unsupported protocol version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    /// Decode, authenticate and structurally validate inbound bytes.
    pub fn open(bytes: &[u8], crypto: &dyn Crypto) -> Result<Self, NetworkError> {
        let envelope = Self::decode(bytes)?;
        envelope.verify(crypto)?;
        envelope.message.validate()?;
        Ok(envelope)
    }
}
