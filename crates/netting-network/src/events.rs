//! Inbound message types handed from the transport to the node.

use netting_core::{Address, Message};

use crate::protocol::SignedMessage;

/// An authenticated message received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub sender: Address,
    pub message: Message,
}

impl From<SignedMessage> for IncomingMessage {
    fn from(envelope: SignedMessage) -> Self {
        Self {
            sender: envelope.sender,
            message: envelope.message,
        }
    }
}
