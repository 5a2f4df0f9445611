//! Netting networking crate
//!
//! Messages travel as JSON-encoded [`SignedMessage`] envelopes over a
//! [`Transport`]. [`LocalHub`] connects every node of one in-process network
//! and can inject duplicate and delayed deliveries.

pub mod error;
pub mod events;
pub mod protocol;
pub mod transport;

pub use error::NetworkError;
pub use events::IncomingMessage;
pub use protocol::{SignedMessage, PROTOCOL_VERSION};
pub use transport::{DeliveryFaults, LocalHub, Transport};
