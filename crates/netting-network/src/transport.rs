//! Message transport capability and the in-process hub.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use netting_core::Address;

use crate::error::NetworkError;

/// Best-effort delivery of opaque payloads to a participant.
///
/// Delivery may be duplicated or reordered; receivers must tolerate both.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, recipient: Address, payload: Vec<u8>) -> Result<(), NetworkError>;
}

/// Faults injected by [`LocalHub`] to exercise duplicate and out-of-order delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFaults {
    /// Probability in `[0, 1]` that a payload is delivered twice.
    #[serde(default)]
    pub duplicate_probability: f64,
    /// Upper bound of a random per-payload delay in milliseconds.
    #[serde(default)]
    pub max_jitter_ms: u64,
}

impl DeliveryFaults {
    pub fn is_none(&self) -> bool {
        self.duplicate_probability <= 0.0 && self.max_jitter_ms == 0
    }
}

/// In-process transport connecting every node of one simulated network.
pub struct LocalHub {
    endpoints: DashMap<Address, mpsc::UnboundedSender<Vec<u8>>>,
    faults: DeliveryFaults,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Self::with_faults(DeliveryFaults::default())
    }

    pub fn with_faults(faults: DeliveryFaults) -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
            faults,
        })
    }

    /// Register `address` and return its inbound queue.
    pub fn register(
        &self,
        address: Address,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, NetworkError> {
        if self.endpoints.contains_key(&address) {
            return Err(NetworkError::AlreadyRegistered(address));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.insert(address, tx);
        tracing::debug!(peer = %address, "endpoint registered");
        Ok(rx)
    }

    pub fn unregister(&self, address: &Address) {
        self.endpoints.remove(address);
    }

    pub fn peer_count(&self) -> usize {
        self.endpoints.len()
    }

    fn deliver(
        tx: &mpsc::UnboundedSender<Vec<u8>>,
        recipient: Address,
        payload: Vec<u8>,
    ) -> Result<(), NetworkError> {
        tx.send(payload)
            .map_err(|_| NetworkError::ShutDown(recipient))
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn send(&self, recipient: Address, payload: Vec<u8>) -> Result<(), NetworkError> {
        let tx = self
            .endpoints
            .get(&recipient)
            .map(|entry| entry.value().clone())
            .ok_or(NetworkError::UnknownPeer(recipient))?;

        if self.faults.is_none() {
            return Self::deliver(&tx, recipient, payload);
        }

        let (duplicate, delays) = {
            let mut rng = rand::thread_rng();
            let duplicate = rng.gen_bool(self.faults.duplicate_probability.clamp(0.0, 1.0));
            let max = self.faults.max_jitter_ms;
            let mut delay = || if max == 0 { 0 } else { rng.gen_range(0..=max) };
            (duplicate, [delay(), delay()])
        };
        let copies = if duplicate { 2 } else { 1 };

        for delay in delays.into_iter().take(copies) {
            let tx = tx.clone();
            let payload = payload.clone();
            if delay == 0 {
                Self::deliver(&tx, recipient, payload)?;
            } else {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if Self::deliver(&tx, recipient, payload).is_err() {
                        tracing::debug!(peer = %recipient, "delayed payload dropped, peer gone");
                    }
                });
            }
        }
        Ok(())
    }
}
