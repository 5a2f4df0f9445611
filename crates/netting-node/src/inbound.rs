//! Per-partner ordering state of the inbound loop.

use std::collections::BTreeMap;

use netting_core::Nonce;
use netting_network::IncomingMessage;

/// How far past the expected nonce a proof may be held. Bounds the held
/// proofs per stream as well.
pub(crate) const MAX_HELD: usize = 64;

/// Applied proof digests remembered per stream.
pub(crate) const APPLIED_WINDOW: usize = 256;

/// Proofs one partner sent on one channel.
#[derive(Debug, Default)]
pub(crate) struct ProofStream {
    held: BTreeMap<Nonce, IncomingMessage>,
    applied: BTreeMap<Nonce, [u8; 32]>,
}

impl ProofStream {
    /// A proof with this nonce and digest was already applied.
    pub(crate) fn is_duplicate(&self, nonce: Nonce, digest: &[u8; 32]) -> bool {
        self.applied.get(&nonce) == Some(digest)
    }

    /// Remember an applied proof and hand back the held successor, if any.
    pub(crate) fn applied(&mut self, nonce: Nonce, digest: [u8; 32]) -> Option<IncomingMessage> {
        self.applied.insert(nonce, digest);
        while self.applied.len() > APPLIED_WINDOW {
            self.applied.pop_first();
        }
        // Held proofs at or below an applied nonce can never apply.
        self.held = self.held.split_off(&(nonce + 1));
        self.held.remove(&(nonce + 1))
    }

    /// Hold `msg` until the proof before it applies. Returns false when it
    /// lies beyond the reorder window and was dropped.
    pub(crate) fn hold(&mut self, expected: Nonce, nonce: Nonce, msg: IncomingMessage) -> bool {
        if nonce.saturating_sub(expected) >= MAX_HELD as Nonce {
            return false;
        }
        self.held.insert(nonce, msg);
        true
    }

    pub(crate) fn held(&self) -> usize {
        self.held.len()
    }
}
