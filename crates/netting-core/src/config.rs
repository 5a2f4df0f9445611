use serde::{Deserialize, Serialize};

use crate::types::BlockTimeout;

/// Protocol parameters shared by every node of a network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Smallest settle timeout the ledger accepts when opening a channel.
    #[serde(default = "default_min_settle_timeout")]
    pub min_settle_timeout: BlockTimeout,
    /// Settle timeout used when the caller does not pick one.
    #[serde(default = "default_settle_timeout")]
    pub default_settle_timeout: BlockTimeout,
    /// Blocks each hop subtracts from the lock expiration it forwards.
    #[serde(default = "default_reveal_timeout")]
    pub reveal_timeout: BlockTimeout,
    /// Longest path the initiator will try.
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    /// Blocks a finished transfer record is kept before it is forgotten.
    #[serde(default = "default_record_retention")]
    pub record_retention: BlockTimeout,
    /// Capacity of broadcast event channels.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_min_settle_timeout() -> BlockTimeout {
    6
}

fn default_settle_timeout() -> BlockTimeout {
    30
}

fn default_reveal_timeout() -> BlockTimeout {
    3
}

fn default_max_hops() -> usize {
    6
}

fn default_record_retention() -> BlockTimeout {
    100
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_settle_timeout: default_min_settle_timeout(),
            default_settle_timeout: default_settle_timeout(),
            reveal_timeout: default_reveal_timeout(),
            max_hops: default_max_hops(),
            record_retention: default_record_retention(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl ProtocolConfig {
    /// Lock expiration the initiator picks for a path of `hops` edges.
    pub fn initial_expiration(&self, now: u64, hops: usize) -> u64 {
        now + self.reveal_timeout * (hops as u64 + 1)
    }

    /// Smallest remaining lifetime a mediator accepts before forwarding.
    pub fn min_forward_margin(&self) -> BlockTimeout {
        2 * self.reveal_timeout
    }
}
