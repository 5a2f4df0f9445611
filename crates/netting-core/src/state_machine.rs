use std::fmt;

use crate::error::CoreError;

/// Lifecycle of a payment channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ChannelState {
    /// Not yet registered on the ledger.
    Empty,
    /// Registered; deposits and off-chain transfers are allowed.
    Open,
    /// A participant posted its partner's balance proof; the settle window runs.
    Closed,
    /// Payouts distributed. Final state.
    Settled,
}

impl ChannelState {
    /// Whether this is a final (terminal) state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Settled)
    }

    /// Whether off-chain transfers may use the channel.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Open => write!(f, "Open"),
            Self::Closed => write!(f, "Closed"),
            Self::Settled => write!(f, "Settled"),
        }
    }
}

/// Ledger events that drive a channel's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Closed,
    Settled,
}

/// Validates channel state transitions.
///
/// Valid transitions:
/// - Empty → Open (Opened)
/// - Open → Closed (Closed)
/// - Closed → Settled (Settled)
pub struct ChannelStateMachine;

impl ChannelStateMachine {
    /// Attempt a state transition based on an event.
    pub fn transition(current: ChannelState, event: ChannelEvent) -> Result<ChannelState, CoreError> {
        let new_state = match (current, event) {
            (ChannelState::Empty, ChannelEvent::Opened) => ChannelState::Open,
            (ChannelState::Open, ChannelEvent::Closed) => ChannelState::Closed,
            (ChannelState::Closed, ChannelEvent::Settled) => ChannelState::Settled,
            _ => {
                let target = match event {
                    ChannelEvent::Opened => ChannelState::Open,
                    ChannelEvent::Closed => ChannelState::Closed,
                    ChannelEvent::Settled => ChannelState::Settled,
                };
                return Err(CoreError::InvalidStateTransition {
                    from: current,
                    to: target,
                });
            }
        };

        tracing::debug!(
            from = %current,
            to = %new_state,
            event = ?event,
            "channel state transition"
        );

        Ok(new_state)
    }

    /// Check if a transition is valid without performing it.
    pub fn can_transition(current: ChannelState, event: ChannelEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
