//! Connection lifecycle states and the legal transitions between them.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Transport opened, handshake pending.
    Connecting,
    /// Handshake complete, loops running.
    Connected,
    /// Backoff timer pending for the given 1-based attempt.
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    /// True while streaming is "on" from the user's point of view.
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }

    /// Whether the orchestrator may move from `self` to `next`.
    ///
    /// `Connecting` and `Disconnected` are reachable from everywhere because
    /// `connect` and `disconnect` are explicit resets.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Connecting) | (_, Disconnected) => true,
            (Connecting, Connected) => true,
            (Connected, Reconnecting { attempt }) => *attempt == 1,
            (Connecting, Reconnecting { attempt }) => *attempt >= 1,
            _ => false,
        }
    }

    /// Short human label; `max_attempts` is shown while reconnecting.
    pub fn label(&self, max_attempts: u32) -> String {
        match self {
            ConnectionState::Disconnected => "Disconnected".to_string(),
            ConnectionState::Connecting => "Connecting".to_string(),
            ConnectionState::Connected => "Live".to_string(),
            ConnectionState::Reconnecting { attempt } => {
                format!("Reconnecting ({attempt}/{max_attempts})")
            }
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}
