use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkErrorKind};

/// Device link connection state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        next_delay_ms: u64,
    },
    Error {
        kind: LinkErrorKind,
        message: String,
        retryable: bool,
    },
}

impl ConnectionState {
    pub fn from_error(error: &LinkError) -> Self {
        ConnectionState::Error {
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Error { .. } => "error",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        if matches!(next, Disconnected) {
            return true;
        }

        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Error { .. }) => true,
            (Connected, Reconnecting { .. }) => true,
            (Reconnecting { .. }, Reconnecting { .. } | Connected | Error { .. }) => true,
            (Error { .. }, Connecting) => true,
            // a retryable connect failure may hand over to the reconnect loop
            (Error { retryable: true, .. }, Reconnecting { .. }) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Reconnecting {
                attempt,
                max_attempts,
                next_delay_ms,
            } => write!(
                f,
                "reconnecting ({}/{} in {} ms)",
                attempt, max_attempts, next_delay_ms
            ),
            ConnectionState::Error { kind, message, .. } => {
                write!(f, "error ({}): {}", kind.as_str(), message)
            }
            other => f.write_str(other.label()),
        }
    }
}
