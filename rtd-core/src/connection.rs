//! Exchange connection lifecycle types

use serde::{Deserialize, Serialize};

/// Lifecycle state of the streaming connection
///
/// `Disconnected -> Connecting -> Open -> Disconnected -> Connecting ...`
/// until an explicit shutdown moves it to the terminal `Closed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected, a reconnect is pending
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Welcome handshake done, channels subscribed
    Open,
    /// Shut down, never reconnects
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Anything that can ask the exchange for a fresh depth snapshot
///
/// Must return without waiting for the reply.
pub trait SnapshotRequester: Send + Sync {
    fn request_snapshot(&self, symbol: &str);
}
