use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle of one feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Was connected, then no frame arrived within the loss timeout.
    /// Reconnects like `Disconnected` but is reported separately.
    Lost,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States from which the probe loop will try to (re)connect
    pub fn needs_connect(&self) -> bool {
        !self.is_connected()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Lost => "lost",
        };
        f.write_str(name)
    }
}
