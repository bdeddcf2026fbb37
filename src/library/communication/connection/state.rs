use std::fmt;

/// Lifecycle of the link managed by a [`ConnectionManager`](super::ConnectionManager)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link exists, the next operation will establish one
    Disconnected,
    /// A link is being established
    Connecting,
    /// The link is up
    Connected,
    /// The link is being torn down for good
    Closing,
    /// The link has been torn down and will not be re-established
    Closed,
}

impl ConnectionState {
    /// Whether the manager has been stopped
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
