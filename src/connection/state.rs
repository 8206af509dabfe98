//! Lifecycle of a connection.
//!
//! ```text
//! Connecting -> Open -> CloseSent ------> Closed
//!                  \                   /
//!                   -> CloseReceived -
//! ```
//!
//! The transitions are pure functions so the driver can apply them atomically inside a
//! `watch::Sender::send_if_modified` call.

/// State of a WebSocket connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// The upgrade is still in progress.
    Connecting,
    /// Messages flow in both directions.
    Open,
    /// We sent a close frame and wait for the peer's.
    CloseSent,
    /// The peer sent a close frame and ours is on its way.
    CloseReceived,
    /// Terminal. The stream is shut down.
    Closed,
}

/// What the driver does after a close frame arrived.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// Echo the close frame, then move to [`ConnectionState::Closed`].
    Respond,
    /// The handshake we started is complete.
    Complete,
    /// The frame came at a point where no close frame is expected.
    Abort,
}

impl ConnectionState {
    /// Whether messages may be sent.
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// The handshake layer finished the upgrade.
    pub(crate) fn on_open(self) -> Option<Self> {
        match self {
            Self::Connecting => Some(Self::Open),
            _ => None,
        }
    }

    /// We are about to send the first close frame.
    pub(crate) fn on_close_initiated(self) -> Option<Self> {
        match self {
            Self::Open => Some(Self::CloseSent),
            _ => None,
        }
    }

    /// A close frame arrived from the peer.
    pub(crate) fn on_close_frame(self) -> (Self, CloseAction) {
        match self {
            Self::Open => (Self::CloseReceived, CloseAction::Respond),
            Self::CloseSent => (Self::Closed, CloseAction::Complete),
            Self::Connecting | Self::CloseReceived | Self::Closed => {
                (Self::Closed, CloseAction::Abort)
            }
        }
    }

    /// Our reply to the peer's close frame went out.
    pub(crate) fn on_close_response_sent(self) -> Self {
        Self::Closed
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::CloseSent => "close-sent",
            Self::CloseReceived => "close-received",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open() {
        assert_eq!(
            ConnectionState::Connecting.on_open(),
            Some(ConnectionState::Open)
        );
        assert_eq!(ConnectionState::Closed.on_open(), None);
        assert_eq!(ConnectionState::Open.on_open(), None);
    }

    #[test]
    fn test_responder_path() {
        let (state, action) = ConnectionState::Open.on_close_frame();
        assert_eq!(state, ConnectionState::CloseReceived);
        assert_eq!(action, CloseAction::Respond);
        assert_eq!(state.on_close_response_sent(), ConnectionState::Closed);
    }

    #[test]
    fn test_initiator_path() {
        let state = ConnectionState::Open.on_close_initiated().unwrap();
        assert_eq!(state, ConnectionState::CloseSent);
        assert_eq!(state.on_close_initiated(), None);

        let (state, action) = state.on_close_frame();
        assert_eq!(state, ConnectionState::Closed);
        assert_eq!(action, CloseAction::Complete);
    }

    #[test]
    fn test_unexpected_close_frame() {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::CloseReceived,
            ConnectionState::Closed,
        ] {
            assert_eq!(
                state.on_close_frame(),
                (ConnectionState::Closed, CloseAction::Abort)
            );
        }
    }
}
