//! Connection state machine for the client driver.
//!
//! ```text
//! Idle → Connecting → Handshaking → Connected
//!          ↑                            │ drop
//!          └──── Reconnecting(n) ←──────┘
//! any → Failed(reason) | Closed
//! ```

use std::fmt;

/// Why the driver gave up.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    /// The server rejected the credentials. Not retried.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// Every reconnect attempt failed.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Observable driver state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started.
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport open, waiting for the `hello` reply.
    Handshaking,
    /// Session established; queued messages flow.
    Connected,
    /// Waiting out the backoff before attempt `attempt`.
    Reconnecting {
        /// One-based reconnect attempt.
        attempt: u32,
    },
    /// Terminal failure.
    Failed(FailureReason),
    /// Shut down by the application.
    Closed,
}

impl ConnectionState {
    /// `Failed` and `Closed` never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Closed)
    }

    /// Whether messages are currently being delivered.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Failed(_) => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            _ => f.write_str(self.label()),
        }
    }
}
