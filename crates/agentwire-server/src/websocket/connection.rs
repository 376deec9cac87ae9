//! Per-connection state shared between the socket tasks, the handler, and
//! the registry.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agentwire_core::{ConnectionId, ErrorCode, Message, SessionId, encode};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a connection was closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or went away.
    ClientClosed,
    /// No inbound activity for longer than the idle timeout.
    HeartbeatTimeout,
    /// Fatal protocol violation.
    ProtocolViolation(String),
    /// Handshake failed.
    AuthenticationFailed,
    /// Recoverable violations reached the configured maximum.
    TooManyViolations,
    /// Outbound queue overflowed.
    SlowConsumer,
    /// A socket write did not finish in time.
    SendTimeout,
    /// Server is shutting down.
    ServerShutdown,
    /// Socket read or write failed.
    TransportError(String),
    /// Global connection cap reached.
    CapacityExceeded,
}

impl CloseReason {
    /// Stable label for logs, metrics, and audit events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::AuthenticationFailed => "authentication_failed",
            Self::TooManyViolations => "too_many_violations",
            Self::SlowConsumer => "slow_consumer",
            Self::SendTimeout => "send_timeout",
            Self::ServerShutdown => "server_shutdown",
            Self::TransportError(_) => "transport_error",
            Self::CapacityExceeded => "capacity_exceeded",
        }
    }

    /// WebSocket close code sent with the close frame.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::ClientClosed => 1000,
            Self::HeartbeatTimeout | Self::ServerShutdown => 1001,
            Self::ProtocolViolation(_)
            | Self::AuthenticationFailed
            | Self::TooManyViolations
            | Self::CapacityExceeded => 1008,
            Self::SlowConsumer | Self::SendTimeout | Self::TransportError(_) => 1011,
        }
    }

    /// Text of the close frame.
    pub fn close_text(&self) -> &'static str {
        match self {
            Self::ClientClosed => "",
            Self::HeartbeatTimeout => "Heartbeat timeout",
            Self::ProtocolViolation(_) => "Protocol violation",
            Self::AuthenticationFailed => "Authentication failed",
            Self::TooManyViolations => "Too many invalid messages",
            Self::SlowConsumer => "Slow consumer",
            Self::SendTimeout => "Send timeout",
            Self::ServerShutdown => "Server shutting down",
            Self::TransportError(_) => "Transport error",
            Self::CapacityExceeded => "Maximum connections reached",
        }
    }

    /// Application `error` frame queued before the close frame, if any.
    /// Reasons where the peer is gone or unreachable have none.
    pub fn final_error(&self) -> Option<Message> {
        let code = match self {
            Self::ProtocolViolation(_) | Self::TooManyViolations => ErrorCode::ProtocolViolation,
            Self::AuthenticationFailed => ErrorCode::AuthenticationFailed,
            Self::ServerShutdown => ErrorCode::InternalError,
            Self::ClientClosed
            | Self::HeartbeatTimeout
            | Self::SlowConsumer
            | Self::SendTimeout
            | Self::TransportError(_)
            | Self::CapacityExceeded => return None,
        };
        let mut message = Message::error(code, self.close_text());
        if let agentwire_core::Payload::Error(ref mut p) = message.payload {
            p.fatal = true;
        }
        Some(message)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(detail) | Self::TransportError(detail) => {
                write!(f, "{}: {detail}", self.as_str())
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Transport details captured at upgrade time.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// `User-Agent` header, if sent.
    pub user_agent: Option<String>,
}

/// Why an outbound frame was not queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// No such connection.
    #[error("connection not found")]
    NotFound,
    /// Outbound queue full; the connection has been closed as a slow consumer.
    #[error("outbound queue full")]
    QueueFull,
    /// Connection already closed.
    #[error("connection closed")]
    Closed,
    /// Message could not be serialized.
    #[error("failed to encode message")]
    Encode,
}

#[derive(Debug, Default)]
struct AuthState {
    user_id: Option<String>,
    session_id: Option<SessionId>,
}

/// A live WebSocket connection.
pub struct Connection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Peer address.
    pub remote_addr: SocketAddr,
    /// `User-Agent` header, if sent.
    pub user_agent: Option<String>,
    /// When the connection was accepted.
    pub established_at: Instant,
    last_activity: Mutex<Instant>,
    auth: Mutex<AuthState>,
    subscriptions: Mutex<BTreeSet<String>>,
    tx: mpsc::Sender<Arc<String>>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Create a connection feeding `tx`.
    pub fn new(info: ConnectionInfo, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            remote_addr: info.remote_addr,
            user_agent: info.user_agent,
            established_at: now,
            last_activity: Mutex::new(now),
            auth: Mutex::new(AuthState::default()),
            subscriptions: Mutex::new(BTreeSet::new()),
            tx,
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Queue an encoded frame without blocking. A full queue closes the
    /// connection as a slow consumer.
    pub fn send(&self, frame: Arc<String>) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                let _ = self.close(CloseReason::SlowConsumer);
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Stamp the connection's session onto `message`, encode, and queue it.
    pub fn send_message(&self, message: Message) -> Result<(), SendError> {
        let message = message.in_session(self.session_id());
        let frame = encode(&message).map_err(|_| SendError::Encode)?;
        self.send(Arc::new(frame))
    }

    /// Record inbound activity.
    pub fn mark_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Bind the connection to an authenticated user and session.
    pub fn authenticate(&self, user_id: String, session_id: SessionId) {
        let mut auth = self.auth.lock();
        auth.user_id = Some(user_id);
        auth.session_id = Some(session_id);
    }

    /// Authenticated user, if any.
    pub fn user_id(&self) -> Option<String> {
        self.auth.lock().user_id.clone()
    }

    /// Bound session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.auth.lock().session_id.clone()
    }

    /// Whether the handshake completed.
    pub fn is_authenticated(&self) -> bool {
        self.auth.lock().session_id.is_some()
    }

    /// Add a topic subscription. Returns false if already subscribed.
    pub fn subscribe(&self, topic: &str) -> bool {
        self.subscriptions.lock().insert(topic.to_owned())
    }

    /// Remove a topic subscription. Returns false if not subscribed.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.subscriptions.lock().remove(topic)
    }

    /// Current subscriptions, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Whether the connection is subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains(topic)
    }

    /// Frames waiting in the outbound queue.
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Token cancelled when the connection closes.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the connection. The first reason wins; returns false if it
    /// was already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut slot = self.close_reason.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(reason);
        drop(slot);
        self.cancel.cancel();
        true
    }

    /// Reason the connection was closed, if it was.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("session_id", &self.session_id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
