//! Security audit events.

use std::net::SocketAddr;

use agentwire_core::{ConnectionId, SessionId};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::websocket::connection::CloseReason;

/// Events reported to the audit collaborator.
#[derive(Clone, Debug, PartialEq)]
pub enum AuditEvent {
    /// Handshake succeeded.
    ConnectionEstablished {
        /// Connection ID.
        connection_id: ConnectionId,
        /// Peer address.
        remote_addr: SocketAddr,
        /// Authenticated user.
        user_id: String,
        /// Opened or resumed session.
        session_id: SessionId,
    },
    /// Connection closed for any reason.
    ConnectionClosed {
        /// Connection ID.
        connection_id: ConnectionId,
        /// Why it closed.
        reason: CloseReason,
    },
    /// Handshake failed.
    AuthenticationFailed {
        /// Connection ID.
        connection_id: ConnectionId,
        /// Peer address.
        remote_addr: SocketAddr,
        /// Internal description; never sent to the client.
        reason: String,
    },
}

/// Fire-and-forget audit sink.
pub trait AuditSink: Send + Sync {
    /// Record an event. Must not block.
    fn record(&self, event: AuditEvent);
}

/// Writes audit events as structured `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event {
            AuditEvent::ConnectionEstablished {
                connection_id,
                remote_addr,
                user_id,
                session_id,
            } => info!(
                target: "agentwire::audit",
                %connection_id, %remote_addr, %user_id, %session_id,
                "connection established"
            ),
            AuditEvent::ConnectionClosed {
                connection_id,
                reason,
            } => info!(
                target: "agentwire::audit",
                %connection_id, reason = %reason,
                "connection closed"
            ),
            AuditEvent::AuthenticationFailed {
                connection_id,
                remote_addr,
                reason,
            } => warn!(
                target: "agentwire::audit",
                %connection_id, %remote_addr, %reason,
                "authentication failed"
            ),
        }
    }
}

/// Forwards events to an unbounded channel. Used in tests.
#[derive(Clone, Debug)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAuditSink {
    /// Create a sink and the receiver that observes it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        let _ = self.tx.send(event);
    }
}
