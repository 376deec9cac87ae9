//! Registry of live connections and message fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use agentwire_core::{ConnectionId, Message};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::{CloseReason, Connection, ConnectionInfo, SendError};

/// Aggregate statistics over live connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live connections.
    pub count: usize,
    /// Connections that completed the handshake.
    pub authenticated: usize,
    /// Age of the oldest connection.
    pub oldest_age: Duration,
    /// Sum of idle time across connections.
    pub total_idle: Duration,
}

/// Per-connection detail for diagnostics.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    /// Connection ID.
    pub id: String,
    /// Peer address.
    pub remote_addr: String,
    /// `User-Agent`, if sent.
    pub user_agent: Option<String>,
    /// Authenticated user.
    pub user_id: Option<String>,
    /// Bound session.
    pub session_id: Option<String>,
    /// Topic subscriptions.
    pub subscriptions: Vec<String>,
    /// Connection age in milliseconds.
    pub age_ms: u64,
    /// Idle time in milliseconds.
    pub idle_ms: u64,
    /// Frames waiting in the outbound queue.
    pub queue_depth: usize,
}

/// Registration failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Global connection cap reached.
    #[error("maximum connections ({0}) reached")]
    CapacityExceeded(usize),
    /// No such connection.
    #[error("connection not found")]
    NotFound,
}

/// Owns every live [`Connection`].
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    count: AtomicUsize,
    max_connections: usize,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Create a registry with a connection cap and per-connection queue size.
    pub fn new(max_connections: usize, queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            count: AtomicUsize::new(0),
            max_connections,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Register a new connection. Returns the connection and the receiving
    /// end of its outbound queue.
    pub fn register(
        &self,
        info: ConnectionInfo,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Arc<String>>), RegistryError> {
        let max = self.max_connections;
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|_| RegistryError::CapacityExceeded(max))?;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let conn = Arc::new(Connection::new(info, tx));
        let _ = self.connections.insert(conn.id.clone(), Arc::clone(&conn));
        debug!(conn_id = %conn.id, count = self.len(), "connection registered");
        Ok((conn, rx))
    }

    /// Remove a connection. Idempotent.
    pub fn deregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let (_, conn) = self.connections.remove(id)?;
        let _ = self.count.fetch_sub(1, Ordering::AcqRel);
        debug!(conn_id = %id, count = self.len(), "connection deregistered");
        Some(conn)
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|c| Arc::clone(&c))
    }

    /// Send a message to one connection. Never blocks.
    pub fn send(&self, id: &ConnectionId, message: Message) -> Result<(), SendError> {
        let conn = self.get(id).ok_or(SendError::NotFound)?;
        conn.send_message(message)
    }

    /// Send a pre-encoded frame to one connection.
    pub fn send_frame(&self, id: &ConnectionId, frame: Arc<String>) -> Result<(), SendError> {
        let conn = self.get(id).ok_or(SendError::NotFound)?;
        conn.send(frame)
    }

    /// Send `message` to every connection matching `predicate`, stamping each
    /// recipient's session. Returns how many accepted it.
    pub fn broadcast<F>(&self, predicate: F, message: &Message) -> usize
    where
        F: Fn(&Connection) -> bool,
    {
        let mut delivered = 0;
        for conn in self.snapshot() {
            if !predicate(&conn) {
                continue;
            }
            match conn.send_message(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(conn_id = %conn.id, error = %e, "broadcast send failed"),
            }
        }
        delivered
    }

    /// Send to every authenticated connection subscribed to `topic`.
    pub fn publish(&self, topic: &str, message: &Message) -> usize {
        self.broadcast(|c| c.is_authenticated() && c.is_subscribed(topic), message)
    }

    /// Send to every connection of `user_id`.
    pub fn send_to_user(&self, user_id: &str, message: &Message) -> usize {
        self.broadcast(|c| c.user_id().as_deref() == Some(user_id), message)
    }

    /// Subscribe a connection to a topic.
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        self.get(id)
            .map(|c| c.subscribe(topic))
            .ok_or(RegistryError::NotFound)
    }

    /// Unsubscribe a connection from a topic.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        self.get(id)
            .map(|c| c.unsubscribe(topic))
            .ok_or(RegistryError::NotFound)
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in &self.connections {
            let conn = entry.value();
            stats.count += 1;
            if conn.is_authenticated() {
                stats.authenticated += 1;
            }
            stats.oldest_age = stats.oldest_age.max(conn.age());
            stats.total_idle += conn.idle_for();
        }
        stats
    }

    /// Per-connection detail.
    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        self.snapshot()
            .iter()
            .map(|c| ConnectionSummary {
                id: c.id.to_string(),
                remote_addr: c.remote_addr.to_string(),
                user_agent: c.user_agent.clone(),
                user_id: c.user_id(),
                session_id: c.session_id().map(|s| s.to_string()),
                subscriptions: c.subscriptions(),
                age_ms: u64::try_from(c.age().as_millis()).unwrap_or(u64::MAX),
                idle_ms: u64::try_from(c.idle_for().as_millis()).unwrap_or(u64::MAX),
                queue_depth: c.queue_depth(),
            })
            .collect()
    }

    /// Queue the final `error` frame for `reason` (if it has one) and close
    /// the connection. The socket tasks deregister it on exit.
    pub fn close(&self, id: &ConnectionId, reason: CloseReason) -> Result<(), RegistryError> {
        let conn = self.get(id).ok_or(RegistryError::NotFound)?;
        close_connection(&conn, reason);
        Ok(())
    }

    /// Close every connection with `reason`. Returns how many were closed.
    pub fn close_all(&self, reason: &CloseReason) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| close_connection(c, reason.clone()))
            .count()
    }

    /// Clone out the current connections; no lock is held afterwards.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Live connection count.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Whether no connections are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured connection cap.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Queue the final error frame, then close. Returns false if the
/// connection was already closed.
pub(crate) fn close_connection(conn: &Connection, reason: CloseReason) -> bool {
    if conn.is_closed() {
        return false;
    }
    if let Some(final_error) = reason.final_error() {
        let _ = conn.send_message(final_error);
    }
    conn.close(reason)
}
