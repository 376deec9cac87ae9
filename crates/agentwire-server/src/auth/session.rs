//! Authenticated sessions and their context.

use std::time::Duration;

use agentwire_core::SessionId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};

/// A session opened by a successful handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    /// Session identifier, stamped on every message in the session.
    pub id: SessionId,
    /// Authenticated user.
    pub user_id: String,
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// When the session was first opened.
    pub created_at: DateTime<Utc>,
    /// Earliest of token expiry and `created_at + ttl`.
    pub expires_at: DateTime<Utc>,
    /// Context accumulated through `context_update`.
    pub context: Map<String, Value>,
}

impl Session {
    /// Whether the session has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Session registry shared by every connection.
pub struct SessionStore {
    ttl: Duration,
    sessions: DashMap<SessionId, Session>,
}

impl SessionStore {
    /// Create a store whose sessions live at most `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: DashMap::new(),
        }
    }

    /// Open a session for `user_id`, or resume `requested` when it exists,
    /// belongs to the same user, and has not expired. Returns the session and
    /// whether it was resumed.
    ///
    /// A resumed session takes the new token's expiry, still capped at
    /// `created_at + ttl`, so a refreshed token extends it.
    pub fn open(
        &self,
        user_id: &str,
        protocol_version: &str,
        token_expires_at: DateTime<Utc>,
        requested: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> (Session, bool) {
        if let Some(id) = requested {
            if let Some(mut existing) = self.sessions.get_mut(id) {
                if existing.user_id == user_id && !existing.is_expired(now) {
                    existing.protocol_version = protocol_version.to_owned();
                    existing.expires_at =
                        self.ttl_expiry(existing.created_at).min(token_expires_at);
                    return (existing.clone(), true);
                }
            }
        }

        let session = Session {
            id: SessionId::new(),
            user_id: user_id.to_owned(),
            protocol_version: protocol_version.to_owned(),
            created_at: now,
            expires_at: self.ttl_expiry(now).min(token_expires_at),
            context: Map::new(),
        };
        let _ = self.sessions.insert(session.id.clone(), session.clone());
        (session, false)
    }

    fn ttl_expiry(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Look up a session.
    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Merge `update` into the session context. A `null` value removes the
    /// key. Returns false if the session is unknown.
    pub fn update_context(&self, id: &SessionId, update: &Map<String, Value>) -> bool {
        let Some(mut session) = self.sessions.get_mut(id) else {
            return false;
        };
        for (key, value) in update {
            if value.is_null() {
                let _ = session.context.remove(key);
            } else {
                let _ = session.context.insert(key.clone(), value.clone());
            }
        }
        true
    }

    /// Remove a session.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        before.saturating_sub(self.sessions.len())
    }

    /// Number of sessions held.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
