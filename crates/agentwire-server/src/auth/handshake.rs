//! Connection handshake: version negotiation and token verification.

use std::sync::Arc;

use agentwire_core::message::HelloPayload;
use agentwire_core::{ErrorCode, MessageKind, SessionId};
use chrono::{DateTime, Utc};

use super::session::{Session, SessionStore};
use super::verifier::{AuthError, TokenVerifier};

/// Where a connection is in its handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the client's `hello`.
    AwaitingHello,
    /// Token verification in progress.
    Authenticating,
    /// Session open; all message types accepted.
    Established,
    /// Handshake failed; the connection is closing.
    Rejected,
}

/// Handshake failures.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// Token verification failed.
    #[error(transparent)]
    Token(#[from] AuthError),
    /// No protocol version in common.
    #[error("no common protocol version (client offered {offered:?})")]
    VersionMismatch {
        /// Versions the client advertised.
        offered: Vec<String>,
    },
    /// A second `hello` on an established connection.
    #[error("handshake already completed")]
    AlreadyEstablished,
    /// The handshake already failed on this connection.
    #[error("handshake previously rejected")]
    Rejected,
    /// Non-`hello` message before the handshake completed.
    #[error("`{0}` received before authentication")]
    NotAuthenticated(MessageKind),
}

impl HandshakeError {
    /// Wire code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyEstablished => ErrorCode::ProtocolViolation,
            _ => ErrorCode::AuthenticationFailed,
        }
    }

    /// Message sent to the client. Authentication failures are reported
    /// without detail.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::AlreadyEstablished => "Handshake already completed",
            Self::VersionMismatch { .. } => "Unsupported protocol version",
            Self::NotAuthenticated(_) => "Authentication required",
            Self::Token(_) | Self::Rejected => "Authentication failed",
        }
    }
}

/// Pick the first server-supported version that the client also offers.
pub fn negotiate_version(client: &[&str], server: &[String]) -> Option<String> {
    server
        .iter()
        .find(|v| client.contains(&v.as_str()))
        .cloned()
}

/// Result of a successful handshake.
#[derive(Clone, Debug)]
pub struct Established {
    /// Opened or resumed session.
    pub session: Session,
    /// Whether an existing session was resumed.
    pub resumed: bool,
}

/// Runs the server side of the handshake.
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    sessions: Arc<SessionStore>,
    supported_versions: Vec<String>,
}

impl Authenticator {
    /// Create an authenticator.
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        sessions: Arc<SessionStore>,
        supported_versions: Vec<String>,
    ) -> Self {
        Self {
            verifier,
            sessions,
            supported_versions,
        }
    }

    /// Versions this server accepts.
    pub fn supported_versions(&self) -> &[String] {
        &self.supported_versions
    }

    /// Verify the `hello`, negotiate a version, and open (or resume) a
    /// session. `requested` is the envelope `sessionId`, if any.
    pub async fn authenticate(
        &self,
        hello: &HelloPayload,
        requested: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> Result<Established, HandshakeError> {
        let offered = hello.advertised_versions();
        let version = negotiate_version(&offered, &self.supported_versions).ok_or_else(|| {
            HandshakeError::VersionMismatch {
                offered: offered.iter().map(|v| (*v).to_owned()).collect(),
            }
        })?;
        let token = hello
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| AuthError::Invalid("missing token".into()))?;
        let verified = self.verifier.verify(token).await?;
        if verified.expires_at <= now {
            return Err(AuthError::Expired.into());
        }
        let (session, resumed) =
            self.sessions
                .open(&verified.subject, &version, verified.expires_at, requested, now);
        Ok(Established { session, resumed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::verifier::VerifiedToken;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::time::Duration;

    struct StaticVerifier;

    #[async_trait]
    impl TokenVerifier for StaticVerifier {
        async fn verify(&self, token: &str) -> Result<VerifiedToken, AuthError> {
            match token {
                "good" => Ok(VerifiedToken {
                    subject: "user-1".into(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                }),
                "expired" => Err(AuthError::Expired),
                _ => Err(AuthError::Invalid("bad signature".into())),
            }
        }
    }

    fn authenticator() -> (Authenticator, Arc<SessionStore>) {
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(3600)));
        let auth = Authenticator::new(
            Arc::new(StaticVerifier),
            Arc::clone(&sessions),
            vec!["1.0".into()],
        );
        (auth, sessions)
    }

    fn hello(token: &str, version: &str) -> HelloPayload {
        HelloPayload {
            token: Some(token.into()),
            protocol_version: version.into(),
            ..HelloPayload::default()
        }
    }

    #[test]
    fn negotiation_prefers_server_order() {
        let server = vec!["2.0".to_string(), "1.0".to_string()];
        assert_eq!(negotiate_version(&["1.0", "2.0"], &server).as_deref(), Some("2.0"));
        assert_eq!(negotiate_version(&["1.0"], &server).as_deref(), Some("1.0"));
        assert_eq!(negotiate_version(&["3.0"], &server), None);
    }

    #[tokio::test]
    async fn good_token_opens_session() {
        let (auth, sessions) = authenticator();
        let est = auth.authenticate(&hello("good", "1.0"), None, Utc::now()).await.unwrap();
        assert!(!est.resumed);
        assert_eq!(est.session.user_id, "user-1");
        assert_eq!(est.session.protocol_version, "1.0");
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn resume_existing_session() {
        let (auth, _) = authenticator();
        let first = auth.authenticate(&hello("good", "1.0"), None, Utc::now()).await.unwrap();
        let second = auth
            .authenticate(&hello("good", "1.0"), Some(&first.session.id), Utc::now())
            .await
            .unwrap();
        assert!(second.resumed);
        assert_eq!(second.session.id, first.session.id);
    }

    #[tokio::test]
    async fn expired_token_creates_no_session() {
        let (auth, sessions) = authenticator();
        let err = auth
            .authenticate(&hello("expired", "1.0"), None, Utc::now())
            .await
            .unwrap_err();
        assert_matches!(err, HandshakeError::Token(AuthError::Expired));
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        assert_eq!(err.client_message(), "Authentication failed");
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn version_mismatch_fails_before_verification() {
        let (auth, sessions) = authenticator();
        let err = auth
            .authenticate(&hello("good", "9.9"), None, Utc::now())
            .await
            .unwrap_err();
        assert_matches!(err, HandshakeError::VersionMismatch { ref offered } if offered == &["9.9".to_string()]);
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn missing_token_is_invalid() {
        let (auth, _) = authenticator();
        let mut h = hello("", "1.0");
        h.token = None;
        let err = auth.authenticate(&h, None, Utc::now()).await.unwrap_err();
        assert_matches!(err, HandshakeError::Token(AuthError::Invalid(_)));
    }

    #[test]
    fn second_hello_is_protocol_violation() {
        assert_eq!(
            HandshakeError::AlreadyEstablished.code(),
            ErrorCode::ProtocolViolation
        );
        assert_eq!(
            HandshakeError::NotAuthenticated(MessageKind::Query).code(),
            ErrorCode::AuthenticationFailed
        );
    }
}
