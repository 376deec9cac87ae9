//! Shared server context injected into every connection task.

use std::sync::Arc;
use std::time::Instant;

use agentwire_core::{Decoder, Role};

use crate::audit::AuditSink;
use crate::auth::{Authenticator, SessionStore, TokenVerifier};
use crate::config::ServerConfig;
use crate::ratelimit::RateLimiter;
use crate::reasoning::ReasoningService;
use crate::streaming::StreamingCoordinator;
use crate::websocket::registry::ConnectionRegistry;

/// Everything a connection needs, built once at startup.
pub struct ServerContext {
    /// Resolved configuration.
    pub config: ServerConfig,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Rate limiter for all scopes.
    pub limiter: Arc<RateLimiter>,
    /// Session store.
    pub sessions: Arc<SessionStore>,
    /// Handshake authenticator.
    pub authenticator: Authenticator,
    /// Streaming coordinator.
    pub streaming: Arc<StreamingCoordinator>,
    /// Reasoning collaborator.
    pub reasoning: Arc<dyn ReasoningService>,
    /// Audit collaborator.
    pub audit: Arc<dyn AuditSink>,
    /// Inbound frame decoder.
    pub decoder: Decoder,
    /// When the server started.
    pub start_time: Instant,
}

impl ServerContext {
    /// Build the shared state from configuration and collaborators.
    pub fn new(
        config: ServerConfig,
        verifier: Arc<dyn TokenVerifier>,
        reasoning: Arc<dyn ReasoningService>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections,
            config.outbound_queue_capacity,
        ));
        let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let sessions = Arc::new(SessionStore::new(config.session_ttl));
        let authenticator = Authenticator::new(
            verifier,
            Arc::clone(&sessions),
            config.supported_versions.clone(),
        );
        let streaming = Arc::new(StreamingCoordinator::new(
            config.stream_timeout,
            config.stream_max_buffer_bytes,
        ));
        let decoder = Decoder::new(Role::Server, config.validation);
        Self {
            config,
            registry,
            limiter,
            sessions,
            authenticator,
            streaming,
            reasoning,
            audit,
            decoder,
            start_time: Instant::now(),
        }
    }
}
