//! # agentwire-server
//!
//! Axum WebSocket server for the agentwire protocol.
//!
//! - Handshake: JWT verification, version negotiation, session issue and resume
//! - Per-frame pipeline: validation, deduplication, rate limiting, dispatch
//! - Streaming replies out and stream reassembly in
//! - Heartbeat probes and idle eviction
//! - `/health` and Prometheus `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod audit;
pub mod auth;
pub mod config;
pub mod context;
pub mod health;
pub mod metrics;
pub mod ratelimit;
pub mod reasoning;
pub mod server;
pub mod shutdown;
pub mod streaming;
pub mod websocket;

pub use audit::{AuditEvent, AuditSink, ChannelAuditSink, TracingAuditSink};
pub use auth::{JwtVerifier, TokenVerifier};
pub use config::ServerConfig;
pub use context::ServerContext;
pub use reasoning::{AcknowledgingReasoner, QueryRequest, ReasoningError, ReasoningService, Reply};
pub use server::{AgentServer, ServerHandle};
