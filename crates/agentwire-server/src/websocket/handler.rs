//! Per-connection protocol logic.
//!
//! [`ConnectionHandler::handle_frame`] runs every inbound frame through the
//! same pipeline: decode and validate, gate on the handshake, check the
//! session and message rate, drop duplicates, then dispatch on the payload.
//! An id is only remembered once its message is accepted, so a message
//! rejected as rate limited can be resent with the same id. The socket task
//! owns the handler and acts on the returned [`FrameOutcome`].

use std::sync::Arc;

use agentwire_core::message::{
    Capabilities, FeedbackPayload, HelloPayload, SessionUpdatePayload,
};
use agentwire_core::{
    DedupWindow, ErrorCode, Message, MessageId, MessageKind, Payload, SessionId, StreamError,
    StreamOutcome, peek_id,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};

use super::connection::{CloseReason, Connection};
use crate::audit::AuditEvent;
use crate::auth::{Established, HandshakeError, HandshakeState};
use crate::context::ServerContext;
use crate::metrics::{
    AUTH_FAILURES_TOTAL, MESSAGES_DUPLICATE_TOTAL, MESSAGES_RECEIVED_TOTAL,
    MESSAGES_REJECTED_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS, RATE_LIMITED_TOTAL,
};
use crate::ratelimit::{RateLimited, Scope};
use crate::reasoning::QueryRequest;
use crate::streaming::StreamingCoordinator;

/// What the socket task should do after a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Keep reading.
    Continue,
    /// Close the connection. Any error reply has already been queued.
    Close(CloseReason),
}

/// Protocol state for one connection.
pub struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    state: HandshakeState,
    session_expires_at: Option<DateTime<Utc>>,
    dedup: DedupWindow,
    violations: u32,
}

impl ConnectionHandler {
    /// Create a handler for a freshly registered connection.
    pub fn new(ctx: Arc<ServerContext>, conn: Arc<Connection>) -> Self {
        let dedup = DedupWindow::new(ctx.config.dedup_window, ctx.config.dedup_capacity);
        Self {
            ctx,
            conn,
            state: HandshakeState::AwaitingHello,
            session_expires_at: None,
            dedup,
            violations: 0,
        }
    }

    /// Current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Recoverable violations so far.
    pub fn violations(&self) -> u32 {
        self.violations
    }

    /// Process one inbound frame.
    pub async fn handle_frame(&mut self, raw: &[u8]) -> FrameOutcome {
        self.conn.mark_activity();
        if self.state == HandshakeState::Rejected {
            return FrameOutcome::Close(CloseReason::AuthenticationFailed);
        }

        let now = Utc::now();
        let message = match self.ctx.decoder.decode(raw, now) {
            Ok(message) => message,
            Err(e) => {
                counter!(MESSAGES_REJECTED_TOTAL, "code" => e.code().as_str()).increment(1);
                debug!(conn_id = %self.conn.id, error = %e, "rejected frame");
                self.send(error_reply(e.code(), e.to_string(), peek_id(raw)));
                return self.record_violation();
            }
        };
        let kind = message.kind();
        counter!(MESSAGES_RECEIVED_TOTAL, "type" => kind.as_str()).increment(1);

        if self.state != HandshakeState::Established {
            if !self.first_sighting(&message.id) {
                return FrameOutcome::Continue;
            }
            return match message.payload {
                Payload::Hello(hello) => {
                    self.handshake(message.id, &hello, message.session_id.as_ref(), now)
                        .await
                }
                _ => self.reject_handshake(&HandshakeError::NotAuthenticated(kind), message.id),
            };
        }

        let Some(session_id) = self.conn.session_id() else {
            return self.reject_handshake(&HandshakeError::NotAuthenticated(kind), message.id);
        };
        if self.session_expires_at.is_some_and(|exp| exp <= now) {
            info!(conn_id = %self.conn.id, %session_id, "session expired");
            let mut reply = error_reply(ErrorCode::AuthenticationFailed, "Session expired", Some(message.id));
            set_fatal(&mut reply);
            self.send(reply);
            return FrameOutcome::Close(CloseReason::AuthenticationFailed);
        }
        if message.session_id.as_ref().is_some_and(|sid| *sid != session_id) {
            counter!(MESSAGES_REJECTED_TOTAL, "code" => ErrorCode::InvalidFormat.as_str())
                .increment(1);
            self.send(error_reply(
                ErrorCode::InvalidFormat,
                "sessionId does not match this connection",
                Some(message.id),
            ));
            return self.record_violation();
        }
        if let Err(limited) = self
            .ctx
            .limiter
            .check(Scope::MessageBySession, session_id.as_str(), 1)
        {
            self.rate_limited(&limited, message.id);
            return FrameOutcome::Continue;
        }
        if !self.first_sighting(&message.id) {
            return FrameOutcome::Continue;
        }

        self.dispatch(message.id, message.payload, session_id)
    }

    fn first_sighting(&mut self, id: &MessageId) -> bool {
        if self.dedup.observe(id, Instant::now().into_std()) {
            return true;
        }
        counter!(MESSAGES_DUPLICATE_TOTAL).increment(1);
        debug!(conn_id = %self.conn.id, msg_id = %id, "duplicate message dropped");
        false
    }

    async fn handshake(
        &mut self,
        id: MessageId,
        hello: &HelloPayload,
        requested: Option<&SessionId>,
        now: DateTime<Utc>,
    ) -> FrameOutcome {
        self.state = HandshakeState::Authenticating;
        let established = match self.ctx.authenticator.authenticate(hello, requested, now).await {
            Ok(established) => established,
            Err(e) => return self.reject_handshake(&e, id),
        };
        let Established { session, resumed } = established;
        self.state = HandshakeState::Established;
        self.session_expires_at = Some(session.expires_at);
        self.conn.authenticate(session.user_id.clone(), session.id.clone());
        info!(
            conn_id = %self.conn.id,
            session_id = %session.id,
            user_id = %session.user_id,
            version = %session.protocol_version,
            resumed,
            "handshake complete"
        );
        self.ctx.audit.record(AuditEvent::ConnectionEstablished {
            connection_id: self.conn.id.clone(),
            remote_addr: self.conn.remote_addr,
            user_id: session.user_id.clone(),
            session_id: session.id.clone(),
        });

        let config = &self.ctx.config;
        let reply = HelloPayload {
            token: None,
            protocol_version: session.protocol_version,
            supported_versions: self.ctx.authenticator.supported_versions().to_vec(),
            client_name: None,
            capabilities: Some(Capabilities {
                heartbeat_interval_ms: u64::try_from(config.heartbeat_interval.as_millis())
                    .unwrap_or(u64::MAX),
                max_message_bytes: config.validation.max_message_bytes as u64,
                resumed,
                streaming: true,
                message_types: MessageKind::ALL.to_vec(),
            }),
        };
        self.send(Message::new(Payload::Hello(reply)));
        FrameOutcome::Continue
    }

    fn reject_handshake(&mut self, err: &HandshakeError, in_reply_to: MessageId) -> FrameOutcome {
        self.state = HandshakeState::Rejected;
        counter!(AUTH_FAILURES_TOTAL).increment(1);
        warn!(conn_id = %self.conn.id, remote_addr = %self.conn.remote_addr, error = %err, "handshake failed");
        // Failed attempts spend the peer's connection budget.
        let _ = self.ctx.limiter.check(
            Scope::ConnectionByIp,
            &self.conn.remote_addr.ip().to_string(),
            1,
        );
        self.ctx.audit.record(AuditEvent::AuthenticationFailed {
            connection_id: self.conn.id.clone(),
            remote_addr: self.conn.remote_addr,
            reason: err.to_string(),
        });
        let mut reply = error_reply(err.code(), err.client_message(), Some(in_reply_to));
        set_fatal(&mut reply);
        self.send(reply);
        FrameOutcome::Close(CloseReason::AuthenticationFailed)
    }

    fn dispatch(&mut self, id: MessageId, payload: Payload, session_id: SessionId) -> FrameOutcome {
        let conn_id = self.conn.id.clone();
        match payload {
            Payload::Hello(_) => {
                let err = HandshakeError::AlreadyEstablished;
                self.protocol_violation(err.code(), err.client_message(), id)
            }
            Payload::Query(query) => self.handle_query(id, query.query, query.context, session_id),
            Payload::Response(_) => {
                self.send(error_reply(
                    ErrorCode::InvalidFormat,
                    "response messages are server-originated",
                    Some(id),
                ));
                self.record_violation()
            }
            Payload::StreamingStart(start) => match self.ctx.streaming.start(&conn_id, &start) {
                Ok(()) => FrameOutcome::Continue,
                Err(e) => self.stream_violation(&e, id),
            },
            Payload::StreamingChunk(chunk) => match self.ctx.streaming.append(&conn_id, &chunk) {
                Ok(()) => FrameOutcome::Continue,
                Err(e) => self.stream_violation(&e, id),
            },
            Payload::StreamingEnd(end) => match self.ctx.streaming.finish(&conn_id, &end) {
                Ok(StreamOutcome::Completed(assembled)) => {
                    debug!(%conn_id, response_id = %assembled.response_id, chunks = assembled.chunk_count, "inbound stream complete");
                    let origin = assembled.in_reply_to.unwrap_or(id);
                    self.handle_query(origin, assembled.content, None, session_id)
                }
                Ok(StreamOutcome::Cancelled { response_id }) => {
                    debug!(%conn_id, %response_id, "inbound stream cancelled");
                    FrameOutcome::Continue
                }
                Ok(StreamOutcome::Errored { response_id, error }) => {
                    debug!(%conn_id, %response_id, error = error.as_deref().unwrap_or(""), "inbound stream errored");
                    FrameOutcome::Continue
                }
                Err(e) => self.stream_violation(&e, id),
            },
            Payload::Feedback(feedback) => {
                self.handle_feedback(id, &feedback, &session_id);
                FrameOutcome::Continue
            }
            Payload::ContextUpdate(update) => {
                if !self.ctx.sessions.update_context(&session_id, &update.context) {
                    warn!(%conn_id, %session_id, "context update for unknown session");
                }
                FrameOutcome::Continue
            }
            Payload::SessionUpdate(update) => {
                for topic in &update.subscribe {
                    let _ = self.conn.subscribe(topic);
                }
                for topic in &update.unsubscribe {
                    let _ = self.conn.unsubscribe(topic);
                }
                let reply = SessionUpdatePayload {
                    subscriptions: Some(self.conn.subscriptions()),
                    expires_at: self.session_expires_at,
                    ..SessionUpdatePayload::default()
                };
                self.send(Message::new(Payload::SessionUpdate(reply)));
                FrameOutcome::Continue
            }
            Payload::Error(err) => {
                warn!(%conn_id, code = %err.code, message = %err.message, "client reported error");
                FrameOutcome::Continue
            }
            Payload::Ping(probe) => {
                self.send(Message::pong(probe.nonce));
                FrameOutcome::Continue
            }
            Payload::Pong(_) => FrameOutcome::Continue,
        }
    }

    fn handle_query(
        &mut self,
        id: MessageId,
        query: String,
        context: Option<Value>,
        session_id: SessionId,
    ) -> FrameOutcome {
        let cost = self.ctx.reasoning.query_cost(&query);
        if let Err(limited) =
            self.ctx
                .limiter
                .check(Scope::QueryByComplexity, session_id.as_str(), cost)
        {
            self.rate_limited(&limited, id);
            return FrameOutcome::Continue;
        }
        counter!(QUERIES_TOTAL).increment(1);

        let request = QueryRequest {
            session_context: self
                .ctx
                .sessions
                .get(&session_id)
                .map(|s| s.context)
                .unwrap_or_default(),
            session_id,
            user_id: self.conn.user_id().unwrap_or_default(),
            message_id: id.clone(),
            query,
            context,
        };
        let ctx = Arc::clone(&self.ctx);
        let conn = Arc::clone(&self.conn);
        let span = tracing::debug_span!("query", conn_id = %conn.id, msg_id = %id);
        let _ = tokio::spawn(
            async move {
                let cancel = conn.cancel_token();
                let started = Instant::now();
                let reply = tokio::select! {
                    () = cancel.cancelled() => return,
                    reply = ctx.reasoning.respond(request) => reply,
                };
                histogram!(QUERY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
                match reply {
                    Ok(reply) => {
                        let _ = ctx.streaming.dispatch(&conn, reply, Some(id)).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "reasoning failed");
                        let _ = conn.send_message(error_reply(
                            ErrorCode::InternalError,
                            "Internal error",
                            Some(id),
                        ));
                    }
                }
            }
            .instrument(span),
        );
        FrameOutcome::Continue
    }

    fn handle_feedback(&self, id: MessageId, feedback: &FeedbackPayload, session_id: &SessionId) {
        info!(
            conn_id = %self.conn.id,
            %session_id,
            target_msg = feedback.message_id.as_ref().map_or("", MessageId::as_str),
            rating = feedback.rating,
            has_comment = feedback.comment.is_some(),
            "feedback received"
        );
        if let Err(e) = StreamingCoordinator::respond(&self.conn, "Feedback received", Some(id)) {
            debug!(conn_id = %self.conn.id, error = %e, "feedback ack not queued");
        }
    }

    fn stream_violation(&mut self, err: &StreamError, id: MessageId) -> FrameOutcome {
        warn!(conn_id = %self.conn.id, error = %err, "stream ordering violation");
        self.protocol_violation(err.code(), &err.to_string(), id)
    }

    fn protocol_violation(&mut self, code: ErrorCode, text: &str, id: MessageId) -> FrameOutcome {
        counter!(MESSAGES_REJECTED_TOTAL, "code" => code.as_str()).increment(1);
        let mut reply = error_reply(code, text, Some(id));
        set_fatal(&mut reply);
        self.send(reply);
        FrameOutcome::Close(CloseReason::ProtocolViolation(text.to_owned()))
    }

    fn rate_limited(&self, limited: &RateLimited, id: MessageId) {
        counter!(RATE_LIMITED_TOTAL, "scope" => limited.scope.as_str()).increment(1);
        debug!(conn_id = %self.conn.id, scope = %limited.scope, retry_after_ms = limited.retry_after_ms(), "rate limited");
        let mut reply = error_reply(ErrorCode::RateLimited, "Rate limit exceeded", Some(id));
        if let Payload::Error(ref mut p) = reply.payload {
            p.retry_after_ms = Some(limited.retry_after_ms());
        }
        self.send(reply);
    }

    fn record_violation(&mut self) -> FrameOutcome {
        self.violations += 1;
        if self.violations < self.ctx.config.max_violations {
            return FrameOutcome::Continue;
        }
        warn!(conn_id = %self.conn.id, violations = self.violations, "too many invalid messages");
        let reason = CloseReason::TooManyViolations;
        if let Some(final_error) = reason.final_error() {
            self.send(final_error);
        }
        FrameOutcome::Close(reason)
    }

    fn send(&self, message: Message) {
        if let Err(e) = self.conn.send_message(message) {
            debug!(conn_id = %self.conn.id, error = %e, "reply not queued");
        }
    }
}

fn error_reply(code: ErrorCode, text: impl Into<String>, in_reply_to: Option<MessageId>) -> Message {
    let mut message = Message::error(code, text);
    if let Payload::Error(ref mut p) = message.payload {
        p.in_reply_to = in_reply_to;
    }
    message
}

fn set_fatal(message: &mut Message) {
    if let Payload::Error(ref mut p) = message.payload {
        p.fatal = true;
    }
}
