//! Wire message model.
//!
//! A [`Message`] is an envelope (`id`, `timestamp`, `sessionId`, optional
//! `metadata`) around a [`Payload`], an exhaustive enum over every message
//! kind the protocol knows. The `type` field on the wire is derived from the
//! payload variant, so the two can never disagree.
//!
//! Payload structs use camelCase field names and skip absent optionals, so
//! `decode(encode(m)) == m` holds for every valid message.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::ErrorCode;
use crate::ids::{MessageId, ResponseId, SessionId};

/// Discriminant of a [`Payload`], serialized as the envelope `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Handshake request (client) or reply (server).
    Hello,
    /// Request for the agent.
    Query,
    /// Single-message reply.
    Response,
    /// Opens a streaming response.
    StreamingStart,
    /// One piece of a streaming response.
    StreamingChunk,
    /// Closes a streaming response.
    StreamingEnd,
    /// User feedback about a previous reply.
    Feedback,
    /// Updates the session's free-form context.
    ContextUpdate,
    /// Subscription changes and session state.
    SessionUpdate,
    /// Error report.
    Error,
    /// Liveness probe.
    Ping,
    /// Liveness answer.
    Pong,
}

impl MessageKind {
    /// Every kind, in wire-documentation order.
    pub const ALL: [Self; 12] = [
        Self::Hello,
        Self::Query,
        Self::Response,
        Self::StreamingStart,
        Self::StreamingChunk,
        Self::StreamingEnd,
        Self::Feedback,
        Self::ContextUpdate,
        Self::SessionUpdate,
        Self::Error,
        Self::Ping,
        Self::Pong,
    ];

    /// Wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Query => "query",
            Self::Response => "response",
            Self::StreamingStart => "streaming_start",
            Self::StreamingChunk => "streaming_chunk",
            Self::StreamingEnd => "streaming_end",
            Self::Feedback => "feedback",
            Self::ContextUpdate => "context_update",
            Self::SessionUpdate => "session_update",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Look up a kind by wire name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    /// Whether this kind belongs to the streaming family.
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            Self::StreamingStart | Self::StreamingChunk | Self::StreamingEnd
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a streaming response ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    /// All content delivered; the assembled response is valid.
    Complete,
    /// The producer gave up; discard the content.
    Cancelled,
    /// The producer failed; discard the content.
    Error,
}

/// Optional envelope metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// User the message is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Client application instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Correlation ID for tracing across services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Protocol version the sender speaks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Compression applied to the payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    /// Whether the payload is end-to-end encrypted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
}

/// Server capabilities announced in the handshake reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Interval between server liveness probes.
    pub heartbeat_interval_ms: u64,
    /// Largest frame the server accepts.
    pub max_message_bytes: u64,
    /// Whether the requested session was resumed rather than created.
    pub resumed: bool,
    /// Whether the server streams long replies.
    pub streaming: bool,
    /// Kinds the server understands.
    pub message_types: Vec<MessageKind>,
}

/// `hello` payload, used in both directions.
///
/// Clients send `token` and the versions they speak; the server answers with
/// the negotiated `protocolVersion` and `capabilities`.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    /// Bearer token (client → server only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Preferred (client) or negotiated (server) protocol version.
    pub protocol_version: String,
    /// Additional versions the sender can speak.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_versions: Vec<String>,
    /// Free-form client name for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Server capabilities (server → client only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
}

impl HelloPayload {
    /// Every version the sender advertised, preferred first, without duplicates.
    pub fn advertised_versions(&self) -> Vec<&str> {
        let mut versions = vec![self.protocol_version.as_str()];
        for v in &self.supported_versions {
            if !versions.contains(&v.as_str()) {
                versions.push(v);
            }
        }
        versions
    }
}

impl fmt::Debug for HelloPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloPayload")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("protocol_version", &self.protocol_version)
            .field("supported_versions", &self.supported_versions)
            .field("client_name", &self.client_name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// `query` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPayload {
    /// The request text.
    #[serde(alias = "q")]
    pub query: String,
    /// Caller-supplied context for this query only.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// `response` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    /// Reply body.
    pub content: String,
    /// MIME type of `content` when not plain text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// ID of the message being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
    /// Structured data accompanying the reply.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An explicit `null` stays `Some(Value::Null)`; only a missing field is `None`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// `streaming_start` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingStartPayload {
    /// Stream identifier.
    pub response_id: ResponseId,
    /// MIME type of the assembled content.
    pub content_type: String,
    /// Advisory total length in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_length: Option<u64>,
    /// ID of the message being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
}

/// `streaming_chunk` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingChunkPayload {
    /// Stream identifier.
    pub response_id: ResponseId,
    /// Content appended to the stream.
    pub content: String,
    /// Producer hint that no more chunks follow. Advisory only.
    #[serde(default)]
    pub is_final: bool,
}

/// `streaming_end` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingEndPayload {
    /// Stream identifier.
    pub response_id: ResponseId,
    /// Authoritative outcome of the stream.
    pub completion_reason: CompletionReason,
    /// Short failure description for `error` completions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `feedback` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackPayload {
    /// Message the feedback refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Rating from 1 to 5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    /// Free-text comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// `context_update` payload. Keys are merged into the session context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdatePayload {
    /// Keys to set; `null` values remove a key.
    pub context: Map<String, Value>,
}

/// `session_update` payload.
///
/// Clients send topic changes; the server answers with the resulting
/// subscription set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdatePayload {
    /// Topics to add.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribe: Vec<String>,
    /// Topics to remove.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsubscribe: Vec<String>,
    /// Current subscription set (server → client).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<Vec<String>>,
    /// When the session expires (server → client).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// `error` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Stable machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description. Never contains internal detail.
    pub message: String,
    /// Suggested wait before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// ID of the offending message, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
    /// Whether the sender closes the connection after this error.
    #[serde(default)]
    pub fatal: bool,
}

/// `ping` / `pong` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbePayload {
    /// Opaque value echoed back in the `pong`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Typed payload of a message. The variant determines the envelope `type`.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// `hello`
    Hello(HelloPayload),
    /// `query`
    Query(QueryPayload),
    /// `response`
    Response(ResponsePayload),
    /// `streaming_start`
    StreamingStart(StreamingStartPayload),
    /// `streaming_chunk`
    StreamingChunk(StreamingChunkPayload),
    /// `streaming_end`
    StreamingEnd(StreamingEndPayload),
    /// `feedback`
    Feedback(FeedbackPayload),
    /// `context_update`
    ContextUpdate(ContextUpdatePayload),
    /// `session_update`
    SessionUpdate(SessionUpdatePayload),
    /// `error`
    Error(ErrorPayload),
    /// `ping`
    Ping(ProbePayload),
    /// `pong`
    Pong(ProbePayload),
}

impl Payload {
    /// Kind of this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Hello(_) => MessageKind::Hello,
            Self::Query(_) => MessageKind::Query,
            Self::Response(_) => MessageKind::Response,
            Self::StreamingStart(_) => MessageKind::StreamingStart,
            Self::StreamingChunk(_) => MessageKind::StreamingChunk,
            Self::StreamingEnd(_) => MessageKind::StreamingEnd,
            Self::Feedback(_) => MessageKind::Feedback,
            Self::ContextUpdate(_) => MessageKind::ContextUpdate,
            Self::SessionUpdate(_) => MessageKind::SessionUpdate,
            Self::Error(_) => MessageKind::Error,
            Self::Ping(_) => MessageKind::Ping,
            Self::Pong(_) => MessageKind::Pong,
        }
    }

    /// Serialize the inner payload to a JSON value.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Hello(p) => serde_json::to_value(p),
            Self::Query(p) => serde_json::to_value(p),
            Self::Response(p) => serde_json::to_value(p),
            Self::StreamingStart(p) => serde_json::to_value(p),
            Self::StreamingChunk(p) => serde_json::to_value(p),
            Self::StreamingEnd(p) => serde_json::to_value(p),
            Self::Feedback(p) => serde_json::to_value(p),
            Self::ContextUpdate(p) => serde_json::to_value(p),
            Self::SessionUpdate(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
            Self::Ping(p) | Self::Pong(p) => serde_json::to_value(p),
        }
    }

    /// Deserialize the payload schema for `kind` from a JSON value.
    pub fn from_value(kind: MessageKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            MessageKind::Hello => Self::Hello(serde_json::from_value(value)?),
            MessageKind::Query => Self::Query(serde_json::from_value(value)?),
            MessageKind::Response => Self::Response(serde_json::from_value(value)?),
            MessageKind::StreamingStart => Self::StreamingStart(serde_json::from_value(value)?),
            MessageKind::StreamingChunk => Self::StreamingChunk(serde_json::from_value(value)?),
            MessageKind::StreamingEnd => Self::StreamingEnd(serde_json::from_value(value)?),
            MessageKind::Feedback => Self::Feedback(serde_json::from_value(value)?),
            MessageKind::ContextUpdate => Self::ContextUpdate(serde_json::from_value(value)?),
            MessageKind::SessionUpdate => Self::SessionUpdate(serde_json::from_value(value)?),
            MessageKind::Error => Self::Error(serde_json::from_value(value)?),
            MessageKind::Ping => Self::Ping(serde_json::from_value(value)?),
            MessageKind::Pong => Self::Pong(serde_json::from_value(value)?),
        })
    }
}

/// A complete wire message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    /// Unique envelope ID.
    pub id: MessageId,
    /// Send time; checked against the replay window on receipt.
    pub timestamp: DateTime<Utc>,
    /// Session the message belongs to; `None` before the handshake.
    pub session_id: Option<SessionId>,
    /// Typed body.
    pub payload: Payload,
    /// Optional metadata.
    pub metadata: Option<Metadata>,
}

impl Message {
    /// New message with a fresh ID, stamped now, outside any session.
    pub fn new(payload: Payload) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            session_id: None,
            payload,
            metadata: None,
        }
    }

    /// Attach (or clear) the session ID.
    #[must_use]
    pub fn in_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Kind of the payload.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Build an `error` message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(Payload::Error(ErrorPayload {
            code,
            message: message.into(),
            retry_after_ms: None,
            in_reply_to: None,
            fatal: code.is_fatal(),
        }))
    }

    /// Build a `ping` with a fresh nonce.
    pub fn ping() -> Self {
        Self::new(Payload::Ping(ProbePayload {
            nonce: Some(MessageId::new().into_inner()),
        }))
    }

    /// Build the `pong` answering a `ping` nonce.
    pub fn pong(nonce: Option<String>) -> Self {
        Self::new(Payload::Pong(ProbePayload { nonce }))
    }
}
