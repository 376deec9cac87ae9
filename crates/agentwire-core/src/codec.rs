//! Frame codec and validator.
//!
//! Decoding is two-phase: the envelope is checked structurally against a
//! loose JSON value first, then the payload is deserialized into the schema
//! selected by `type` and validated for the receiving [`Role`]. Every rule
//! fails closed. Nothing here performs I/O or holds state; per-connection
//! duplicate detection lives in [`crate::dedup`].

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::errors::CodecError;
use crate::ids::{MessageId, SessionId};
use crate::message::{Message, MessageKind, Metadata, Payload};

/// Which end of the connection is decoding.
///
/// `hello` has a different shape in each direction: servers require a
/// token, clients require capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Decoding frames sent by a client.
    Server,
    /// Decoding frames sent by a server.
    Client,
}

/// Size and freshness limits applied by [`Decoder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// How far in the past a timestamp may lie.
    pub max_skew_past: Duration,
    /// How far in the future a timestamp may lie.
    pub max_skew_future: Duration,
    /// Largest accepted frame in bytes.
    pub max_message_bytes: usize,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            max_skew_past: Duration::from_secs(300),
            max_skew_future: Duration::from_secs(30),
            max_message_bytes: 64 * 1024,
        }
    }
}

/// Envelope fields after structural checks, payload still untyped.
struct Envelope {
    id: MessageId,
    kind: MessageKind,
    timestamp: DateTime<Utc>,
    session_id: Option<SessionId>,
    payload: Value,
    metadata: Option<Metadata>,
}

// ── Decoding ────────────────────────────────────────────────────────

/// Decode and validate a frame without size or freshness checks.
pub fn decode(raw: &[u8], role: Role) -> Result<Message, CodecError> {
    parse_envelope(raw)?.into_message(role)
}

/// Stateful-free decoder bundling a role with a [`ValidationPolicy`].
#[derive(Clone, Copy, Debug)]
pub struct Decoder {
    role: Role,
    policy: ValidationPolicy,
}

impl Decoder {
    /// Create a decoder for the given receiving role.
    pub fn new(role: Role, policy: ValidationPolicy) -> Self {
        Self { role, policy }
    }

    /// Policy in effect.
    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Full validation: size, envelope, freshness, then payload.
    ///
    /// Freshness is checked before the payload so that a replayed frame is
    /// reported as stale whatever its body looks like.
    pub fn decode(&self, raw: &[u8], now: DateTime<Utc>) -> Result<Message, CodecError> {
        if raw.len() > self.policy.max_message_bytes {
            return Err(CodecError::TooLarge {
                size: raw.len(),
                limit: self.policy.max_message_bytes,
            });
        }
        let envelope = parse_envelope(raw)?;
        check_freshness(envelope.timestamp, now, &self.policy)?;
        envelope.into_message(self.role)
    }
}

/// Reject timestamps outside `[now - max_skew_past, now + max_skew_future]`.
///
/// The reported skew is the distance past the edge that was crossed:
/// positive for stale frames, negative for frames from the future.
pub fn check_freshness(
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &ValidationPolicy,
) -> Result<(), CodecError> {
    let age_ms = (now - timestamp).num_milliseconds();
    let past_ms = duration_ms(policy.max_skew_past);
    let future_ms = duration_ms(policy.max_skew_future);
    if age_ms > past_ms {
        return Err(CodecError::Stale {
            skew_ms: age_ms - past_ms,
        });
    }
    if -age_ms > future_ms {
        return Err(CodecError::Stale {
            skew_ms: age_ms + future_ms,
        });
    }
    Ok(())
}

/// Best-effort extraction of the envelope `id` from a frame that may have
/// failed validation, so error replies can reference it.
pub fn peek_id(raw: &[u8]) -> Option<MessageId> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    let id = value.get("id")?.as_str()?;
    if id.trim().is_empty() {
        return None;
    }
    Some(MessageId::from(id))
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_envelope(raw: &[u8]) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_slice(raw).map_err(CodecError::Json)?;
    let Value::Object(mut obj) = value else {
        return Err(CodecError::NotAnObject);
    };

    let id = required_string(&obj, "id")?;
    let type_name = match obj.get("type") {
        None => return Err(CodecError::MissingField("type")),
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(CodecError::InvalidField {
                field: "type",
                expected: "a string",
            });
        }
    };
    let kind = MessageKind::parse(&type_name).ok_or(CodecError::UnknownType(type_name))?;

    let raw_ts = required_string(&obj, "timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
        .map_err(|_| CodecError::InvalidField {
            field: "timestamp",
            expected: "an RFC 3339 timestamp",
        })?
        .with_timezone(&Utc);

    let session_id = match obj.get("sessionId") {
        None => return Err(CodecError::MissingField("sessionId")),
        Some(Value::Null) => None,
        Some(Value::String(s)) if !s.trim().is_empty() => Some(SessionId::from(s.as_str())),
        Some(_) => {
            return Err(CodecError::InvalidField {
                field: "sessionId",
                expected: "a non-empty string or null",
            });
        }
    };

    let payload = match obj.remove("payload") {
        None => return Err(CodecError::MissingField("payload")),
        Some(p @ Value::Object(_)) => p,
        Some(_) => {
            return Err(CodecError::InvalidField {
                field: "payload",
                expected: "an object",
            });
        }
    };

    let metadata = match obj.remove("metadata") {
        None | Some(Value::Null) => None,
        Some(m @ Value::Object(_)) => {
            Some(
                serde_json::from_value(m).map_err(|_| CodecError::InvalidField {
                    field: "metadata",
                    expected: "an object of known metadata fields",
                })?,
            )
        }
        Some(_) => {
            return Err(CodecError::InvalidField {
                field: "metadata",
                expected: "an object",
            });
        }
    };

    Ok(Envelope {
        id: MessageId::from(id),
        kind,
        timestamp,
        session_id,
        payload,
        metadata,
    })
}

fn required_string(obj: &Map<String, Value>, field: &'static str) -> Result<String, CodecError> {
    match obj.get(field) {
        None => Err(CodecError::MissingField(field)),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(_) => Err(CodecError::InvalidField {
            field,
            expected: "a non-empty string",
        }),
    }
}

impl Envelope {
    fn into_message(self, role: Role) -> Result<Message, CodecError> {
        let payload = Payload::from_value(self.kind, self.payload)
            .map_err(|e| CodecError::payload(self.kind, e.to_string()))?;
        validate_payload(&payload, role)?;
        Ok(Message {
            id: self.id,
            timestamp: self.timestamp,
            session_id: self.session_id,
            payload,
            metadata: self.metadata,
        })
    }
}

// ── Payload rules ───────────────────────────────────────────────────

/// Semantic checks that the payload schema alone cannot express.
pub fn validate_payload(payload: &Payload, role: Role) -> Result<(), CodecError> {
    let kind = payload.kind();
    let fail = |reason: &str| Err(CodecError::payload(kind, reason));
    match payload {
        Payload::Hello(hello) => {
            if hello.protocol_version.trim().is_empty() {
                return fail("protocolVersion must not be blank");
            }
            match role {
                Role::Server => {
                    if hello.token.as_deref().is_none_or(|t| t.trim().is_empty()) {
                        return fail("token is required");
                    }
                }
                Role::Client => {
                    if hello.capabilities.is_none() {
                        return fail("capabilities are required");
                    }
                }
            }
        }
        Payload::Query(q) => {
            if q.query.trim().is_empty() {
                return fail("query must not be blank");
            }
        }
        Payload::StreamingStart(s) => {
            if s.response_id.is_blank() {
                return fail("responseId must not be blank");
            }
            if s.content_type.trim().is_empty() {
                return fail("contentType must not be blank");
            }
        }
        Payload::StreamingChunk(c) => {
            if c.response_id.is_blank() {
                return fail("responseId must not be blank");
            }
        }
        Payload::StreamingEnd(e) => {
            if e.response_id.is_blank() {
                return fail("responseId must not be blank");
            }
        }
        Payload::Feedback(f) => {
            if let Some(rating) = f.rating {
                if !(1..=5).contains(&rating) {
                    return fail("rating must be between 1 and 5");
                }
            } else if f.comment.as_deref().is_none_or(|c| c.trim().is_empty()) {
                return fail("rating or comment is required");
            }
        }
        Payload::SessionUpdate(s) => {
            if s.subscribe.iter().chain(&s.unsubscribe).any(|t| t.trim().is_empty()) {
                return fail("topics must not be blank");
            }
        }
        Payload::Response(_)
        | Payload::ContextUpdate(_)
        | Payload::Error(_)
        | Payload::Ping(_)
        | Payload::Pong(_) => {}
    }
    Ok(())
}

// ── Encoding ────────────────────────────────────────────────────────

/// Serialize a message to its JSON text frame.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    let mut obj = Map::new();
    let _ = obj.insert("id".into(), Value::String(message.id.to_string()));
    let _ = obj.insert("type".into(), Value::String(message.kind().as_str().into()));
    let _ = obj.insert(
        "timestamp".into(),
        Value::String(
            message
                .timestamp
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        ),
    );
    let _ = obj.insert(
        "sessionId".into(),
        message
            .session_id
            .as_ref()
            .map_or(Value::Null, |s| Value::String(s.to_string())),
    );
    let _ = obj.insert(
        "payload".into(),
        message.payload.to_value().map_err(CodecError::Encode)?,
    );
    if let Some(metadata) = &message.metadata {
        let _ = obj.insert(
            "metadata".into(),
            serde_json::to_value(metadata).map_err(CodecError::Encode)?,
        );
    }
    serde_json::to_string(&Value::Object(obj)).map_err(CodecError::Encode)
}
