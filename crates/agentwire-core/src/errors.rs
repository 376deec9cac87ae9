//! Stable wire error codes and codec errors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::MessageKind;

// ── Error code constants ────────────────────────────────────────────

/// Frame failed structural, schema, size, or freshness validation.
pub const INVALID_FORMAT: &str = "INVALID_FORMAT";
/// Handshake failed or a message arrived before the handshake completed.
pub const AUTHENTICATION_FAILED: &str = "AUTHENTICATION_FAILED";
/// A rate-limit scope was exceeded.
pub const RATE_LIMITED: &str = "RATE_LIMITED";
/// The peer broke the protocol state machine.
pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
/// Unexpected failure on our side. Never carries internal detail.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Machine-readable error code carried in `error` payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// See [`INVALID_FORMAT`].
    InvalidFormat,
    /// See [`AUTHENTICATION_FAILED`].
    AuthenticationFailed,
    /// See [`RATE_LIMITED`].
    RateLimited,
    /// See [`PROTOCOL_VIOLATION`].
    ProtocolViolation,
    /// See [`INTERNAL_ERROR`].
    InternalError,
}

impl ErrorCode {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidFormat => INVALID_FORMAT,
            Self::AuthenticationFailed => AUTHENTICATION_FAILED,
            Self::RateLimited => RATE_LIMITED,
            Self::ProtocolViolation => PROTOCOL_VIOLATION,
            Self::InternalError => INTERNAL_ERROR,
        }
    }

    /// Whether an error with this code ends the connection.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::AuthenticationFailed | Self::ProtocolViolation)
    }

    /// Whether the peer may retry the same request later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::InternalError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while decoding, validating, or encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame exceeds the configured size limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Frame is not valid JSON.
    #[error("message is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    /// Top-level JSON value is not an object.
    #[error("message must be a JSON object")]
    NotAnObject,

    /// A required envelope field is absent.
    #[error("missing envelope field `{0}`")]
    MissingField(&'static str),

    /// An envelope field has the wrong primitive type or an unusable value.
    #[error("envelope field `{field}` must be {expected}")]
    InvalidField {
        /// Wire name of the field.
        field: &'static str,
        /// Human description of the expected shape.
        expected: &'static str,
    },

    /// `type` is not one of the known message kinds.
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// Payload does not match the schema for its kind.
    #[error("invalid `{kind}` payload: {reason}")]
    InvalidPayload {
        /// Kind whose schema was violated.
        kind: MessageKind,
        /// What is wrong.
        reason: String,
    },

    /// Timestamp falls outside the accepted window around receipt time.
    #[error("timestamp is {skew_ms} ms outside the accepted window (stale or replayed)")]
    Stale {
        /// Signed distance past the window edge in milliseconds: positive
        /// when stale, negative when ahead of the receiver's clock.
        skew_ms: i64,
    },

    /// Serializing an outbound message failed.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl CodecError {
    /// Wire code reported to the peer for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Encode(_) => ErrorCode::InternalError,
            _ => ErrorCode::InvalidFormat,
        }
    }

    pub(crate) fn payload(kind: MessageKind, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::AuthenticationFailed).unwrap();
        assert_eq!(json, "\"AUTHENTICATION_FAILED\"");
        let back: ErrorCode = serde_json::from_str("\"RATE_LIMITED\"").unwrap();
        assert_eq!(back, ErrorCode::RateLimited);
    }

    #[test]
    fn as_str_matches_serde() {
        for code in [
            ErrorCode::InvalidFormat,
            ErrorCode::AuthenticationFailed,
            ErrorCode::RateLimited,
            ErrorCode::ProtocolViolation,
            ErrorCode::InternalError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json.trim_matches('"'), code.as_str());
        }
    }

    #[test]
    fn fatal_codes() {
        assert!(ErrorCode::AuthenticationFailed.is_fatal());
        assert!(ErrorCode::ProtocolViolation.is_fatal());
        assert!(!ErrorCode::InvalidFormat.is_fatal());
        assert!(!ErrorCode::RateLimited.is_fatal());
        assert!(!ErrorCode::InternalError.is_fatal());
    }

    #[test]
    fn codec_errors_map_to_invalid_format() {
        assert_eq!(CodecError::NotAnObject.code(), ErrorCode::InvalidFormat);
        assert_eq!(CodecError::Stale { skew_ms: 10 }.code(), ErrorCode::InvalidFormat);
        assert_eq!(
            CodecError::UnknownType("x".into()).code(),
            ErrorCode::InvalidFormat
        );
    }

    #[test]
    fn display_mentions_field() {
        let err = CodecError::MissingField("sessionId");
        assert_eq!(err.to_string(), "missing envelope field `sessionId`");
    }
}
