//! # agentwire-core
//!
//! Shared vocabulary for the agentwire protocol, used by both the server and
//! the client driver:
//!
//! - **Branded IDs**: `MessageId`, `SessionId`, `ConnectionId`, `ResponseId`
//! - **Messages**: `Message` envelope around the exhaustive `Payload` enum
//! - **Codec**: decode/encode with structural, schema, size and freshness checks
//! - **Dedup**: per-connection sliding window over envelope IDs
//! - **Streams**: `StreamAssembler` for chunked responses
//! - **Errors**: wire `ErrorCode`s and `CodecError`
//! - **Retry**: reconnection backoff math
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod codec;
pub mod dedup;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod message;
pub mod retry;
pub mod stream;

pub use codec::{Decoder, Role, ValidationPolicy, decode, encode, peek_id};
pub use dedup::DedupWindow;
pub use errors::{CodecError, ErrorCode};
pub use ids::{ConnectionId, MessageId, ResponseId, SessionId};
pub use message::{Message, MessageKind, Metadata, Payload};
pub use stream::{AssembledResponse, StreamAssembler, StreamError, StreamOutcome, StreamState};

/// Protocol versions this build understands, most preferred first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["1.0"];
