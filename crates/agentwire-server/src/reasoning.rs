//! Reasoning collaborator interface.
//!
//! The server never answers queries itself; it hands each admitted query to
//! a [`ReasoningService`] and relays the reply, either as one `response` or
//! as a stream of chunks.

use agentwire_core::message::ResponsePayload;
use agentwire_core::{MessageId, SessionId};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};

/// A query handed to the reasoning service.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    /// Session the query arrived on.
    pub session_id: SessionId,
    /// Authenticated user.
    pub user_id: String,
    /// ID of the originating `query` message (or stream).
    pub message_id: MessageId,
    /// Query text.
    pub query: String,
    /// Per-query context from the payload.
    pub context: Option<Value>,
    /// Context accumulated on the session.
    pub session_context: Map<String, Value>,
}

/// Reply produced by the reasoning service.
pub enum Reply {
    /// A single `response`.
    Single(ResponsePayload),
    /// A streamed reply; each item becomes a `streaming_chunk`.
    Stream {
        /// MIME type announced in `streaming_start`.
        content_type: String,
        /// Advisory total length.
        expected_length: Option<u64>,
        /// Chunk contents in order. An `Err` ends the stream with `error`.
        chunks: BoxStream<'static, Result<String, ReasoningError>>,
    },
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single(p) => f.debug_tuple("Single").field(p).finish(),
            Self::Stream { content_type, .. } => f
                .debug_struct("Stream")
                .field("content_type", content_type)
                .finish_non_exhaustive(),
        }
    }
}

/// Reasoning failures. Details are logged, never sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    /// The service cannot take requests right now.
    #[error("reasoning service unavailable: {0}")]
    Unavailable(String),
    /// The request failed.
    #[error("reasoning failed: {0}")]
    Failed(String),
}

/// Answers queries.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Produce a reply for `request`.
    async fn respond(&self, request: QueryRequest) -> Result<Reply, ReasoningError>;

    /// Rate-limit cost of a query. Defaults to 1.
    fn query_cost(&self, _query: &str) -> u32 {
        1
    }
}

/// Replies `Received: <query>`; long replies are streamed in fixed-size
/// chunks. Used by the binary when no real backend is attached.
#[derive(Clone, Debug)]
pub struct AcknowledgingReasoner {
    chunk_chars: usize,
}

impl AcknowledgingReasoner {
    /// Replies longer than `chunk_chars` characters are streamed.
    pub fn new(chunk_chars: usize) -> Self {
        Self {
            chunk_chars: chunk_chars.max(1),
        }
    }
}

impl Default for AcknowledgingReasoner {
    fn default() -> Self {
        Self::new(256)
    }
}

fn split_chars(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[async_trait]
impl ReasoningService for AcknowledgingReasoner {
    async fn respond(&self, request: QueryRequest) -> Result<Reply, ReasoningError> {
        let content = format!("Received: {}", request.query);
        if content.chars().count() <= self.chunk_chars {
            return Ok(Reply::Single(ResponsePayload {
                content,
                content_type: Some("text/plain".into()),
                in_reply_to: Some(request.message_id),
                data: None,
            }));
        }
        let expected_length = Some(content.len() as u64);
        let chunks = split_chars(&content, self.chunk_chars);
        Ok(Reply::Stream {
            content_type: "text/plain".into(),
            expected_length,
            chunks: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        })
    }

    fn query_cost(&self, query: &str) -> u32 {
        // One unit per started kilobyte of query text.
        u32::try_from(query.len() / 1024 + 1).unwrap_or(u32::MAX)
    }
}
