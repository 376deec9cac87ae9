//! Reassembly of chunked responses.
//!
//! Shared by the server (client-originated streams) and the client driver
//! (server replies). Each `responseId` walks
//! `Started → Receiving → Completed | Cancelled | Errored`. Terminal records
//! stay behind as tombstones for one timeout period so that a late duplicate
//! `streaming_end` or chunk is still recognized as a protocol violation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::errors::ErrorCode;
use crate::ids::{MessageId, ResponseId};
use crate::message::{
    CompletionReason, StreamingChunkPayload, StreamingEndPayload, StreamingStartPayload,
};

/// Lifecycle state of one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// `streaming_start` seen, no chunks yet.
    Started,
    /// At least one chunk received.
    Receiving,
    /// Ended with `complete`.
    Completed,
    /// Ended with `cancelled`.
    Cancelled,
    /// Ended with `error`, or timed out.
    Errored,
}

impl StreamState {
    /// Whether no further frames are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Errored)
    }
}

/// A fully delivered response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledResponse {
    /// Stream identifier.
    pub response_id: ResponseId,
    /// Declared MIME type.
    pub content_type: String,
    /// Concatenated chunks in arrival order.
    pub content: String,
    /// Message the stream answers, if declared at start.
    pub in_reply_to: Option<MessageId>,
    /// Number of chunks received.
    pub chunk_count: usize,
}

/// Result of a `streaming_end`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Content is valid and delivered.
    Completed(AssembledResponse),
    /// Producer cancelled; content discarded.
    Cancelled {
        /// Stream identifier.
        response_id: ResponseId,
    },
    /// Producer failed; content discarded.
    Errored {
        /// Stream identifier.
        response_id: ResponseId,
        /// Producer-supplied description.
        error: Option<String>,
    },
}

/// Ordering violations detected by the assembler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Chunk or end for a stream that was never started.
    #[error("no stream with responseId `{0}`")]
    UnknownResponse(ResponseId),
    /// Second `streaming_start` for the same ID.
    #[error("stream `{0}` already started")]
    DuplicateStart(ResponseId),
    /// Chunk after the stream ended.
    #[error("chunk for stream `{0}` after it ended")]
    ChunkAfterEnd(ResponseId),
    /// Second `streaming_end`.
    #[error("stream `{0}` already ended")]
    DuplicateEnd(ResponseId),
    /// Buffered content would exceed the per-stream limit.
    #[error("stream `{response_id}` exceeds the {limit} byte buffer limit")]
    BufferExceeded {
        /// Stream identifier.
        response_id: ResponseId,
        /// Configured limit.
        limit: usize,
    },
}

impl StreamError {
    /// Wire code for this violation.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ProtocolViolation
    }
}

#[derive(Debug)]
struct StreamRecord {
    content_type: String,
    in_reply_to: Option<MessageId>,
    buffer: String,
    chunks: usize,
    state: StreamState,
    started_at: Instant,
    ended_at: Option<Instant>,
}

/// Tracks in-flight streams for one connection.
#[derive(Debug)]
pub struct StreamAssembler {
    timeout: Duration,
    max_buffer_bytes: usize,
    records: HashMap<ResponseId, StreamRecord>,
}

impl StreamAssembler {
    /// Create an assembler with the given stream timeout and buffer cap.
    pub fn new(timeout: Duration, max_buffer_bytes: usize) -> Self {
        Self {
            timeout,
            max_buffer_bytes,
            records: HashMap::new(),
        }
    }

    /// Handle `streaming_start`.
    pub fn start(&mut self, start: &StreamingStartPayload, now: Instant) -> Result<(), StreamError> {
        if self.records.contains_key(start.response_id.as_str()) {
            return Err(StreamError::DuplicateStart(start.response_id.clone()));
        }
        let _ = self.records.insert(
            start.response_id.clone(),
            StreamRecord {
                content_type: start.content_type.clone(),
                in_reply_to: start.in_reply_to.clone(),
                buffer: String::new(),
                chunks: 0,
                state: StreamState::Started,
                started_at: now,
                ended_at: None,
            },
        );
        Ok(())
    }

    /// Handle `streaming_chunk`. `isFinal` is ignored; only the end frame
    /// terminates a stream.
    pub fn append(&mut self, chunk: &StreamingChunkPayload) -> Result<(), StreamError> {
        let id = &chunk.response_id;
        let record = self
            .records
            .get_mut(id.as_str())
            .ok_or_else(|| StreamError::UnknownResponse(id.clone()))?;
        if record.state.is_terminal() {
            return Err(StreamError::ChunkAfterEnd(id.clone()));
        }
        if record.buffer.len() + chunk.content.len() > self.max_buffer_bytes {
            return Err(StreamError::BufferExceeded {
                response_id: id.clone(),
                limit: self.max_buffer_bytes,
            });
        }
        record.buffer.push_str(&chunk.content);
        record.chunks += 1;
        record.state = StreamState::Receiving;
        Ok(())
    }

    /// Handle `streaming_end`. The completion reason alone decides whether
    /// content is delivered.
    pub fn finish(
        &mut self,
        end: &StreamingEndPayload,
        now: Instant,
    ) -> Result<StreamOutcome, StreamError> {
        let id = &end.response_id;
        let record = self
            .records
            .get_mut(id.as_str())
            .ok_or_else(|| StreamError::UnknownResponse(id.clone()))?;
        if record.state.is_terminal() {
            return Err(StreamError::DuplicateEnd(id.clone()));
        }
        record.ended_at = Some(now);
        let content = std::mem::take(&mut record.buffer);
        Ok(match end.completion_reason {
            CompletionReason::Complete => {
                record.state = StreamState::Completed;
                StreamOutcome::Completed(AssembledResponse {
                    response_id: id.clone(),
                    content_type: record.content_type.clone(),
                    content,
                    in_reply_to: record.in_reply_to.clone(),
                    chunk_count: record.chunks,
                })
            }
            CompletionReason::Cancelled => {
                record.state = StreamState::Cancelled;
                StreamOutcome::Cancelled {
                    response_id: id.clone(),
                }
            }
            CompletionReason::Error => {
                record.state = StreamState::Errored;
                StreamOutcome::Errored {
                    response_id: id.clone(),
                    error: end.error.clone(),
                }
            }
        })
    }

    /// Time out open streams older than the timeout (they become `Errored`
    /// tombstones) and drop tombstones past their retention. Returns the IDs
    /// that timed out on this call.
    pub fn expire(&mut self, now: Instant) -> Vec<ResponseId> {
        let timeout = self.timeout;
        let mut timed_out = Vec::new();
        for (id, record) in &mut self.records {
            if !record.state.is_terminal()
                && now.saturating_duration_since(record.started_at) >= timeout
            {
                record.state = StreamState::Errored;
                record.ended_at = Some(now);
                record.buffer.clear();
                timed_out.push(id.clone());
            }
        }
        self.records.retain(|_, r| {
            r.ended_at
                .is_none_or(|ended| now.saturating_duration_since(ended) < timeout)
        });
        timed_out
    }

    /// State of a stream, if it is tracked (including tombstones).
    pub fn state(&self, response_id: &str) -> Option<StreamState> {
        self.records.get(response_id).map(|r| r.state)
    }

    /// Number of streams still open.
    pub fn active(&self) -> usize {
        self.records.values().filter(|r| !r.state.is_terminal()).count()
    }

    /// Whether no records (open or tombstoned) are held.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record; returns how many streams were still open.
    pub fn release(&mut self) -> usize {
        let open = self.active();
        self.records.clear();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn start(id: &str) -> StreamingStartPayload {
        StreamingStartPayload {
            response_id: id.into(),
            content_type: "text/plain".into(),
            expected_length: None,
            in_reply_to: Some("q1".into()),
        }
    }

    fn chunk(id: &str, content: &str, is_final: bool) -> StreamingChunkPayload {
        StreamingChunkPayload {
            response_id: id.into(),
            content: content.into(),
            is_final,
        }
    }

    fn end(id: &str, reason: CompletionReason) -> StreamingEndPayload {
        StreamingEndPayload {
            response_id: id.into(),
            completion_reason: reason,
            error: None,
        }
    }

    fn assembler() -> StreamAssembler {
        StreamAssembler::new(TIMEOUT, 1024)
    }

    #[test]
    fn chunks_concatenate_in_order() {
        let mut a = assembler();
        let now = Instant::now();
        a.start(&start("r1"), now).unwrap();
        a.append(&chunk("r1", "Hello, ", false)).unwrap();
        assert_eq!(a.state("r1"), Some(StreamState::Receiving));
        a.append(&chunk("r1", "world", true)).unwrap();
        let out = a.finish(&end("r1", CompletionReason::Complete), now).unwrap();
        assert_matches!(out, StreamOutcome::Completed(resp) => {
            assert_eq!(resp.content, "Hello, world");
            assert_eq!(resp.chunk_count, 2);
            assert_eq!(resp.in_reply_to.as_deref(), Some("q1"));
        });
    }

    #[test]
    fn is_final_does_not_terminate() {
        let mut a = assembler();
        let now = Instant::now();
        a.start(&start("r1"), now).unwrap();
        a.append(&chunk("r1", "a", true)).unwrap();
        a.append(&chunk("r1", "b", false)).unwrap();
        assert_eq!(a.active(), 1);
    }

    #[test]
    fn cancelled_and_errored_discard_content() {
        let mut a = assembler();
        let now = Instant::now();
        a.start(&start("r1"), now).unwrap();
        a.append(&chunk("r1", "partial", false)).unwrap();
        assert_matches!(
            a.finish(&end("r1", CompletionReason::Cancelled), now),
            Ok(StreamOutcome::Cancelled { .. })
        );
        a.start(&start("r2"), now).unwrap();
        assert_matches!(
            a.finish(&end("r2", CompletionReason::Error), now),
            Ok(StreamOutcome::Errored { .. })
        );
    }

    #[test]
    fn ordering_violations() {
        let mut a = assembler();
        let now = Instant::now();
        assert_matches!(
            a.append(&chunk("nope", "x", false)),
            Err(StreamError::UnknownResponse(_))
        );
        a.start(&start("r1"), now).unwrap();
        assert_matches!(a.start(&start("r1"), now), Err(StreamError::DuplicateStart(_)));
        let _ = a.finish(&end("r1", CompletionReason::Complete), now).unwrap();
        assert_matches!(
            a.append(&chunk("r1", "late", false)),
            Err(StreamError::ChunkAfterEnd(_))
        );
        let err = a.finish(&end("r1", CompletionReason::Complete), now).unwrap_err();
        assert_matches!(err, StreamError::DuplicateEnd(_));
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn buffer_limit_enforced() {
        let mut a = StreamAssembler::new(TIMEOUT, 4);
        a.start(&start("r1"), Instant::now()).unwrap();
        a.append(&chunk("r1", "abcd", false)).unwrap();
        assert_matches!(
            a.append(&chunk("r1", "e", false)),
            Err(StreamError::BufferExceeded { limit: 4, .. })
        );
    }

    #[test]
    fn timeout_errors_open_streams_then_forgets_tombstones() {
        let mut a = assembler();
        let t0 = Instant::now();
        a.start(&start("r1"), t0).unwrap();
        assert!(a.expire(t0 + Duration::from_secs(59)).is_empty());
        let expired = a.expire(t0 + TIMEOUT);
        assert_eq!(expired, vec![ResponseId::from("r1")]);
        assert_eq!(a.state("r1"), Some(StreamState::Errored));
        assert_matches!(
            a.finish(&end("r1", CompletionReason::Complete), t0 + TIMEOUT),
            Err(StreamError::DuplicateEnd(_))
        );
        let _ = a.expire(t0 + TIMEOUT * 2);
        assert_eq!(a.state("r1"), None);
    }

    #[test]
    fn release_reports_open_streams() {
        let mut a = assembler();
        let now = Instant::now();
        a.start(&start("r1"), now).unwrap();
        a.start(&start("r2"), now).unwrap();
        let _ = a.finish(&end("r2", CompletionReason::Complete), now).unwrap();
        assert_eq!(a.release(), 1);
        assert_eq!(a.state("r2"), None);
    }
}
