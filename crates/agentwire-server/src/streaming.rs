//! Streaming response coordination in both directions.
//!
//! Inbound streams (client → server) are assembled per connection with the
//! shared [`StreamAssembler`]. Outbound replies from the reasoning service are
//! framed by [`StreamingCoordinator::dispatch`] as `streaming_start`, ordered
//! chunks, and exactly one `streaming_end`.

use std::time::Duration;

use agentwire_core::message::{
    CompletionReason, ResponsePayload, StreamingChunkPayload, StreamingEndPayload,
    StreamingStartPayload,
};
use agentwire_core::{
    ConnectionId, ErrorCode, Message, MessageId, Payload, ResponseId, StreamAssembler, StreamError,
    StreamOutcome,
};
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::{STREAMS_ENDED_TOTAL, STREAMS_STARTED_TOTAL};
use crate::reasoning::{ReasoningError, Reply};
use crate::websocket::connection::{Connection, SendError};

/// How an outbound dispatch ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A single `response` was sent.
    Single,
    /// Stream ended `complete` after this many chunks.
    Completed {
        /// Chunks sent.
        chunks: usize,
    },
    /// The reasoning service failed mid-stream; ended with `error`.
    Failed,
    /// The stream ran past the timeout; ended with `error`.
    TimedOut,
    /// The connection closed; nothing more was sent.
    Aborted,
}

impl DispatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Completed { .. } => "complete",
            Self::Failed => "error",
            Self::TimedOut => "timeout",
            Self::Aborted => "aborted",
        }
    }
}

/// Owns inbound stream state and frames outbound replies.
pub struct StreamingCoordinator {
    inbound: DashMap<ConnectionId, Mutex<StreamAssembler>>,
    timeout: Duration,
    max_buffer_bytes: usize,
}

impl StreamingCoordinator {
    /// Create a coordinator with the stream timeout and inbound buffer cap.
    pub fn new(timeout: Duration, max_buffer_bytes: usize) -> Self {
        Self {
            inbound: DashMap::new(),
            timeout,
            max_buffer_bytes,
        }
    }

    /// Stream timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Handle an inbound `streaming_start`.
    pub fn start(
        &self,
        conn: &ConnectionId,
        start: &StreamingStartPayload,
    ) -> Result<(), StreamError> {
        let entry = self.inbound.entry(conn.clone()).or_insert_with(|| {
            Mutex::new(StreamAssembler::new(self.timeout, self.max_buffer_bytes))
        });
        entry.lock().start(start, now())?;
        counter!(STREAMS_STARTED_TOTAL, "direction" => "inbound").increment(1);
        Ok(())
    }

    /// Handle an inbound `streaming_chunk`.
    pub fn append(
        &self,
        conn: &ConnectionId,
        chunk: &StreamingChunkPayload,
    ) -> Result<(), StreamError> {
        let entry = self
            .inbound
            .get(conn)
            .ok_or_else(|| StreamError::UnknownResponse(chunk.response_id.clone()))?;
        entry.lock().append(chunk)
    }

    /// Handle an inbound `streaming_end`.
    pub fn finish(
        &self,
        conn: &ConnectionId,
        end: &StreamingEndPayload,
    ) -> Result<StreamOutcome, StreamError> {
        let entry = self
            .inbound
            .get(conn)
            .ok_or_else(|| StreamError::UnknownResponse(end.response_id.clone()))?;
        let outcome = entry.lock().finish(end, now())?;
        let reason = match &outcome {
            StreamOutcome::Completed(_) => "complete",
            StreamOutcome::Cancelled { .. } => "cancelled",
            StreamOutcome::Errored { .. } => "error",
        };
        counter!(STREAMS_ENDED_TOTAL, "direction" => "inbound", "reason" => reason).increment(1);
        Ok(outcome)
    }

    /// Fail inbound streams past the timeout and drop old tombstones.
    /// Returns the streams that timed out.
    pub fn expire(&self) -> Vec<(ConnectionId, ResponseId)> {
        let now = now();
        let mut expired = Vec::new();
        for entry in &self.inbound {
            for id in entry.value().lock().expire(now) {
                expired.push((entry.key().clone(), id));
            }
        }
        for _ in &expired {
            counter!(STREAMS_ENDED_TOTAL, "direction" => "inbound", "reason" => "timeout")
                .increment(1);
        }
        self.inbound.retain(|_, a| !a.get_mut().is_empty());
        expired
    }

    /// Drop every inbound record for a closed connection. Returns how many
    /// streams were still open.
    pub fn release_connection(&self, conn: &ConnectionId) -> usize {
        self.inbound
            .remove(conn)
            .map_or(0, |(_, assembler)| assembler.into_inner().release())
    }

    /// Inbound streams currently open across all connections.
    pub fn open_streams(&self) -> usize {
        self.inbound.iter().map(|e| e.value().lock().active()).sum()
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Send `reply` to `conn`. Streams get a fresh `responseId`, chunks in
    /// order (the last flagged `isFinal`), and exactly one `streaming_end`.
    /// Stops without further frames once the connection closes.
    pub async fn dispatch(
        &self,
        conn: &Connection,
        reply: Reply,
        in_reply_to: Option<MessageId>,
    ) -> DispatchOutcome {
        let outcome = match reply {
            Reply::Single(mut payload) => {
                if payload.in_reply_to.is_none() {
                    payload.in_reply_to = in_reply_to;
                }
                match conn.send_message(Message::new(Payload::Response(payload))) {
                    Ok(()) => DispatchOutcome::Single,
                    Err(_) => DispatchOutcome::Aborted,
                }
            }
            Reply::Stream {
                content_type,
                expected_length,
                chunks,
            } => {
                self.dispatch_stream(conn, content_type, expected_length, chunks, in_reply_to)
                    .await
            }
        };
        debug!(conn_id = %conn.id, outcome = outcome.label(), "reply dispatched");
        outcome
    }

    async fn dispatch_stream(
        &self,
        conn: &Connection,
        content_type: String,
        expected_length: Option<u64>,
        mut chunks: BoxStream<'static, Result<String, ReasoningError>>,
        in_reply_to: Option<MessageId>,
    ) -> DispatchOutcome {
        let response_id = ResponseId::new();
        let cancel = conn.cancel_token();
        let start = Payload::StreamingStart(StreamingStartPayload {
            response_id: response_id.clone(),
            content_type,
            expected_length,
            in_reply_to: in_reply_to.clone(),
        });
        if conn.send_message(Message::new(start)).is_err() {
            return DispatchOutcome::Aborted;
        }
        counter!(STREAMS_STARTED_TOTAL, "direction" => "outbound").increment(1);

        let deadline = tokio::time::sleep_until(Instant::now() + self.timeout);
        tokio::pin!(deadline);
        let mut pending: Option<String> = None;
        let mut sent = 0usize;

        let outcome = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break DispatchOutcome::Aborted,
                () = &mut deadline => {
                    warn!(conn_id = %conn.id, %response_id, "outbound stream timed out");
                    let _ = send_end(conn, &response_id, CompletionReason::Error, Some("timeout"));
                    break DispatchOutcome::TimedOut;
                }
                item = chunks.next() => item,
            };
            match next {
                Some(Ok(content)) => {
                    if let Some(previous) = pending.replace(content) {
                        if send_chunk(conn, &response_id, previous, false).is_err() {
                            break DispatchOutcome::Aborted;
                        }
                        sent += 1;
                    }
                }
                Some(Err(error)) => {
                    warn!(conn_id = %conn.id, %response_id, %error, "reasoning stream failed");
                    let _ = send_end(conn, &response_id, CompletionReason::Error, None);
                    let mut message = Message::error(ErrorCode::InternalError, "Internal error");
                    if let Payload::Error(ref mut p) = message.payload {
                        p.in_reply_to = in_reply_to;
                    }
                    let _ = conn.send_message(message);
                    break DispatchOutcome::Failed;
                }
                None => {
                    if let Some(last) = pending.take() {
                        if send_chunk(conn, &response_id, last, true).is_err() {
                            break DispatchOutcome::Aborted;
                        }
                        sent += 1;
                    }
                    if send_end(conn, &response_id, CompletionReason::Complete, None).is_err() {
                        break DispatchOutcome::Aborted;
                    }
                    break DispatchOutcome::Completed { chunks: sent };
                }
            }
        };
        counter!(STREAMS_ENDED_TOTAL, "direction" => "outbound", "reason" => outcome.label())
            .increment(1);
        outcome
    }

    /// Send a single response outside of a reasoning reply.
    pub fn respond(
        conn: &Connection,
        content: impl Into<String>,
        in_reply_to: Option<MessageId>,
    ) -> Result<(), SendError> {
        conn.send_message(Message::new(Payload::Response(ResponsePayload {
            content: content.into(),
            content_type: Some("text/plain".into()),
            in_reply_to,
            data: None,
        })))
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

fn send_chunk(
    conn: &Connection,
    response_id: &ResponseId,
    content: String,
    is_final: bool,
) -> Result<(), SendError> {
    conn.send_message(Message::new(Payload::StreamingChunk(StreamingChunkPayload {
        response_id: response_id.clone(),
        content,
        is_final,
    })))
}

fn send_end(
    conn: &Connection,
    response_id: &ResponseId,
    completion_reason: CompletionReason,
    error: Option<&str>,
) -> Result<(), SendError> {
    conn.send_message(Message::new(Payload::StreamingEnd(StreamingEndPayload {
        response_id: response_id.clone(),
        completion_reason,
        error: error.map(str::to_owned),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ConnectionInfo;
    use agentwire_core::{Role, SessionId, decode};
    use assert_matches::assert_matches;
    use futures::stream;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn connection() -> (Connection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Connection::new(
            ConnectionInfo {
                remote_addr: "127.0.0.1:7000".parse().unwrap(),
                user_agent: None,
            },
            tx,
        );
        conn.authenticate("u1".into(), SessionId::from("sess_s"));
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Payload> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(decode(frame.as_bytes(), Role::Client).unwrap().payload);
        }
        out
    }

    fn coordinator() -> StreamingCoordinator {
        StreamingCoordinator::new(Duration::from_secs(60), 1024)
    }

    fn chunks(items: Vec<Result<String, ReasoningError>>) -> Reply {
        Reply::Stream {
            content_type: "text/plain".into(),
            expected_length: None,
            chunks: stream::iter(items).boxed(),
        }
    }

    #[tokio::test]
    async fn stream_frames_in_order_with_final_flag() {
        let (conn, mut rx) = connection();
        let reply = chunks(vec![Ok("Hel".into()), Ok("lo".into())]);
        let outcome = coordinator()
            .dispatch(&conn, reply, Some(MessageId::from("q1")))
            .await;
        assert_eq!(outcome, DispatchOutcome::Completed { chunks: 2 });

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 4);
        let id = assert_matches!(&frames[0], Payload::StreamingStart(p) => {
            assert_eq!(p.in_reply_to.as_ref().map(MessageId::as_str), Some("q1"));
            p.response_id.clone()
        });
        assert_matches!(&frames[1], Payload::StreamingChunk(c)
            if c.content == "Hel" && !c.is_final && c.response_id == id);
        assert_matches!(&frames[2], Payload::StreamingChunk(c) if c.content == "lo" && c.is_final);
        assert_matches!(&frames[3], Payload::StreamingEnd(e)
            if e.completion_reason == CompletionReason::Complete && e.response_id == id);
    }

    #[tokio::test]
    async fn empty_stream_still_ends_once() {
        let (conn, mut rx) = connection();
        let outcome = coordinator().dispatch(&conn, chunks(vec![]), None).await;
        assert_eq!(outcome, DispatchOutcome::Completed { chunks: 0 });
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_matches!(&frames[1], Payload::StreamingEnd(_));
    }

    #[tokio::test]
    async fn collaborator_error_ends_with_error_and_internal_error_frame() {
        let (conn, mut rx) = connection();
        let reply = chunks(vec![
            Ok("partial".into()),
            Err(ReasoningError::Failed("db down at 10.0.0.3".into())),
        ]);
        let outcome = coordinator().dispatch(&conn, reply, None).await;
        assert_eq!(outcome, DispatchOutcome::Failed);
        let frames = drain(&mut rx);
        // start, end{error}, error; the pending chunk is never sent.
        assert_eq!(frames.len(), 3);
        assert_matches!(&frames[1], Payload::StreamingEnd(e)
            if e.completion_reason == CompletionReason::Error);
        assert_matches!(&frames[2], Payload::Error(p)
            if p.code == ErrorCode::InternalError && !p.message.contains("10.0.0.3"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out() {
        let (conn, mut rx) = connection();
        let reply = Reply::Stream {
            content_type: "text/plain".into(),
            expected_length: None,
            chunks: stream::pending().boxed(),
        };
        let outcome = coordinator().dispatch(&conn, reply, None).await;
        assert_eq!(outcome, DispatchOutcome::TimedOut);
        let frames = drain(&mut rx);
        assert_matches!(frames.last(), Some(Payload::StreamingEnd(e))
            if e.completion_reason == CompletionReason::Error);
    }

    #[tokio::test]
    async fn closed_connection_aborts_dispatch() {
        let (conn, mut rx) = connection();
        let _ = conn.close(crate::websocket::connection::CloseReason::ClientClosed);
        let outcome = coordinator()
            .dispatch(&conn, chunks(vec![Ok("x".into())]), None)
            .await;
        assert_eq!(outcome, DispatchOutcome::Aborted);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn single_reply_inherits_in_reply_to() {
        let (conn, mut rx) = connection();
        let reply = Reply::Single(ResponsePayload {
            content: "ok".into(),
            content_type: None,
            in_reply_to: None,
            data: None,
        });
        let outcome = coordinator()
            .dispatch(&conn, reply, Some(MessageId::from("q9")))
            .await;
        assert_eq!(outcome, DispatchOutcome::Single);
        assert_matches!(&drain(&mut rx)[0], Payload::Response(p)
            if p.in_reply_to.as_ref().map(MessageId::as_str) == Some("q9"));
    }

    fn start(id: &str) -> StreamingStartPayload {
        StreamingStartPayload {
            response_id: ResponseId::from(id),
            content_type: "text/plain".into(),
            expected_length: None,
            in_reply_to: None,
        }
    }

    fn chunk(id: &str, content: &str) -> StreamingChunkPayload {
        StreamingChunkPayload {
            response_id: ResponseId::from(id),
            content: content.into(),
            is_final: false,
        }
    }

    fn end(id: &str, completion_reason: CompletionReason) -> StreamingEndPayload {
        StreamingEndPayload {
            response_id: ResponseId::from(id),
            completion_reason,
            error: None,
        }
    }

    #[test]
    fn inbound_stream_assembles_per_connection() {
        let coord = coordinator();
        let a = ConnectionId::from("conn_a");
        let b = ConnectionId::from("conn_b");
        coord.start(&a, &start("r1")).unwrap();
        coord.start(&b, &start("r1")).unwrap();
        coord.append(&a, &chunk("r1", "foo")).unwrap();
        coord.append(&a, &chunk("r1", "bar")).unwrap();
        assert_eq!(coord.open_streams(), 2);
        let outcome = coord.finish(&a, &end("r1", CompletionReason::Complete)).unwrap();
        assert_matches!(outcome, StreamOutcome::Completed(r) if r.content == "foobar");
        assert_matches!(
            coord.finish(&a, &end("r1", CompletionReason::Complete)),
            Err(StreamError::DuplicateEnd(_))
        );
        assert_eq!(coord.release_connection(&b), 1);
        assert_eq!(coord.open_streams(), 0);
    }

    #[test]
    fn inbound_chunk_without_start_is_violation() {
        let coord = coordinator();
        let err = coord
            .append(&ConnectionId::from("conn_z"), &chunk("r1", "x"))
            .unwrap_err();
        assert_matches!(err, StreamError::UnknownResponse(_));
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_streams_expire_as_errors() {
        let coord = coordinator();
        let a = ConnectionId::from("conn_a");
        coord.start(&a, &start("slow")).unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let expired = coord.expire();
        assert_eq!(expired, vec![(a.clone(), ResponseId::from("slow"))]);
        assert_eq!(coord.open_streams(), 0);
        // Tombstone is gone after another timeout period.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(coord.expire().is_empty());
        assert_eq!(coord.release_connection(&a), 0);
    }
}
