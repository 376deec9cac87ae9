//! Reconnecting protocol driver.
//!
//! [`ClientDriver::spawn`] runs one background task that owns the transport.
//! The application talks to it through a [`ClientHandle`] (submit, state,
//! shutdown) and receives [`ClientEvent`]s on an unbounded channel.
//!
//! Each connection attempt goes `Connecting → Handshaking → Connected`. A
//! drop after `Connected` emits one `Disconnected` event and restarts the
//! backoff schedule; connect or handshake failures consume attempts. An
//! `AUTHENTICATION_FAILED` error is terminal.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agentwire_core::message::{
    ErrorPayload, HelloPayload, QueryPayload, ResponsePayload, SessionUpdatePayload,
};
use agentwire_core::retry::{Backoff, BackoffConfig};
use agentwire_core::{
    ErrorCode, Message, MessageId, Payload, ResponseId, Role, SessionId, StreamAssembler,
    StreamError, StreamOutcome, decode, encode,
};
use agentwire_settings::ClientSettings;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ClientError;
use crate::queue::OutboundQueue;
use crate::state::{ConnectionState, FailureReason};
use crate::transport::{Connector, FrameTransport};

/// Inbound streams older than this are dropped.
const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(60);
/// Largest reassembled response accepted.
const DEFAULT_MAX_STREAM_BYTES: usize = 16 * 1024 * 1024;

/// Runtime configuration for the driver.
#[derive(Clone)]
pub struct DriverConfig {
    /// Server endpoint (`ws://…`).
    pub url: String,
    /// Bearer token sent in every `hello`.
    pub token: String,
    /// Protocol version offered.
    pub protocol_version: String,
    /// Name reported in `hello`.
    pub client_name: Option<String>,
    /// Outbound queue bound.
    pub queue_capacity: usize,
    /// Time allowed for the `hello` reply.
    pub handshake_timeout: Duration,
    /// Reconnect schedule.
    pub backoff: BackoffConfig,
    /// Inbound stream timeout.
    pub stream_timeout: Duration,
    /// Inbound stream size cap.
    pub max_stream_bytes: usize,
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("protocol_version", &self.protocol_version)
            .field("client_name", &self.client_name)
            .field("queue_capacity", &self.queue_capacity)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl DriverConfig {
    /// Defaults for `url` with `token`.
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        let defaults = ClientSettings::default();
        Self {
            url: url.into(),
            token: token.into(),
            ..Self::with_settings(&defaults, String::new())
        }
    }

    /// Build from loaded settings. The token is required.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ClientError> {
        let token = settings
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ClientError::MissingToken)?;
        Ok(Self::with_settings(settings, token))
    }

    fn with_settings(settings: &ClientSettings, token: String) -> Self {
        Self {
            url: settings.url.clone(),
            token,
            protocol_version: settings.protocol_version.clone(),
            client_name: Some(settings.client_name.clone()).filter(|n| !n.is_empty()),
            queue_capacity: settings.queue_capacity,
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
            backoff: settings.reconnect.clone(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            max_stream_bytes: DEFAULT_MAX_STREAM_BYTES,
        }
    }
}

/// Something the application should know about.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// Handshake completed.
    Connected {
        /// Session in effect.
        session_id: SessionId,
        /// Whether the server resumed the previous session.
        resumed: bool,
    },
    /// An established connection dropped. Emitted once per drop.
    Disconnected {
        /// Human-readable cause.
        reason: String,
    },
    /// A complete response, single-frame or reassembled from a stream.
    Response(ResponsePayload),
    /// A stream ended cancelled, errored, or timed out; its content is discarded.
    StreamFailed {
        /// Stream identifier.
        response_id: ResponseId,
        /// Why it failed.
        reason: String,
    },
    /// A non-terminal error reported by the server.
    ServerError(ErrorPayload),
    /// Subscription or expiry update.
    SessionUpdate(SessionUpdatePayload),
}

/// Application-side handle to a running driver.
pub struct ClientHandle {
    queue: Arc<OutboundQueue>,
    state: watch::Receiver<ConnectionState>,
    session: Arc<Mutex<Option<SessionId>>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Queue `payload` for delivery. Returns the message ID, or an error
    /// right away if the queue is full or the driver has stopped.
    pub fn submit(&self, payload: Payload) -> Result<MessageId, ClientError> {
        if self.state.borrow().is_terminal() {
            return Err(ClientError::Stopped);
        }
        let message = Message::new(payload);
        let id = message.id.clone();
        self.queue.push(message)?;
        Ok(id)
    }

    /// Queue a `query`.
    pub fn query(&self, text: impl Into<String>) -> Result<MessageId, ClientError> {
        self.submit(Payload::Query(QueryPayload {
            query: text.into(),
            context: None,
        }))
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Session retained across reconnects, once one was issued.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.lock().clone()
    }

    /// Messages waiting for a connection.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Wait until connected. Fails if the driver stops first.
    pub async fn connected(&self) -> Result<(), ClientError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| s.is_connected() || s.is_terminal())
            .await
            .map_err(|_| ClientError::Stopped)?
            .clone();
        if state.is_connected() {
            Ok(())
        } else {
            Err(ClientError::Stopped)
        }
    }

    /// Stop the driver, closing the transport and cancelling any backoff
    /// sleep. Returns the final state.
    pub async fn shutdown(self) -> ConnectionState {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "client driver task failed");
        }
        self.state.borrow().clone()
    }
}

/// How one connection attempt ended.
enum SessionEnd {
    Cancelled,
    AuthFailed(String),
    Dropped { reason: String, connected: bool },
}

impl SessionEnd {
    fn dropped(reason: impl Into<String>, connected: bool) -> Self {
        Self::Dropped {
            reason: reason.into(),
            connected,
        }
    }
}

/// The background reconnection loop.
pub struct ClientDriver {
    config: DriverConfig,
    connector: Arc<dyn Connector>,
    queue: Arc<OutboundQueue>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    session: Arc<Mutex<Option<SessionId>>>,
    cancel: CancellationToken,
}

impl ClientDriver {
    /// Start the driver on the current runtime.
    pub fn spawn(
        config: DriverConfig,
        connector: Arc<dyn Connector>,
    ) -> (ClientHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let queue = Arc::new(OutboundQueue::new(config.queue_capacity));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let driver = Self {
            config,
            connector,
            queue: Arc::clone(&queue),
            state: state_tx,
            events: events_tx,
            session: Arc::clone(&session),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run());
        let handle = ClientHandle {
            queue,
            state: state_rx,
            session,
            cancel,
            task,
        };
        (handle, events_rx)
    }

    #[instrument(skip_all, fields(url = %self.config.url))]
    async fn run(self) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            match self.connect_once().await {
                SessionEnd::Cancelled => {
                    self.set_state(ConnectionState::Closed);
                    return;
                }
                SessionEnd::AuthFailed(reason) => {
                    warn!(%reason, "authentication rejected, not retrying");
                    self.set_state(ConnectionState::Failed(FailureReason::AuthenticationFailed(
                        reason,
                    )));
                    return;
                }
                SessionEnd::Dropped { reason, connected } => {
                    if connected {
                        self.emit(ClientEvent::Disconnected {
                            reason: reason.clone(),
                        });
                        backoff.reset();
                    }
                    let Some(delay) = backoff.next_delay(rand::random::<f64>()) else {
                        let attempts = backoff.attempt();
                        warn!(attempts, %reason, "reconnect attempts exhausted");
                        self.set_state(ConnectionState::Failed(FailureReason::ConnectionLost {
                            attempts,
                        }));
                        return;
                    };
                    info!(
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "reconnecting"
                    );
                    self.set_state(ConnectionState::Reconnecting {
                        attempt: backoff.attempt(),
                    });
                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            self.set_state(ConnectionState::Closed);
                            return;
                        }
                        () = time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> SessionEnd {
        self.set_state(ConnectionState::Connecting);
        let connected = tokio::select! {
            () = self.cancel.cancelled() => return SessionEnd::Cancelled,
            result = self.connector.connect(&self.config.url) => result,
        };
        let mut transport = match connected {
            Ok(transport) => transport,
            Err(e) => return SessionEnd::dropped(e.to_string(), false),
        };

        self.set_state(ConnectionState::Handshaking);
        let (session_id, resumed) = match self.handshake(transport.as_mut()).await {
            Ok(established) => established,
            Err(end) => {
                transport.close().await;
                return end;
            }
        };
        *self.session.lock() = Some(session_id.clone());
        self.set_state(ConnectionState::Connected);
        info!(%session_id, resumed, "connected");
        self.emit(ClientEvent::Connected {
            session_id: session_id.clone(),
            resumed,
        });

        let end = self.pump(transport.as_mut(), &session_id).await;
        transport.close().await;
        end
    }

    async fn handshake(
        &self,
        transport: &mut dyn FrameTransport,
    ) -> Result<(SessionId, bool), SessionEnd> {
        let requested = self.session.lock().clone();
        let hello = Message::new(Payload::Hello(HelloPayload {
            token: Some(self.config.token.clone()),
            protocol_version: self.config.protocol_version.clone(),
            supported_versions: vec![self.config.protocol_version.clone()],
            client_name: self.config.client_name.clone(),
            capabilities: None,
        }))
        .in_session(requested);
        send_message(transport, &hello)
            .await
            .map_err(|reason| SessionEnd::dropped(reason, false))?;

        let deadline = time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => return Err(SessionEnd::Cancelled),
                () = &mut deadline => return Err(SessionEnd::dropped("handshake timed out", false)),
                frame = transport.recv() => frame,
            };
            let raw = match frame {
                Ok(Some(raw)) => raw,
                Ok(None) => return Err(SessionEnd::dropped("closed during handshake", false)),
                Err(e) => return Err(SessionEnd::dropped(e.to_string(), false)),
            };
            let message = match decode(raw.as_bytes(), Role::Client) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "undecodable frame during handshake");
                    continue;
                }
            };
            match message.payload {
                Payload::Hello(reply) => {
                    let Some(session_id) = message.session_id else {
                        return Err(SessionEnd::dropped("hello reply without a session", false));
                    };
                    let resumed = reply.capabilities.is_some_and(|c| c.resumed);
                    return Ok((session_id, resumed));
                }
                Payload::Error(err) if err.code == ErrorCode::AuthenticationFailed => {
                    return Err(SessionEnd::AuthFailed(err.message));
                }
                Payload::Error(err) if err.fatal => {
                    return Err(SessionEnd::dropped(err.message, false));
                }
                Payload::Error(err) => self.emit(ClientEvent::ServerError(err)),
                Payload::Ping(probe) => {
                    send_message(transport, &Message::pong(probe.nonce))
                        .await
                        .map_err(|reason| SessionEnd::dropped(reason, false))?;
                }
                other => debug!(kind = %other.kind(), "ignoring message before handshake"),
            }
        }
    }

    async fn pump(&self, transport: &mut dyn FrameTransport, session_id: &SessionId) -> SessionEnd {
        let mut assembler =
            StreamAssembler::new(self.config.stream_timeout, self.config.max_stream_bytes);
        loop {
            if let Err(reason) = self.flush(transport, session_id).await {
                return SessionEnd::dropped(reason, true);
            }
            let frame = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SessionEnd::Cancelled,
                frame = transport.recv() => frame,
                () = self.queue.ready() => continue,
            };
            match frame {
                Ok(Some(raw)) => {
                    if let Some(end) = self.on_frame(transport, &mut assembler, session_id, &raw).await
                    {
                        return end;
                    }
                }
                Ok(None) => return SessionEnd::dropped("closed by server", true),
                Err(e) => return SessionEnd::dropped(e.to_string(), true),
            }
        }
    }

    /// Send queued messages in order. A message leaves the queue only after
    /// its frame was written. Each one is stamped with the current session
    /// and time as it goes out; the id stays the same so a resend after a
    /// drop is still recognised as a duplicate.
    async fn flush(
        &self,
        transport: &mut dyn FrameTransport,
        session_id: &SessionId,
    ) -> Result<(), String> {
        while let Some(message) = self.queue.front() {
            let mut message = message.in_session(Some(session_id.clone()));
            message.timestamp = Utc::now();
            send_message(transport, &message).await?;
            let _ = self.queue.pop_front();
        }
        Ok(())
    }

    async fn on_frame(
        &self,
        transport: &mut dyn FrameTransport,
        assembler: &mut StreamAssembler,
        session_id: &SessionId,
        raw: &str,
    ) -> Option<SessionEnd> {
        let now = Instant::now().into_std();
        for response_id in assembler.expire(now) {
            self.emit(ClientEvent::StreamFailed {
                response_id,
                reason: "timed out".into(),
            });
        }
        let message = match decode(raw.as_bytes(), Role::Client) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return None;
            }
        };
        let kind = message.kind();
        match message.payload {
            Payload::Response(response) => self.emit(ClientEvent::Response(response)),
            Payload::StreamingStart(start) => {
                if let Err(e) = assembler.start(&start, now) {
                    return Some(stream_violation(&e));
                }
            }
            Payload::StreamingChunk(chunk) => {
                if let Err(e) = assembler.append(&chunk) {
                    return Some(stream_violation(&e));
                }
            }
            Payload::StreamingEnd(end) => match assembler.finish(&end, now) {
                Ok(StreamOutcome::Completed(assembled)) => {
                    debug!(response_id = %assembled.response_id, chunks = assembled.chunk_count, "stream complete");
                    self.emit(ClientEvent::Response(ResponsePayload {
                        content: assembled.content,
                        content_type: Some(assembled.content_type),
                        in_reply_to: assembled.in_reply_to,
                        data: None,
                    }));
                }
                Ok(StreamOutcome::Cancelled { response_id }) => {
                    self.emit(ClientEvent::StreamFailed {
                        response_id,
                        reason: "cancelled".into(),
                    });
                }
                Ok(StreamOutcome::Errored { response_id, error }) => {
                    self.emit(ClientEvent::StreamFailed {
                        response_id,
                        reason: error.unwrap_or_else(|| "error".into()),
                    });
                }
                Err(e) => return Some(stream_violation(&e)),
            },
            Payload::Error(err) => {
                if err.code == ErrorCode::AuthenticationFailed && err.fatal {
                    return Some(SessionEnd::AuthFailed(err.message));
                }
                self.emit(ClientEvent::ServerError(err));
            }
            Payload::Ping(probe) => {
                let pong = Message::pong(probe.nonce).in_session(Some(session_id.clone()));
                if let Err(reason) = send_message(transport, &pong).await {
                    return Some(SessionEnd::dropped(reason, true));
                }
            }
            Payload::SessionUpdate(update) => self.emit(ClientEvent::SessionUpdate(update)),
            Payload::Pong(_)
            | Payload::Hello(_)
            | Payload::Query(_)
            | Payload::Feedback(_)
            | Payload::ContextUpdate(_) => debug!(%kind, "ignoring message"),
        }
        None
    }

    fn set_state(&self, next: ConnectionState) {
        debug!(state = %next, "client state");
        let _ = self.state.send_replace(next);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// Out-of-order stream frames mean the server is misbehaving; the
/// connection is dropped and the driver reconnects.
fn stream_violation(err: &StreamError) -> SessionEnd {
    warn!(error = %err, code = %err.code(), "stream protocol violation");
    SessionEnd::dropped(format!("protocol violation: {err}"), true)
}

async fn send_message(transport: &mut dyn FrameTransport, message: &Message) -> Result<(), String> {
    let frame = encode(message).map_err(|e| e.to_string())?;
    transport.send(frame).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use agentwire_core::{Decoder, ValidationPolicy};
    use agentwire_core::message::{
        Capabilities, CompletionReason, ProbePayload, StreamingChunkPayload, StreamingEndPayload,
        StreamingStartPayload,
    };
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemTransport {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl FrameTransport for MemTransport {
        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            self.outbound
                .send(frame)
                .map_err(|_| TransportError::Send("peer gone".into()))
        }

        async fn recv(&mut self) -> Result<Option<String>, TransportError> {
            Ok(self.inbound.recv().await)
        }

        async fn close(&mut self) {
            self.inbound.close();
        }
    }

    /// Server side of a [`MemTransport`].
    struct Peer {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl Peer {
        async fn recv(&mut self) -> Message {
            let raw = self.recv_raw().await;
            decode(raw.as_bytes(), Role::Server).unwrap()
        }

        async fn recv_raw(&mut self) -> String {
            self.from_client.recv().await.expect("client frame")
        }

        fn send(&self, message: Message) {
            let _ = self.to_client.send(encode(&message).unwrap());
        }

        async fn accept_hello(&mut self, session: &str, resumed: bool) -> Message {
            let hello = self.recv().await;
            assert_matches!(hello.payload, Payload::Hello(_));
            self.send(
                Message::new(Payload::Hello(HelloPayload {
                    protocol_version: "1.0".into(),
                    capabilities: Some(Capabilities {
                        heartbeat_interval_ms: 30_000,
                        max_message_bytes: 65_536,
                        resumed,
                        streaming: true,
                        message_types: vec![],
                    }),
                    ..HelloPayload::default()
                }))
                .in_session(Some(SessionId::from(session))),
            );
            hello
        }
    }

    fn pair() -> (MemTransport, Peer) {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        (
            MemTransport { inbound, outbound },
            Peer {
                to_client,
                from_client,
            },
        )
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<MemTransport>>,
        attempts: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(transports: Vec<MemTransport>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(transports.into()),
                attempts: AtomicUsize::new(0),
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn FrameTransport>, TransportError> {
            let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().pop_front() {
                Some(transport) => Ok(Box::new(transport)),
                None => Err(TransportError::Connect("refused".into())),
            }
        }
    }

    fn config() -> DriverConfig {
        DriverConfig {
            url: "ws://test.invalid/ws".into(),
            token: "token".into(),
            protocol_version: "1.0".into(),
            client_name: Some("test".into()),
            queue_capacity: 8,
            handshake_timeout: Duration::from_secs(5),
            backoff: BackoffConfig {
                base_delay_ms: 100,
                multiplier: 2.0,
                max_delay_ms: 1_000,
                jitter_factor: 0.0,
                max_attempts: 3,
            },
            stream_timeout: Duration::from_secs(60),
            max_stream_bytes: 1 << 20,
        }
    }

    async fn wait_terminal(handle: &ClientHandle) -> ConnectionState {
        let mut rx = handle.watch_state();
        rx.wait_for(ConnectionState::is_terminal).await.unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_queue_in_order_after_handshake() {
        let (transport, mut peer) = pair();
        let connector = ScriptedConnector::new(vec![transport]);
        let (handle, mut events) = ClientDriver::spawn(config(), connector);

        let first = handle.query("first").unwrap();
        let second = handle.query("second").unwrap();

        let hello = peer.accept_hello("sess_1", false).await;
        assert!(hello.session_id.is_none());
        assert_matches!(events.recv().await, Some(ClientEvent::Connected { resumed: false, .. }));

        let a = peer.recv().await;
        let b = peer.recv().await;
        assert_eq!(a.id, first);
        assert_eq!(b.id, second);
        assert_eq!(a.session_id, Some(SessionId::from("sess_1")));
        assert_eq!(handle.queued(), 0);

        assert_eq!(handle.shutdown().await, ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn flushed_messages_pass_server_freshness_check() {
        let (transport, mut peer) = pair();
        let connector = ScriptedConnector::new(vec![transport]);
        let (handle, mut events) = ClientDriver::spawn(config(), connector);

        // Queued long enough ago to fall outside the replay window.
        let mut queued = Message::new(Payload::Query(QueryPayload {
            query: "from before the outage".into(),
            context: None,
        }));
        queued.timestamp = Utc::now() - chrono::Duration::minutes(6);
        handle.queue.push(queued.clone()).unwrap();

        let _ = peer.accept_hello("sess_f", false).await;
        assert_matches!(events.recv().await, Some(ClientEvent::Connected { .. }));

        let raw = peer.recv_raw().await;
        let decoder = Decoder::new(Role::Server, ValidationPolicy::default());
        let sent = decoder.decode(raw.as_bytes(), Utc::now()).unwrap();
        assert_eq!(sent.id, queued.id);
        assert_eq!(sent.session_id, Some(SessionId::from("sess_f")));
        assert!(sent.timestamp > queued.timestamp);
        let _ = handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stream_violation_drops_connection() {
        let (t1, mut p1) = pair();
        let (t2, mut p2) = pair();
        let connector = ScriptedConnector::new(vec![t1, t2]);
        let (handle, mut events) = ClientDriver::spawn(config(), connector.clone());
        let _ = p1.accept_hello("sess_v", false).await;
        assert_matches!(events.recv().await, Some(ClientEvent::Connected { .. }));

        p1.send(Message::new(Payload::StreamingChunk(StreamingChunkPayload {
            response_id: ResponseId::from("never_started"),
            content: "orphan".into(),
            is_final: false,
        })));
        p1.send(Message::new(Payload::Response(ResponsePayload {
            content: "after".into(),
            content_type: None,
            in_reply_to: None,
            data: None,
        })));

        assert_matches!(
            events.recv().await,
            Some(ClientEvent::Disconnected { reason }) if reason.contains("protocol violation")
        );
        let _ = p2.accept_hello("sess_v", true).await;
        assert_matches!(events.recv().await, Some(ClientEvent::Connected { resumed: true, .. }));
        assert_eq!(connector.attempts(), 2);
        let _ = handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_streaming_end_drops_connection() {
        let (transport, mut peer) = pair();
        let connector = ScriptedConnector::new(vec![transport]);
        let (handle, mut events) = ClientDriver::spawn(config(), connector);
        let _ = peer.accept_hello("sess_e", false).await;
        assert_matches!(events.recv().await, Some(ClientEvent::Connected { .. }));

        let rid = ResponseId::from("resp_twice");
        peer.send(Message::new(Payload::StreamingStart(StreamingStartPayload {
            response_id: rid.clone(),
            content_type: "text/plain".into(),
            expected_length: None,
            in_reply_to: None,
        })));
        let end = Payload::StreamingEnd(StreamingEndPayload {
            response_id: rid,
            completion_reason: CompletionReason::Complete,
            error: None,
        });
        peer.send(Message::new(end.clone()));
        peer.send(Message::new(end));

        assert_matches!(events.recv().await, Some(ClientEvent::Response(r)) if r.content.is_empty());
        assert_matches!(events.recv().await, Some(ClientEvent::Disconnected { .. }));
        let _ = handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_retained_session() {
        let (t1, mut p1) = pair();
        let (t2, mut p2) = pair();
        let connector = ScriptedConnector::new(vec![t1, t2]);
        let (handle, mut events) = ClientDriver::spawn(config(), connector.clone());

        let _ = p1.accept_hello("sess_keep", false).await;
        assert_matches!(events.recv().await, Some(ClientEvent::Connected { .. }));
        drop(p1);

        assert_matches!(events.recv().await, Some(ClientEvent::Disconnected { .. }));
        let hello = p2.accept_hello("sess_keep", true).await;
        assert_eq!(hello.session_id, Some(SessionId::from("sess_keep")));
        assert_matches!(
            events.recv().await,
            Some(ClientEvent::Connected { resumed: true, session_id }) if session_id == SessionId::from("sess_keep")
        );
        assert_eq!(connector.attempts(), 2);
        assert_eq!(handle.session_id(), Some(SessionId::from("sess_keep")));
        let _ = handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_failure_is_terminal() {
        let (transport, mut peer) = pair();
        let connector = ScriptedConnector::new(vec![transport]);
        let (handle, _events) = ClientDriver::spawn(config(), connector.clone());

        let _ = peer.recv().await;
        peer.send(Message::error(ErrorCode::AuthenticationFailed, "Token expired"));

        let state = wait_terminal(&handle).await;
        assert_matches!(state, ConnectionState::Failed(FailureReason::AuthenticationFailed(_)));
        assert_eq!(connector.attempts(), 1);
        assert_matches!(handle.query("late"), Err(ClientError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let connector = ScriptedConnector::new(vec![]);
        let (handle, _events) = ClientDriver::spawn(config(), connector.clone());

        let state = wait_terminal(&handle).await;
        assert_eq!(
            state,
            ConnectionState::Failed(FailureReason::ConnectionLost { attempts: 3 })
        );
        // The initial connect plus one per reconnect attempt.
        assert_eq!(connector.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reassembles_streamed_response() {
        let (transport, mut peer) = pair();
        let connector = ScriptedConnector::new(vec![transport]);
        let (handle, mut events) = ClientDriver::spawn(config(), connector);
        let _ = peer.accept_hello("sess_s", false).await;
        assert_matches!(events.recv().await, Some(ClientEvent::Connected { .. }));

        let rid = ResponseId::from("resp_1");
        let origin = MessageId::from("q-1");
        peer.send(Message::new(Payload::StreamingStart(StreamingStartPayload {
            response_id: rid.clone(),
            content_type: "text/plain".into(),
            expected_length: None,
            in_reply_to: Some(origin.clone()),
        })));
        for (content, is_final) in [("list ", false), ("today", true)] {
            peer.send(Message::new(Payload::StreamingChunk(StreamingChunkPayload {
                response_id: rid.clone(),
                content: content.into(),
                is_final,
            })));
        }
        peer.send(Message::new(Payload::StreamingEnd(StreamingEndPayload {
            response_id: rid,
            completion_reason: CompletionReason::Complete,
            error: None,
        })));

        assert_matches!(
            events.recv().await,
            Some(ClientEvent::Response(r)) if r.content == "list today" && r.in_reply_to == Some(origin)
        );

        let cancelled = ResponseId::from("resp_2");
        peer.send(Message::new(Payload::StreamingStart(StreamingStartPayload {
            response_id: cancelled.clone(),
            content_type: "text/plain".into(),
            expected_length: None,
            in_reply_to: None,
        })));
        peer.send(Message::new(Payload::StreamingEnd(StreamingEndPayload {
            response_id: cancelled.clone(),
            completion_reason: CompletionReason::Cancelled,
            error: None,
        })));
        assert_matches!(
            events.recv().await,
            Some(ClientEvent::StreamFailed { response_id, .. }) if response_id == cancelled
        );
        let _ = handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn answers_ping_with_pong() {
        let (transport, mut peer) = pair();
        let connector = ScriptedConnector::new(vec![transport]);
        let (handle, _events) = ClientDriver::spawn(config(), connector);
        let _ = peer.accept_hello("sess_p", false).await;

        peer.send(Message::new(Payload::Ping(ProbePayload {
            nonce: Some("n-7".into()),
        })));
        let pong = peer.recv().await;
        assert_matches!(pong.payload, Payload::Pong(p) if p.nonce.as_deref() == Some("n-7"));
        assert_eq!(pong.session_id, Some(SessionId::from("sess_p")));
        let _ = handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let connector = ScriptedConnector::new(vec![]);
        let mut cfg = config();
        cfg.backoff.base_delay_ms = 60_000;
        cfg.backoff.max_delay_ms = 60_000;
        let (handle, _events) = ClientDriver::spawn(cfg, connector.clone());

        let mut rx = handle.watch_state();
        let _ = rx
            .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
            .await
            .unwrap();
        assert_eq!(handle.shutdown().await, ConnectionState::Closed);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn queue_overflow_is_synchronous() {
        let connector = ScriptedConnector::new(vec![]);
        let mut cfg = config();
        cfg.queue_capacity = 1;
        cfg.backoff.base_delay_ms = 60_000;
        let (handle, _events) = ClientDriver::spawn(cfg, connector);
        let _ = handle.query("one").unwrap();
        assert_matches!(handle.query("two"), Err(ClientError::QueueFull { capacity: 1 }));
        let _ = handle.shutdown().await;
    }

    #[test]
    fn config_from_settings_requires_token() {
        let settings = ClientSettings::default();
        assert_matches!(DriverConfig::from_settings(&settings), Err(ClientError::MissingToken));
        let settings = ClientSettings {
            token: Some("abc".into()),
            ..ClientSettings::default()
        };
        let cfg = DriverConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.token, "abc");
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
    }
}
