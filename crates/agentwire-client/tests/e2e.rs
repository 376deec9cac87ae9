//! Client driver against a real agentwire server.

use std::sync::Arc;
use std::time::Duration;

use agentwire_client::{
    ClientDriver, ClientEvent, ConnectionState, DriverConfig, FailureReason, TungsteniteConnector,
};
use agentwire_core::retry::BackoffConfig;
use agentwire_server::audit::ChannelAuditSink;
use agentwire_server::reasoning::{QueryRequest, ReasoningError, ReasoningService, Reply};
use agentwire_server::{
    AcknowledgingReasoner, AgentServer, JwtVerifier, ServerConfig, ServerContext, ServerHandle,
};
use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::StreamExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(5);
const SECRET: &[u8] = b"client-e2e-secret";

struct ChunkedReasoner(Vec<&'static str>);

#[async_trait]
impl ReasoningService for ChunkedReasoner {
    async fn respond(&self, _request: QueryRequest) -> Result<Reply, ReasoningError> {
        let chunks: Vec<Result<String, ReasoningError>> =
            self.0.iter().map(|c| Ok((*c).to_owned())).collect();
        Ok(Reply::Stream {
            content_type: "text/plain".into(),
            expected_length: None,
            chunks: futures::stream::iter(chunks).boxed(),
        })
    }
}

async fn boot(reasoning: Arc<dyn ReasoningService>) -> (String, ServerHandle) {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    };
    let ws_path = config.ws_path.clone();
    let (audit, _audit_rx) = ChannelAuditSink::new();
    let ctx = ServerContext::new(
        config,
        Arc::new(JwtVerifier::hmac(SECRET, Algorithm::HS256)),
        reasoning,
        Arc::new(audit),
    );
    let handle = AgentServer::new(ctx).listen().await.unwrap();
    (format!("ws://{}{ws_path}", handle.local_addr()), handle)
}

fn token(sub: &str, expires_in_secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + expires_in_secs;
    let claims = serde_json::json!({ "sub": sub, "exp": exp });
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET),
    )
    .unwrap()
}

fn config(url: &str, token: String) -> DriverConfig {
    DriverConfig {
        backoff: BackoffConfig {
            base_delay_ms: 20,
            multiplier: 2.0,
            max_delay_ms: 100,
            jitter_factor: 0.0,
            max_attempts: 2,
        },
        ..DriverConfig::new(url, token)
    }
}

/// Skip events until one matches.
async fn next_matching(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("driver stopped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timeout waiting for event")
}

#[tokio::test]
async fn queued_query_gets_single_response() {
    let (url, server) = boot(Arc::new(AcknowledgingReasoner::default())).await;
    let (client, mut events) =
        ClientDriver::spawn(config(&url, token("alice", 3600)), Arc::new(TungsteniteConnector));

    // Submitted before the handshake completes; delivered once connected.
    let id = client.query("hello there").unwrap();
    timeout(TIMEOUT, client.connected()).await.unwrap().unwrap();

    let event = next_matching(&mut events, |e| matches!(e, ClientEvent::Response(_))).await;
    assert_matches!(
        event,
        ClientEvent::Response(r) if r.content == "Received: hello there" && r.in_reply_to == Some(id)
    );
    assert!(client.session_id().is_some());

    assert_eq!(client.shutdown().await, ConnectionState::Closed);
    let _ = server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn streamed_reply_is_reassembled() {
    let (url, server) = boot(Arc::new(ChunkedReasoner(vec!["The answer ", "is ", "42."]))).await;
    let (client, mut events) =
        ClientDriver::spawn(config(&url, token("bob", 3600)), Arc::new(TungsteniteConnector));
    timeout(TIMEOUT, client.connected()).await.unwrap().unwrap();

    let id = client.query("what is the answer?").unwrap();
    let event = next_matching(&mut events, |e| matches!(e, ClientEvent::Response(_))).await;
    assert_matches!(
        event,
        ClientEvent::Response(r) if r.content == "The answer is 42." && r.in_reply_to == Some(id)
    );

    let _ = client.shutdown().await;
    let _ = server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn expired_token_fails_without_retry() {
    let (url, server) = boot(Arc::new(AcknowledgingReasoner::default())).await;
    let (client, _events) =
        ClientDriver::spawn(config(&url, token("carol", -3600)), Arc::new(TungsteniteConnector));

    let mut state = client.watch_state();
    let terminal = timeout(TIMEOUT, state.wait_for(ConnectionState::is_terminal))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_matches!(terminal, ConnectionState::Failed(FailureReason::AuthenticationFailed(_)));
    assert!(client.connected().await.is_err());

    let _ = server.shutdown(TIMEOUT).await;
}

#[tokio::test]
async fn server_shutdown_disconnects_then_gives_up() {
    let (url, server) = boot(Arc::new(AcknowledgingReasoner::default())).await;
    let (client, mut events) =
        ClientDriver::spawn(config(&url, token("dave", 3600)), Arc::new(TungsteniteConnector));
    timeout(TIMEOUT, client.connected()).await.unwrap().unwrap();

    let _ = server.shutdown(TIMEOUT).await;
    let _ = next_matching(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;

    let mut state = client.watch_state();
    let terminal = timeout(TIMEOUT, state.wait_for(ConnectionState::is_terminal))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(
        terminal,
        ConnectionState::Failed(FailureReason::ConnectionLost { attempts: 2 })
    );
}
