//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{Instrument, debug, info, instrument, warn};

use super::connection::{CloseReason, Connection};
use super::handler::{ConnectionHandler, FrameOutcome};
use crate::audit::AuditEvent;
use crate::context::ServerContext;
use crate::metrics::{
    SLOW_CONSUMER_DISCONNECTS_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};

type WsSink = SplitSink<WebSocket, WsMessage>;

/// Run a registered connection until it closes.
///
/// Inbound frames go through a [`ConnectionHandler`]. Outbound frames are
/// drained from `rx` by a writer task, which sends the close frame once the
/// connection's cancel token fires. On exit the connection is deregistered
/// and its inbound streams released.
#[instrument(skip_all, fields(conn_id = %conn.id, remote_addr = %conn.remote_addr))]
pub async fn run_ws_session(
    ws: WebSocket,
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    rx: mpsc::Receiver<Arc<String>>,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let started = Instant::now();
    info!(user_agent = conn.user_agent.as_deref().unwrap_or(""), "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let mut writer = tokio::spawn(
        write_loop(ws_tx, rx, Arc::clone(&conn), ctx.config.send_timeout).in_current_span(),
    );
    let mut handler = ConnectionHandler::new(Arc::clone(&ctx), Arc::clone(&conn));
    let cancel = conn.cancel_token();

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let outcome = match frame {
            Some(Ok(WsMessage::Text(text))) => handler.handle_frame(text.as_str().as_bytes()).await,
            Some(Ok(WsMessage::Binary(data))) => handler.handle_frame(&data).await,
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                conn.mark_activity();
                FrameOutcome::Continue
            }
            Some(Ok(WsMessage::Close(_))) | None => FrameOutcome::Close(CloseReason::ClientClosed),
            Some(Err(e)) => FrameOutcome::Close(CloseReason::TransportError(e.to_string())),
        };
        if let FrameOutcome::Close(reason) = outcome {
            let _ = conn.close(reason);
            break;
        }
    }

    let reason = conn.close_reason().unwrap_or(CloseReason::ClientClosed);
    if time::timeout(ctx.config.send_timeout, &mut writer).await.is_err() {
        debug!("writer did not finish, aborting");
        writer.abort();
    }

    let released = ctx.streaming.release_connection(&conn.id);
    if ctx.registry.deregister(&conn.id).is_some() {
        ctx.audit.record(AuditEvent::ConnectionClosed {
            connection_id: conn.id.clone(),
            reason: reason.clone(),
        });
    }
    if reason == CloseReason::SlowConsumer {
        counter!(SLOW_CONSUMER_DISCONNECTS_TOTAL).increment(1);
    }
    info!(
        %reason,
        released_streams = released,
        dropped = conn.drop_count(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

/// Forward queued frames in order. After cancellation, flush what is
/// already queued and finish with a close frame.
async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Arc<String>>,
    conn: Arc<Connection>,
    send_timeout: Duration,
) {
    let cancel = conn.cancel_token();
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            () = cancel.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        if !send_frame(&mut sink, &frame, send_timeout, &conn).await {
            return;
        }
    }

    while let Ok(frame) = rx.try_recv() {
        if !send_frame(&mut sink, &frame, send_timeout, &conn).await {
            return;
        }
    }

    let reason = conn.close_reason().unwrap_or(CloseReason::ServerShutdown);
    let close = WsMessage::Close(Some(CloseFrame {
        code: reason.close_code(),
        reason: reason.close_text().to_owned().into(),
    }));
    if let Ok(Err(e)) = time::timeout(send_timeout, sink.send(close)).await {
        debug!(error = %e, "close frame not sent");
    }
}

async fn send_frame(
    sink: &mut WsSink,
    frame: &Arc<String>,
    send_timeout: Duration,
    conn: &Connection,
) -> bool {
    let message = WsMessage::Text(String::clone(frame).into());
    match time::timeout(send_timeout, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            let _ = conn.close(CloseReason::TransportError(e.to_string()));
            false
        }
        Err(_) => {
            warn!(timeout_ms = send_timeout.as_millis() as u64, "send timed out");
            let _ = conn.close(CloseReason::SendTimeout);
            false
        }
    }
}
