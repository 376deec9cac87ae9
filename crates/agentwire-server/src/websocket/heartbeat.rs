//! Heartbeat sweep: liveness probes, idle eviction, and housekeeping.

use std::sync::Arc;
use std::time::Duration;

use agentwire_core::Message;
use chrono::Utc;
use metrics::counter;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::CloseReason;
use super::registry::{ConnectionRegistry, close_connection};
use crate::audit::{AuditEvent, AuditSink};
use crate::auth::SessionStore;
use crate::metrics::HEARTBEAT_EVICTIONS_TOTAL;
use crate::ratelimit::RateLimiter;
use crate::streaming::StreamingCoordinator;

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections sent a `ping`.
    pub probed: usize,
    /// Connections evicted for inactivity.
    pub evicted: usize,
    /// Idle rate-limit buckets removed.
    pub pruned_buckets: usize,
    /// Expired sessions removed.
    pub purged_sessions: usize,
    /// Inbound streams failed by timeout.
    pub expired_streams: usize,
}

/// Periodic liveness monitor over the registry.
pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    limiter: Arc<RateLimiter>,
    sessions: Arc<SessionStore>,
    streaming: Arc<StreamingCoordinator>,
    audit: Arc<dyn AuditSink>,
    interval: Duration,
    idle_timeout: Duration,
}

impl HeartbeatMonitor {
    /// Create a monitor.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        limiter: Arc<RateLimiter>,
        sessions: Arc<SessionStore>,
        streaming: Arc<StreamingCoordinator>,
        audit: Arc<dyn AuditSink>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            limiter,
            sessions,
            streaming,
            audit,
            interval,
            idle_timeout,
        }
    }

    /// Run one sweep over a snapshot of the registry.
    pub fn tick(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for conn in self.registry.snapshot() {
            if conn.is_closed() {
                continue;
            }
            if conn.idle_for() > self.idle_timeout {
                info!(conn_id = %conn.id, idle_ms = conn.idle_for().as_millis() as u64, "evicting idle connection");
                let _ = close_connection(&conn, CloseReason::HeartbeatTimeout);
                let _ = self.registry.deregister(&conn.id);
                let _ = self.streaming.release_connection(&conn.id);
                self.audit.record(AuditEvent::ConnectionClosed {
                    connection_id: conn.id.clone(),
                    reason: CloseReason::HeartbeatTimeout,
                });
                counter!(HEARTBEAT_EVICTIONS_TOTAL).increment(1);
                report.evicted += 1;
            } else if conn.is_authenticated() && conn.send_message(Message::ping()).is_ok() {
                report.probed += 1;
            }
        }
        report.pruned_buckets = self.limiter.prune(time::Instant::now().into_std());
        report.purged_sessions = self.sessions.purge_expired(Utc::now());
        report.expired_streams = self.streaming.expire().len();
        debug!(?report, "heartbeat sweep");
        report
    }

    /// Sweep every interval until `cancel` fires. The first sweep happens
    /// one interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.tick();
                }
                () = cancel.cancelled() => {
                    debug!("heartbeat monitor stopped");
                    return;
                }
            }
        }
    }
}
