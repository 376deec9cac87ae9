//! Runtime configuration for the server, derived from settings.

use std::time::Duration;

use agentwire_core::ValidationPolicy;
use agentwire_settings::AgentwireSettings;

use crate::ratelimit::RateLimits;

/// Server configuration with durations resolved.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port (0 picks a free port).
    pub port: u16,
    /// WebSocket upgrade path.
    pub ws_path: String,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Per-connection outbound queue capacity.
    pub outbound_queue_capacity: usize,
    /// Per-frame socket write timeout.
    pub send_timeout: Duration,
    /// Recoverable violations tolerated before a connection is closed.
    pub max_violations: u32,
    /// How long shutdown waits for connections to drain.
    pub shutdown_timeout: Duration,
    /// Inbound message-ID dedup window.
    pub dedup_window: Duration,
    /// Maximum IDs remembered per connection.
    pub dedup_capacity: usize,
    /// Heartbeat sweep period.
    pub heartbeat_interval: Duration,
    /// Connections idle longer than this are evicted.
    pub idle_timeout: Duration,
    /// Inbound frame validation.
    pub validation: ValidationPolicy,
    /// Rate-limit budgets.
    pub rate_limits: RateLimits,
    /// Streams idle longer than this are failed.
    pub stream_timeout: Duration,
    /// Per-stream inbound buffer cap.
    pub stream_max_buffer_bytes: usize,
    /// Protocol versions accepted, most preferred first.
    pub supported_versions: Vec<String>,
    /// Maximum session lifetime.
    pub session_ttl: Duration,
}

impl ServerConfig {
    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&AgentwireSettings::default())
    }
}

impl From<&AgentwireSettings> for ServerConfig {
    fn from(s: &AgentwireSettings) -> Self {
        let heartbeat_interval = Duration::from_millis(s.heartbeat.interval_ms);
        Self {
            host: s.server.host.clone(),
            port: s.server.port,
            ws_path: s.server.ws_path.clone(),
            max_connections: s.server.max_connections,
            outbound_queue_capacity: s.server.outbound_queue_capacity,
            send_timeout: Duration::from_millis(s.server.send_timeout_ms),
            max_violations: s.server.max_violations,
            shutdown_timeout: Duration::from_millis(s.server.shutdown_timeout_ms),
            dedup_window: Duration::from_millis(s.server.dedup_window_ms),
            dedup_capacity: s.server.dedup_capacity,
            heartbeat_interval,
            idle_timeout: heartbeat_interval.saturating_mul(s.heartbeat.idle_multiplier.max(1)),
            validation: ValidationPolicy {
                max_skew_past: Duration::from_millis(s.validation.max_skew_past_ms),
                max_skew_future: Duration::from_millis(s.validation.max_skew_future_ms),
                max_message_bytes: s.validation.max_message_bytes,
            },
            rate_limits: RateLimits::from(&s.rate_limits),
            stream_timeout: Duration::from_millis(s.streaming.timeout_ms),
            stream_max_buffer_bytes: s.streaming.max_buffer_bytes,
            supported_versions: s.auth.supported_versions.clone(),
            session_ttl: Duration::from_millis(s.auth.session_ttl_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.ws_path, "/ws/ai/agent");
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
        assert_eq!(cfg.stream_timeout, Duration::from_secs(60));
        assert_eq!(cfg.max_violations, 10);
        assert_eq!(cfg.supported_versions, vec!["1.0".to_string()]);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn idle_timeout_follows_multiplier() {
        let mut settings = AgentwireSettings::default();
        settings.heartbeat.interval_ms = 1_000;
        settings.heartbeat.idle_multiplier = 3;
        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(3));
    }
}
