//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::websocket::registry::RegistryStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Connections that completed the handshake.
    pub authenticated: usize,
    /// Number of live sessions.
    pub active_sessions: usize,
    /// Age of the oldest connection in seconds.
    pub oldest_connection_secs: u64,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, stats: &RegistryStats, sessions: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.count,
        authenticated: stats.authenticated,
        active_sessions: sessions,
        oldest_connection_secs: stats.oldest_age.as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), &RegistryStats::default(), 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now().checked_sub(Duration::from_secs(60)).unwrap();
        let resp = health_check(start, &RegistryStats::default(), 0);
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let stats = RegistryStats {
            count: 3,
            authenticated: 2,
            oldest_age: Duration::from_secs(42),
            total_idle: Duration::ZERO,
        };
        let resp = health_check(Instant::now(), &stats, 1);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 3);
        assert_eq!(parsed["authenticated"], 2);
        assert_eq!(parsed["active_sessions"], 1);
        assert_eq!(parsed["oldest_connection_secs"], 42);
    }
}
