//! Server-side settings: listener, heartbeat, validation, rate limits,
//! and streaming.

use serde::{Deserialize, Serialize};

/// Listener and per-connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// WebSocket endpoint path.
    pub ws_path: String,
    /// Global cap on simultaneous connections.
    pub max_connections: usize,
    /// Bounded outbound queue length per connection.
    pub outbound_queue_capacity: usize,
    /// Socket write timeout in milliseconds.
    pub send_timeout_ms: u64,
    /// Recoverable errors tolerated before a connection is closed.
    pub max_violations: u32,
    /// Time allowed for connection tasks to drain on shutdown, in ms.
    pub shutdown_timeout_ms: u64,
    /// How long envelope IDs are remembered for duplicate detection, in ms.
    pub dedup_window_ms: u64,
    /// Maximum remembered envelope IDs per connection.
    pub dedup_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ws_path: "/ws/ai/agent".to_string(),
            max_connections: 100,
            outbound_queue_capacity: 256,
            send_timeout_ms: 10_000,
            max_violations: 10,
            shutdown_timeout_ms: 5_000,
            dedup_window_ms: 300_000,
            dedup_capacity: 1_024,
        }
    }
}

/// Heartbeat monitor settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Interval between liveness probes in milliseconds.
    pub interval_ms: u64,
    /// Idle time, as a multiple of the interval, before eviction.
    pub idle_multiplier: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            idle_multiplier: 2,
        }
    }
}

/// Inbound frame validation limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationSettings {
    /// How far in the past a message timestamp may lie, in ms.
    pub max_skew_past_ms: u64,
    /// How far in the future a message timestamp may lie, in ms.
    pub max_skew_future_ms: u64,
    /// Largest accepted frame in bytes.
    pub max_message_bytes: usize,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_skew_past_ms: 300_000,
            max_skew_future_ms: 30_000,
            max_message_bytes: 65_536,
        }
    }
}

/// Rate-limit scopes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// New connections (and failed handshakes) per IP per minute.
    pub connections_per_ip_per_minute: u32,
    /// Messages per session per second.
    pub messages_per_session_per_second: u32,
    /// Query cost units per session per minute.
    pub query_cost_per_session_per_minute: u32,
    /// Idle buckets older than this are pruned, in ms.
    pub idle_bucket_ttl_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            connections_per_ip_per_minute: 60,
            messages_per_session_per_second: 20,
            query_cost_per_session_per_minute: 120,
            idle_bucket_ttl_ms: 300_000,
        }
    }
}

/// Streaming coordinator settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamingSettings {
    /// Streams older than this are failed, in ms.
    pub timeout_ms: u64,
    /// Largest buffered content per inbound stream, in bytes.
    pub max_buffer_bytes: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_buffer_bytes: 1_048_576,
        }
    }
}
