//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file may name only the fields it changes.

mod auth;
mod client;
mod server;

pub use auth::*;
pub use client::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "rateLimits": { "messagesPerSessionPerSecond": 50 },
///   "auth": { "jwtSecret": "..." }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentwireSettings {
    /// Listener and per-connection settings.
    pub server: ServerSettings,
    /// Heartbeat monitor.
    pub heartbeat: HeartbeatSettings,
    /// Frame validation limits.
    pub validation: ValidationSettings,
    /// Rate-limit scopes.
    pub rate_limits: RateLimitSettings,
    /// Token verification and sessions.
    pub auth: AuthSettings,
    /// Streaming coordinator.
    pub streaming: StreamingSettings,
    /// Client driver.
    pub client: ClientSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

impl AgentwireSettings {
    /// Reject values that would make the runtime misbehave (zero limits,
    /// empty version list).
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &'static str); 11] = [
            (self.server.port != 0, "server.port must be non-zero"),
            (self.server.max_connections > 0, "server.maxConnections must be positive"),
            (
                self.server.outbound_queue_capacity > 0,
                "server.outboundQueueCapacity must be positive",
            ),
            (self.server.ws_path.starts_with('/'), "server.wsPath must start with '/'"),
            (self.heartbeat.interval_ms > 0, "heartbeat.intervalMs must be positive"),
            (
                self.validation.max_message_bytes > 0,
                "validation.maxMessageBytes must be positive",
            ),
            (
                self.rate_limits.connections_per_ip_per_minute > 0
                    && self.rate_limits.messages_per_session_per_second > 0
                    && self.rate_limits.query_cost_per_session_per_minute > 0,
                "rateLimits values must be positive",
            ),
            (
                !self.auth.supported_versions.is_empty(),
                "auth.supportedVersions must not be empty",
            ),
            (self.auth.session_ttl_ms > 0, "auth.sessionTtlMs must be positive"),
            (self.streaming.timeout_ms > 0, "streaming.timeoutMs must be positive"),
            (self.client.queue_capacity > 0, "client.queueCapacity must be positive"),
        ];
        let problems: Vec<&'static str> = checks
            .iter()
            .filter(|(ok, _)| !ok)
            .map(|(_, msg)| *msg)
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AgentwireSettings::default().validate().unwrap();
    }

    #[test]
    fn serde_roundtrip() {
        let defaults = AgentwireSettings::default();
        let json = serde_json::to_string(&defaults).unwrap();
        let back: AgentwireSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, defaults);
    }

    #[test]
    fn json_field_names() {
        let json = serde_json::to_value(AgentwireSettings::default()).unwrap();
        assert!(json.get("rateLimits").is_some());
        assert!(json["server"].get("wsPath").is_some());
        assert!(json["client"]["reconnect"].get("maxAttempts").is_some());
    }

    #[test]
    fn empty_json_produces_defaults() {
        let s: AgentwireSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, AgentwireSettings::default());
    }

    #[test]
    fn zero_limit_rejected() {
        let mut s = AgentwireSettings::default();
        s.rate_limits.messages_per_session_per_second = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("rateLimits"));
    }

    #[test]
    fn empty_versions_rejected() {
        let mut s = AgentwireSettings::default();
        s.auth.supported_versions.clear();
        assert!(s.validate().is_err());
    }
}
