//! Client driver and logging settings.

use std::fmt;

use agentwire_core::logging::LogFormat;
use agentwire_core::retry::BackoffConfig;
use serde::{Deserialize, Serialize};

/// Client protocol driver settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Server endpoint.
    pub url: String,
    /// Bearer token sent in `hello`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Preferred protocol version.
    pub protocol_version: String,
    /// Name reported in `hello`.
    pub client_name: String,
    /// Bounded outbound queue length while disconnected.
    pub queue_capacity: usize,
    /// Time allowed for the handshake reply, in ms.
    pub handshake_timeout_ms: u64,
    /// Reconnect schedule.
    pub reconnect: BackoffConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws/ai/agent".to_string(),
            token: None,
            protocol_version: "1.0".to_string(),
            client_name: "agentwire".to_string(),
            queue_capacity: 128,
            handshake_timeout_ms: 10_000,
            reconnect: BackoffConfig::default(),
        }
    }
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("protocol_version", &self.protocol_version)
            .field("client_name", &self.client_name)
            .field("queue_capacity", &self.queue_capacity)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let c = ClientSettings::default();
        assert!(c.url.ends_with("/ws/ai/agent"));
        assert_eq!(c.queue_capacity, 128);
        assert_eq!(c.reconnect.max_attempts, 10);
    }

    #[test]
    fn nested_reconnect_partial() {
        let c: ClientSettings =
            serde_json::from_str(r#"{"reconnect": {"maxAttempts": 3}}"#).unwrap();
        assert_eq!(c.reconnect.max_attempts, 3);
        assert_eq!(c.reconnect.base_delay_ms, 500);
    }

    #[test]
    fn logging_format_json() {
        let l: LoggingSettings = serde_json::from_str(r#"{"format": "json"}"#).unwrap();
        assert_eq!(l.format, LogFormat::Json);
        assert_eq!(l.level, "info");
    }
}
