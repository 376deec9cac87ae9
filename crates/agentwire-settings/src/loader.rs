//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`AgentwireSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `AGENTWIRE_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use agentwire_core::logging::LogFormat;
use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::AgentwireSettings;

/// Resolve the settings file path.
///
/// `$AGENTWIRE_HOME/settings.json` when set, otherwise
/// `~/.agentwire/settings.json`.
pub fn settings_path() -> PathBuf {
    resolve_settings_path(
        std::env::var("AGENTWIRE_HOME").ok(),
        std::env::var("HOME").ok(),
    )
}

/// Pure form of [`settings_path`].
pub fn resolve_settings_path(agentwire_home: Option<String>, home: Option<String>) -> PathBuf {
    match agentwire_home.filter(|h| !h.is_empty()) {
        Some(dir) => PathBuf::from(dir).join("settings.json"),
        None => PathBuf::from(home.unwrap_or_else(|| "/tmp".to_string()))
            .join(".agentwire")
            .join("settings.json"),
    }
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<AgentwireSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults (plus env overrides). If the
/// file contains invalid JSON, or the merged result fails validation,
/// returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<AgentwireSettings> {
    load_with_env(path, &|name| std::env::var(name).ok())
}

/// Load with an injectable environment lookup.
pub fn load_with_env(path: &Path, env: &dyn Fn(&str) -> Option<String>) -> Result<AgentwireSettings> {
    let defaults = serde_json::to_value(AgentwireSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: AgentwireSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut AgentwireSettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides from `env`.
///
/// Integers must parse and fall within range; invalid values are logged and
/// ignored (the file/default value stays).
pub fn apply_overrides(settings: &mut AgentwireSettings, env: &dyn Fn(&str) -> Option<String>) {
    let vars = EnvReader { env };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = vars.string("AGENTWIRE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = vars.u16("AGENTWIRE_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = vars.string("AGENTWIRE_WS_PATH") {
        settings.server.ws_path = v;
    }
    if let Some(v) = vars.usize("AGENTWIRE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = vars.u64("AGENTWIRE_HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.heartbeat.interval_ms = v;
    }
    if let Some(v) = vars.usize("AGENTWIRE_MAX_MESSAGE_BYTES", 256, 16 * 1024 * 1024) {
        settings.validation.max_message_bytes = v;
    }
    if let Some(v) = vars.u64("AGENTWIRE_STREAM_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.streaming.timeout_ms = v;
    }

    // ── Rate limits ─────────────────────────────────────────────────
    if let Some(v) = vars.u32("AGENTWIRE_RATE_CONNECTIONS_PER_MINUTE", 1, 100_000) {
        settings.rate_limits.connections_per_ip_per_minute = v;
    }
    if let Some(v) = vars.u32("AGENTWIRE_RATE_MESSAGES_PER_SECOND", 1, 100_000) {
        settings.rate_limits.messages_per_session_per_second = v;
    }
    if let Some(v) = vars.u32("AGENTWIRE_RATE_QUERY_COST_PER_MINUTE", 1, 1_000_000) {
        settings.rate_limits.query_cost_per_session_per_minute = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = vars.string("AGENTWIRE_JWT_SECRET") {
        settings.auth.jwt_secret = Some(v);
    }
    if let Some(v) = vars.string("AGENTWIRE_JWT_ALGORITHM") {
        settings.auth.algorithm = v;
    }
    if let Some(v) = vars.string("AGENTWIRE_JWT_ISSUER") {
        settings.auth.issuer = Some(v);
    }
    if let Some(v) = vars.string("AGENTWIRE_JWT_AUDIENCE") {
        settings.auth.audience = Some(v);
    }

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = vars.string("AGENTWIRE_CLIENT_URL") {
        settings.client.url = v;
    }
    if let Some(v) = vars.string("AGENTWIRE_CLIENT_TOKEN") {
        settings.client.token = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = vars.string("AGENTWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = vars.string("AGENTWIRE_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => tracing::warn!(key = "AGENTWIRE_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a log format name (`compact` or `json`, case-insensitive).
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.to_lowercase().as_str() {
        "compact" | "text" => Some(LogFormat::Compact),
        "json" => Some(LogFormat::Json),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<'a> {
    env: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.env)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
