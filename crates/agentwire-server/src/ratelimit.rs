//! Sliding-window rate limiting per (scope, key).
//!
//! Each bucket keeps a log of `(instant, cost)` entries inside its window.
//! Entries older than the window are pruned lazily on every check; buckets
//! untouched for `idle_ttl` are removed by [`RateLimiter::prune`], which the
//! heartbeat sweep calls.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use agentwire_settings::RateLimitSettings;
use dashmap::DashMap;
use parking_lot::Mutex;

/// What a bucket counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Connection attempts and failed handshakes, keyed by remote IP.
    ConnectionByIp,
    /// Inbound messages, keyed by session.
    MessageBySession,
    /// Query cost units, keyed by session.
    QueryByComplexity,
}

impl Scope {
    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionByIp => "connection_by_ip",
            Self::MessageBySession => "message_by_session",
            Self::QueryByComplexity => "query_by_complexity",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Budget for one scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limit {
    /// Cost units allowed per window.
    pub max: u32,
    /// Window length.
    pub window: Duration,
}

/// Limits for every scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimits {
    /// Connections per IP.
    pub connection_by_ip: Limit,
    /// Messages per session.
    pub message_by_session: Limit,
    /// Query cost per session.
    pub query_by_complexity: Limit,
    /// Buckets idle for longer than this are pruned.
    pub idle_ttl: Duration,
}

impl RateLimits {
    /// Limit configured for `scope`.
    pub fn limit(&self, scope: Scope) -> Limit {
        match scope {
            Scope::ConnectionByIp => self.connection_by_ip,
            Scope::MessageBySession => self.message_by_session,
            Scope::QueryByComplexity => self.query_by_complexity,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::from(&RateLimitSettings::default())
    }
}

impl From<&RateLimitSettings> for RateLimits {
    fn from(s: &RateLimitSettings) -> Self {
        Self {
            connection_by_ip: Limit {
                max: s.connections_per_ip_per_minute,
                window: Duration::from_secs(60),
            },
            message_by_session: Limit {
                max: s.messages_per_session_per_second,
                window: Duration::from_secs(1),
            },
            query_by_complexity: Limit {
                max: s.query_cost_per_session_per_minute,
                window: Duration::from_secs(60),
            },
            idle_ttl: Duration::from_millis(s.idle_bucket_ttl_ms),
        }
    }
}

/// A request was refused; retry after the given delay.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded for {scope}; retry after {retry_after:?}")]
pub struct RateLimited {
    /// Scope that refused the request.
    pub scope: Scope,
    /// Time until enough budget frees up.
    pub retry_after: Duration,
}

impl RateLimited {
    /// `retry_after` in whole milliseconds, rounded up.
    pub fn retry_after_ms(&self) -> u64 {
        let ms = self.retry_after.as_millis();
        let rounded = if self.retry_after.subsec_nanos() % 1_000_000 == 0 {
            ms
        } else {
            ms + 1
        };
        u64::try_from(rounded).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
struct Bucket {
    log: VecDeque<(Instant, u32)>,
    used: u32,
    last_seen: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            log: VecDeque::new(),
            used: 0,
            last_seen: now,
        }
    }

    fn evict(&mut self, window: Duration, now: Instant) {
        while let Some(&(at, cost)) = self.log.front() {
            if now.saturating_duration_since(at) < window {
                break;
            }
            self.used -= cost;
            let _ = self.log.pop_front();
        }
    }

    fn admit(&mut self, scope: Scope, limit: Limit, cost: u32, now: Instant) -> Result<(), RateLimited> {
        self.last_seen = now;
        self.evict(limit.window, now);
        if self.used.saturating_add(cost) <= limit.max {
            self.used += cost;
            self.log.push_back((now, cost));
            return Ok(());
        }
        // Walk the log until enough budget would have expired.
        let mut remaining = self.used;
        let mut retry_after = limit.window;
        if cost <= limit.max {
            for &(at, c) in &self.log {
                remaining -= c;
                if remaining + cost <= limit.max {
                    retry_after = (at + limit.window).saturating_duration_since(now);
                    break;
                }
            }
        }
        Err(RateLimited { scope, retry_after })
    }
}

/// Shared limiter for all scopes.
pub struct RateLimiter {
    limits: RateLimits,
    buckets: DashMap<(Scope, String), Mutex<Bucket>>,
}

impl RateLimiter {
    /// Create a limiter with the given limits.
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            buckets: DashMap::new(),
        }
    }

    /// Configured limits.
    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    /// Charge `cost` against `(scope, key)` now.
    pub fn check(&self, scope: Scope, key: &str, cost: u32) -> Result<(), RateLimited> {
        self.check_at(scope, key, cost, Instant::now())
    }

    /// Charge `cost` against `(scope, key)` at `now`. Refused requests are
    /// not recorded.
    pub fn check_at(&self, scope: Scope, key: &str, cost: u32, now: Instant) -> Result<(), RateLimited> {
        let limit = self.limits.limit(scope);
        let map_key = (scope, key.to_owned());
        if let Some(bucket) = self.buckets.get(&map_key) {
            return bucket.lock().admit(scope, limit, cost, now);
        }
        let bucket = self
            .buckets
            .entry(map_key)
            .or_insert_with(|| Mutex::new(Bucket::new(now)));
        let result = bucket.lock().admit(scope, limit, cost, now);
        result
    }

    /// Remove buckets idle for longer than the configured TTL. Returns how
    /// many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        let ttl = self.limits.idle_ttl;
        self.buckets.retain(|(scope, _), bucket| {
            let mut b = bucket.lock();
            b.evict(self.limits.limit(*scope).window, now);
            b.used > 0 || now.saturating_duration_since(b.last_seen) < ttl
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn limiter(max: u32) -> RateLimiter {
        let limit = Limit {
            max,
            window: Duration::from_secs(1),
        };
        RateLimiter::new(RateLimits {
            connection_by_ip: Limit {
                max,
                window: Duration::from_secs(60),
            },
            message_by_session: limit,
            query_by_complexity: limit,
            idle_ttl: Duration::from_secs(10),
        })
    }

    #[test]
    fn n_accepted_then_rejected_then_resumes() {
        let rl = limiter(3);
        let t0 = Instant::now();
        for _ in 0..3 {
            rl.check_at(Scope::MessageBySession, "s1", 1, t0).unwrap();
        }
        let err = rl.check_at(Scope::MessageBySession, "s1", 1, t0).unwrap_err();
        assert_eq!(err.scope, Scope::MessageBySession);
        assert_eq!(err.retry_after, Duration::from_secs(1));
        rl.check_at(Scope::MessageBySession, "s1", 1, t0 + Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn retry_after_tracks_oldest_entry() {
        let rl = limiter(2);
        let t0 = Instant::now();
        rl.check_at(Scope::MessageBySession, "s", 1, t0).unwrap();
        rl.check_at(Scope::MessageBySession, "s", 1, t0 + Duration::from_millis(400))
            .unwrap();
        let err = rl
            .check_at(Scope::MessageBySession, "s", 1, t0 + Duration::from_millis(500))
            .unwrap_err();
        assert_eq!(err.retry_after, Duration::from_millis(500));
        assert_eq!(err.retry_after_ms(), 500);
    }

    #[test]
    fn cost_is_weighted() {
        let rl = limiter(10);
        let now = Instant::now();
        rl.check_at(Scope::QueryByComplexity, "s", 7, now).unwrap();
        assert_matches!(
            rl.check_at(Scope::QueryByComplexity, "s", 4, now),
            Err(RateLimited { scope: Scope::QueryByComplexity, .. })
        );
        rl.check_at(Scope::QueryByComplexity, "s", 3, now).unwrap();
    }

    #[test]
    fn oversize_cost_never_fits() {
        let rl = limiter(5);
        let err = rl
            .check_at(Scope::QueryByComplexity, "s", 6, Instant::now())
            .unwrap_err();
        assert_eq!(err.retry_after, Duration::from_secs(1));
    }

    #[test]
    fn keys_and_scopes_are_independent() {
        let rl = limiter(1);
        let now = Instant::now();
        rl.check_at(Scope::MessageBySession, "a", 1, now).unwrap();
        rl.check_at(Scope::MessageBySession, "b", 1, now).unwrap();
        rl.check_at(Scope::QueryByComplexity, "a", 1, now).unwrap();
        assert!(rl.check_at(Scope::MessageBySession, "a", 1, now).is_err());
    }

    #[test]
    fn prune_removes_idle_buckets_only() {
        let rl = limiter(5);
        let t0 = Instant::now();
        rl.check_at(Scope::MessageBySession, "old", 1, t0).unwrap();
        rl.check_at(Scope::ConnectionByIp, "10.0.0.1", 1, t0).unwrap();
        let later = t0 + Duration::from_secs(11);
        rl.check_at(Scope::MessageBySession, "fresh", 1, later).unwrap();
        // "old" is idle and empty; the IP bucket still has an entry inside its 60s window.
        assert_eq!(rl.prune(later), 1);
        assert_eq!(rl.bucket_count(), 2);
    }

    #[test]
    fn limits_from_settings() {
        let limits = RateLimits::default();
        assert_eq!(limits.connection_by_ip.max, 60);
        assert_eq!(limits.message_by_session.window, Duration::from_secs(1));
        assert_eq!(limits.query_by_complexity.max, 120);
    }

    #[test]
    fn retry_after_ms_rounds_up() {
        let r = RateLimited {
            scope: Scope::MessageBySession,
            retry_after: Duration::from_micros(1_500),
        };
        assert_eq!(r.retry_after_ms(), 2);
    }
}
