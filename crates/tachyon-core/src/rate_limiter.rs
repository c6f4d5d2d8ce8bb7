//! Per-client admission control for session initiation.
//!
//! A client may start one session per cooldown window. The check and the
//! timestamp update happen under one lock so two concurrent requests from the
//! same client cannot both be admitted inside a single window.
//!
//! Entries are evicted once they are older than `retention_windows` cooldown
//! windows, which bounds the table to the clients seen recently.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum time between admitted initiations from one client
    pub cooldown: Duration,

    /// Number of cooldown windows an idle entry is kept before eviction
    pub retention_windows: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(10),
            retention_windows: 6,
        }
    }
}

impl RateLimitConfig {
    /// Age after which an entry is evicted
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.cooldown.saturating_mul(self.retention_windows.max(1))
    }
}

/// Identity used as the rate limiting key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Derive the identity of a request
    ///
    /// Uses the first entry of the forwarded-for header when present and
    /// non-empty, otherwise the peer address without its port.
    #[must_use]
    pub fn resolve(forwarded_for: Option<&str>, peer: &str) -> Self {
        if let Some(first) = forwarded_for
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|first| !first.is_empty())
        {
            return Self(first.to_string());
        }

        Self(strip_port(peer.trim()))
    }

    /// Identity of a peer socket address
    #[must_use]
    pub fn from_peer(addr: SocketAddr) -> Self {
        Self(addr.ip().to_string())
    }

    /// Identity as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn strip_port(addr: &str) -> String {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return socket.ip().to_string();
    }
    // Bare IPv6 addresses contain colons but no port
    if addr.parse::<std::net::Ipv6Addr>().is_ok() {
        return addr.to_string();
    }
    match addr.rfind(':') {
        Some(idx) => addr[..idx].to_string(),
        None => addr.to_string(),
    }
}

/// Admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request admitted; the client's window restarts now
    Granted,
    /// Request denied; the client may retry after the given delay
    Denied {
        /// Remaining cooldown
        retry_after: Duration,
    },
}

impl Admission {
    /// Whether the request was admitted
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Rate limiting metrics
#[derive(Debug, Default, Clone)]
pub struct RateLimitMetrics {
    /// Initiations admitted
    pub admitted: u64,

    /// Initiations denied
    pub denied: u64,

    /// Entries evicted as stale
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct LimiterState {
    last_admitted: HashMap<ClientIdentity, Instant>,
    metrics: RateLimitMetrics,
}

/// Cooldown based rate limiter keyed by client identity
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and record an initiation attempt
    pub async fn admit(&self, identity: &ClientIdentity) -> bool {
        self.check(identity).await.is_granted()
    }

    /// Check and record an initiation attempt, reporting the remaining cooldown on denial
    pub async fn check(&self, identity: &ClientIdentity) -> Admission {
        self.check_at(identity, Instant::now()).await
    }

    async fn check_at(&self, identity: &ClientIdentity, now: Instant) -> Admission {
        let mut state = self.state.lock().await;

        if let Some(last) = state.last_admitted.get(identity) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.config.cooldown {
                state.metrics.denied += 1;
                tracing::warn!(client = %identity, "Rate limit exceeded");
                return Admission::Denied {
                    retry_after: self.config.cooldown - elapsed,
                };
            }
        }

        state.last_admitted.insert(identity.clone(), now);
        state.metrics.admitted += 1;
        tracing::debug!(
            client = %identity,
            tracked = state.last_admitted.len(),
            "Access granted"
        );
        Admission::Granted
    }

    /// Remove entries that have been idle longer than the retention period
    ///
    /// Returns the number of evicted entries.
    pub async fn evict_stale(&self) -> usize {
        self.evict_stale_at(Instant::now()).await
    }

    async fn evict_stale_at(&self, now: Instant) -> usize {
        let retention = self.config.retention();
        let mut state = self.state.lock().await;

        let before = state.last_admitted.len();
        state
            .last_admitted
            .retain(|_, last| now.saturating_duration_since(*last) < retention);
        let evicted = before - state.last_admitted.len();
        state.metrics.evicted += evicted as u64;
        evicted
    }

    /// Number of tracked clients
    pub async fn tracked_clients(&self) -> usize {
        self.state.lock().await.last_admitted.len()
    }

    /// Get current metrics
    pub async fn metrics(&self) -> RateLimitMetrics {
        self.state.lock().await.metrics.clone()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
