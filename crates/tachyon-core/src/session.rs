//! Session records and the session store.
//!
//! The store is the single source of truth for session state. Every read and
//! write (initiation, transfer bookkeeping, verification, reaping) serializes
//! on one mutex that guards both the active sessions and the speed results
//! retained after verification.
//!
//! # Lifecycle
//!
//! ```text
//!   initiate            transfer (0..n)           verify (digest match)
//!  ─────────► Pending ─────────────────► Served ─────────────────────► Verified
//!                │                          │                    (artifact deleted,
//!                │        reaper (age)      │                     speed retained)
//!                └──────────────┬───────────┘
//!                               ▼
//!                            Expired
//!                    (artifact + entry deleted)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{LifecycleError, Result};

/// Digest algorithm reported to clients
pub const DIGEST_ALGORITHM: &str = "sha256";

/// Opaque session identifier (random UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Artifact file name for this session
    #[must_use]
    pub fn artifact_file_name(&self) -> String {
        format!("{}.bin", self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| LifecycleError::InvalidRequest(format!("malformed session_id: {s}")))
    }
}

/// One outstanding speed test
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier
    pub id: SessionId,
    /// Generated artifact, owned by this session until deleted
    pub artifact_path: PathBuf,
    /// Lowercase hex digest of the full artifact content
    pub expected_digest: String,
    /// Digest algorithm name
    pub digest_algorithm: &'static str,
    /// Artifact size in bytes
    pub size_bytes: u64,
    /// Creation instant
    pub created_at: Instant,
    /// Last measured download speed (0.0 until a transfer completes)
    pub measured_speed_mbps: f64,
}

impl Session {
    /// Create a session for a freshly generated artifact
    #[must_use]
    pub fn new(
        id: SessionId,
        artifact_path: PathBuf,
        expected_digest: String,
        size_bytes: u64,
    ) -> Self {
        Self {
            id,
            artifact_path,
            expected_digest,
            digest_algorithm: DIGEST_ALGORITHM,
            size_bytes,
            created_at: Instant::now(),
            measured_speed_mbps: 0.0,
        }
    }

    /// Age relative to `now`
    #[must_use]
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Whether the session is older than `max_age`
    #[must_use]
    pub fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        self.age(now) > max_age
    }
}

/// Speed result, available while the session is active and after verification
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedRecord {
    /// Session identifier
    pub id: SessionId,
    /// Last measured download speed in Mbps
    pub speed_mbps: f64,
    /// Artifact size in bytes
    pub size_bytes: u64,
    /// Creation instant of the originating session
    pub created_at: Instant,
}

impl From<&Session> for SpeedRecord {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            speed_mbps: session.measured_speed_mbps,
            size_bytes: session.size_bytes,
            created_at: session.created_at,
        }
    }
}

/// State guarded by the store lock
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    pub(crate) active: HashMap<SessionId, Session>,
    pub(crate) verified: HashMap<SessionId, SpeedRecord>,
}

impl StoreState {
    /// Remove an active session and keep its speed result
    pub(crate) fn retire(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.active.remove(id)?;
        self.verified.insert(*id, SpeedRecord::from(&session));
        Some(session)
    }
}

/// Concurrent-safe registry of sessions
#[derive(Debug, Default)]
pub struct SessionStore {
    state: Mutex<StoreState>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the store lock for a compound operation
    pub(crate) async fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().await
    }

    /// Register a new session
    pub async fn insert(&self, session: Session) -> SessionId {
        let id = session.id;
        self.state.lock().await.active.insert(id, session);
        id
    }

    /// Snapshot an active session
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id is unknown or already retired.
    pub async fn get(&self, id: &SessionId) -> Result<Session> {
        self.state
            .lock()
            .await
            .active
            .get(id)
            .cloned()
            .ok_or(LifecycleError::SessionNotFound(*id))
    }

    /// Record the measured speed of a completed transfer (last write wins)
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session was verified or reaped while
    /// the transfer was in flight.
    pub async fn update_speed(&self, id: &SessionId, speed_mbps: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = state
            .active
            .get_mut(id)
            .ok_or(LifecycleError::SessionNotFound(*id))?;
        session.measured_speed_mbps = speed_mbps;
        Ok(())
    }

    /// Remove an active session without touching its artifact
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id is unknown or already removed.
    pub async fn remove(&self, id: &SessionId) -> Result<Session> {
        self.state
            .lock()
            .await
            .active
            .remove(id)
            .ok_or(LifecycleError::SessionNotFound(*id))
    }

    /// Look up the speed result for a session, active or verified
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id was never issued or has expired.
    pub async fn speed(&self, id: &SessionId) -> Result<SpeedRecord> {
        let state = self.state.lock().await;
        state
            .active
            .get(id)
            .map(SpeedRecord::from)
            .or_else(|| state.verified.get(id).copied())
            .ok_or(LifecycleError::SessionNotFound(*id))
    }

    /// Number of active sessions
    pub async fn len(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Whether there are no active sessions
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of retained speed results
    pub async fn retained_len(&self) -> usize {
        self.state.lock().await.verified.len()
    }
}
