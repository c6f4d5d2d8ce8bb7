//! Digest verification.
//!
//! On a matching digest the artifact is deleted first and the session removed
//! second, both under the store lock so the reaper cannot delete the same
//! artifact concurrently. If deletion fails the session stays registered and
//! the caller gets `ArtifactDeletionFailed`; a retry or the reaper finishes the
//! job. The speed result is retained after removal.

use std::sync::Arc;

use crate::error::{LifecycleError, Result};
use crate::session::{SessionId, SessionStore, SpeedRecord};

/// Compares client digests and retires verified sessions
#[derive(Debug, Clone)]
pub struct Verifier {
    store: Arc<SessionStore>,
}

impl Verifier {
    /// Create a verifier over `store`
    #[must_use]
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Verify `client_digest` against the session's expected digest
    ///
    /// Comparison is exact and case-sensitive. On success the session's speed
    /// result is returned and remains available through the store.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` if the session is unknown, verified or reaped
    /// - `DigestMismatch` if the digests differ (nothing is changed)
    /// - `ArtifactDeletionFailed` if the artifact could not be removed (the
    ///   session is kept)
    pub async fn verify(&self, id: &SessionId, client_digest: &str) -> Result<SpeedRecord> {
        let mut state = self.store.lock().await;

        let session = state
            .active
            .get(id)
            .ok_or(LifecycleError::SessionNotFound(*id))?;

        if session.expected_digest != client_digest {
            tracing::info!(session = %id, "Hash mismatch");
            return Err(LifecycleError::DigestMismatch);
        }

        if let Err(source) = tokio::fs::remove_file(&session.artifact_path).await {
            tracing::error!("Error removing artifact for session {}: {}", id, source);
            return Err(LifecycleError::ArtifactDeletionFailed { id: *id, source });
        }

        let session = state
            .retire(id)
            .ok_or(LifecycleError::SessionNotFound(*id))?;
        tracing::info!(session = %id, speed_mbps = session.measured_speed_mbps, "Session verified");

        Ok(SpeedRecord::from(&session))
    }
}
