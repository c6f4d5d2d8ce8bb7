//! Error types for the session lifecycle engine.
//!
//! Errors fall into two classes:
//!
//! - **Client**: the request was wrong or arrived at the wrong time (bad size
//!   selector, throttled, unknown session, digest mismatch). No state is
//!   mutated and the caller may retry with a corrected request.
//! - **Storage**: creating, reading or deleting an artifact failed. These are
//!   server faults. A failed deletion during verification leaves the session
//!   in place so a retry or the reaper can finish the cleanup.

use crate::session::SessionId;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    // ============ Client Errors ============
    /// Requested size is not one of the allowed selectors
    #[error("invalid size {0} MiB, allowed values: {allowed}", allowed = crate::artifact::SizeSelector::allowed_list())]
    InvalidSize(u32),

    /// Request could not be interpreted
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Client started a session too recently
    #[error("rate limit exceeded, retry in {}s", .retry_after.as_secs().max(1))]
    RateLimited {
        /// Remaining cooldown before the next admission
        retry_after: Duration,
    },

    /// Session is unknown or has already been verified/reaped
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Client digest does not match the artifact digest
    #[error("digest mismatch")]
    DigestMismatch,

    // ============ Storage Errors ============
    /// Artifact could not be written or hashed
    #[error("artifact creation failed: {0}")]
    ArtifactCreation(#[source] std::io::Error),

    /// Artifact could not be opened or read for streaming
    #[error("artifact read failed: {0}")]
    ArtifactRead(#[source] std::io::Error),

    /// Artifact could not be removed; the session was kept
    #[error("artifact deletion failed for session {id}: {source}")]
    ArtifactDeletionFailed {
        /// Session whose artifact could not be removed
        id: SessionId,
        /// Underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Background task failed to complete
    #[error("task join error: {0}")]
    TaskJoin(String),
}

impl LifecycleError {
    /// Returns true if the error was caused by the request rather than the server
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LifecycleError::InvalidSize(_)
                | LifecycleError::InvalidRequest(_)
                | LifecycleError::RateLimited { .. }
                | LifecycleError::SessionNotFound(_)
                | LifecycleError::DigestMismatch
        )
    }

    /// Returns true if repeating the same request later may succeed
    ///
    /// Throttling clears once the cooldown elapses, a mismatched digest can be
    /// recomputed, and a failed deletion can be retried because the session
    /// is still registered.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LifecycleError::RateLimited { .. }
                | LifecycleError::DigestMismatch
                | LifecycleError::ArtifactDeletionFailed { .. }
        )
    }
}

impl From<tokio::task::JoinError> for LifecycleError {
    fn from(err: tokio::task::JoinError) -> Self {
        LifecycleError::TaskJoin(err.to_string())
    }
}

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
