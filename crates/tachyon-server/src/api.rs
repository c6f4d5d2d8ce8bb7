//! Request and response bodies.
//!
//! Field names are snake_case and stable; clients depend on them.

use serde::{Deserialize, Serialize};
use tachyon_core::{SessionTicket, SpeedRecord};

/// `POST /download/init` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    /// Requested size in MiB
    pub size_mb: u32,
}

/// `POST /download/init` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    /// Session identifier
    pub session_id: String,
    /// Artifact size in bytes
    pub size: u64,
    /// Digest algorithm, always `sha256`
    pub hash_algorithm: String,
    /// Lowercase hex digest of the artifact
    pub expected_hash: String,
}

impl From<SessionTicket> for InitResponse {
    fn from(ticket: SessionTicket) -> Self {
        Self {
            session_id: ticket.session_id.to_string(),
            size: ticket.size_bytes,
            hash_algorithm: ticket.digest_algorithm.to_string(),
            expected_hash: ticket.expected_digest,
        }
    }
}

/// Query string of the data and speed endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionQuery {
    /// Session identifier
    pub session_id: Option<String>,
}

/// `POST /download/verify` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// Session identifier
    pub session_id: String,
    /// Digest computed by the client
    pub computed_hash: String,
}

/// `POST /download/verify` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// Always `success`
    pub status: String,
}

impl VerifyResponse {
    /// Successful verification
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }
}

/// `GET /download/speed` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedResponse {
    /// Session identifier
    pub session_id: String,
    /// Measured throughput in Mbps, 0.0 until a transfer completes
    pub download_speed_mbps: f64,
}

impl From<SpeedRecord> for SpeedResponse {
    fn from(record: SpeedRecord) -> Self {
        Self {
            session_id: record.id.to_string(),
            download_speed_mbps: record.speed_mbps,
        }
    }
}

/// `GET /health` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: String,
    /// Sessions currently registered
    pub active_sessions: usize,
}
