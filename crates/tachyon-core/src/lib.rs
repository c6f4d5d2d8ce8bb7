//! # Tachyon Core
//!
//! Session lifecycle engine for the Tachyon download speed test service.
//!
//! A client asks for a session of a given size, downloads a freshly generated
//! random artifact, and proves it received the bytes intact by returning the
//! SHA-256 digest. The server times the download and reports throughput.
//!
//! This crate provides:
//! - Artifact generation with a streaming digest
//! - Per-client admission control
//! - A single-lock session store
//! - Metered artifact streaming with speed recording
//! - Digest verification and artifact deletion
//! - A periodic reaper for abandoned sessions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      LifecycleEngine                             │
//! │   (initiate, transfer, verify, speed, sweep)                    │
//! ├───────────────┬───────────────┬───────────────┬─────────────────┤
//! │  RateLimiter  │  Generator    │  Tracker      │  Verifier       │
//! │  (admission)  │  (artifacts)  │  (metering)   │  (digest check) │
//! ├───────────────┴───────────────┴───────────────┴─────────────────┤
//! │                      SessionStore                                │
//! │   (active sessions + retained speed results, one lock)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Reaper                                      │
//! │   (interval sweep of expired sessions and stale clients)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifact;
pub mod config;
pub mod engine;
pub mod error;
pub mod rate_limiter;
pub mod reaper;
pub mod session;
pub mod transfer;
pub mod verifier;

pub use artifact::{ArtifactGenerator, DEFAULT_CHUNK_SIZE, GeneratedArtifact, MIB, SizeSelector};
pub use config::EngineConfig;
pub use engine::{LifecycleEngine, SessionTicket};
pub use error::{LifecycleError, Result};
pub use rate_limiter::{Admission, ClientIdentity, RateLimitConfig, RateLimiter};
pub use reaper::{MIN_SWEEP_INTERVAL, Reaper, ReaperConfig, ReaperHandle, SweepReport};
pub use session::{DIGEST_ALGORITHM, Session, SessionId, SessionStore, SpeedRecord};
pub use transfer::{MeteredStream, Transfer, TransferOutcome, TransferTracker, throughput_mbps};
pub use verifier::Verifier;
