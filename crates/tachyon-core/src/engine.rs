//! Lifecycle engine.
//!
//! [`LifecycleEngine`] owns the session store, the rate limiter and the
//! component instances that operate on them. It is built once at startup and
//! shared by cheap clones with every request handler.
//!
//! # Example
//!
//! ```no_run
//! use tachyon_core::{ClientIdentity, EngineConfig, LifecycleEngine, SizeSelector};
//!
//! # async fn run() -> tachyon_core::Result<()> {
//! let engine = LifecycleEngine::start(EngineConfig::default()).await?;
//! let reaper = engine.spawn_reaper();
//!
//! let client = ClientIdentity::resolve(None, "127.0.0.1:50000");
//! let ticket = engine.initiate(&client, SizeSelector::Mib10).await?;
//! println!("{} -> {}", ticket.session_id, ticket.expected_digest);
//!
//! reaper.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::artifact::{ArtifactGenerator, SizeSelector};
use crate::config::EngineConfig;
use crate::error::{LifecycleError, Result};
use crate::rate_limiter::{Admission, ClientIdentity, RateLimiter};
use crate::reaper::{Reaper, ReaperHandle, SweepReport};
use crate::session::{DIGEST_ALGORITHM, Session, SessionId, SessionStore, SpeedRecord};
use crate::transfer::{Transfer, TransferTracker};
use crate::verifier::Verifier;

/// Information returned to a client when a session is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    /// New session identifier
    pub session_id: SessionId,
    /// Artifact size in bytes
    pub size_bytes: u64,
    /// Digest algorithm name
    pub digest_algorithm: &'static str,
    /// Lowercase hex digest the client should reproduce
    pub expected_digest: String,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<SessionStore>,
    limiter: Arc<RateLimiter>,
    generator: ArtifactGenerator,
    tracker: TransferTracker,
    verifier: Verifier,
}

/// Shared handle to the session lifecycle engine
#[derive(Clone)]
pub struct LifecycleEngine {
    inner: Arc<EngineInner>,
}

impl LifecycleEngine {
    /// Build an engine without touching the filesystem
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let store = Arc::new(SessionStore::new());
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let generator = ArtifactGenerator::new(&config.artifact_dir, config.chunk_size);
        let tracker = TransferTracker::new(Arc::clone(&store), config.chunk_size);
        let verifier = Verifier::new(Arc::clone(&store));

        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                limiter,
                generator,
                tracker,
                verifier,
            }),
        }
    }

    /// Build an engine and create its artifact directory
    ///
    /// # Errors
    ///
    /// Returns `ArtifactCreation` if the artifact directory cannot be created.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let engine = Self::new(config);
        engine.inner.generator.prepare().await?;
        tracing::info!(
            artifact_dir = %engine.inner.generator.dir().display(),
            "Lifecycle engine ready"
        );
        Ok(engine)
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Session store
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    /// Rate limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    /// Start a new session for `client`
    ///
    /// # Errors
    ///
    /// - `RateLimited` if the client is inside its cooldown window
    /// - `ArtifactCreation` if the artifact cannot be written
    pub async fn initiate(
        &self,
        client: &ClientIdentity,
        selector: SizeSelector,
    ) -> Result<SessionTicket> {
        if let Admission::Denied { retry_after } = self.inner.limiter.check(client).await {
            return Err(LifecycleError::RateLimited { retry_after });
        }

        let id = SessionId::new();
        let artifact = self.inner.generator.generate(&id, selector).await.map_err(|e| {
            tracing::error!("Error generating artifact: {}", e);
            e
        })?;

        let ticket = SessionTicket {
            session_id: id,
            size_bytes: artifact.size_bytes,
            digest_algorithm: DIGEST_ALGORITHM,
            expected_digest: artifact.digest.clone(),
        };

        self.inner
            .store
            .insert(Session::new(
                id,
                artifact.path,
                artifact.digest,
                artifact.size_bytes,
            ))
            .await;

        tracing::info!(session = %id, client = %client, size = %selector, "Session created");
        Ok(ticket)
    }

    /// Parse a MiB count and start a session
    ///
    /// The size is checked before the rate limiter is consulted, so a rejected
    /// size never consumes the client's window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSize` for sizes outside the allowed set, otherwise as
    /// [`LifecycleEngine::initiate`].
    pub async fn initiate_mebibytes(
        &self,
        client: &ClientIdentity,
        mebibytes: u32,
    ) -> Result<SessionTicket> {
        let selector = SizeSelector::from_mebibytes(mebibytes)?;
        self.initiate(client, selector).await
    }

    /// Begin streaming a session's artifact
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` or `ArtifactRead`.
    pub async fn transfer(&self, id: &SessionId) -> Result<Transfer> {
        self.inner.tracker.begin(id).await
    }

    /// Verify a client digest and retire the session on success
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound`, `DigestMismatch` or `ArtifactDeletionFailed`.
    pub async fn verify(&self, id: &SessionId, client_digest: &str) -> Result<SpeedRecord> {
        self.inner.verifier.verify(id, client_digest).await
    }

    /// Look up the measured speed of a session
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown or expired sessions.
    pub async fn speed(&self, id: &SessionId) -> Result<SpeedRecord> {
        self.inner.store.speed(id).await
    }

    /// Number of active sessions
    pub async fn active_sessions(&self) -> usize {
        self.inner.store.len().await
    }

    fn reaper(&self) -> Reaper {
        Reaper::new(
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.limiter),
            self.inner.config.reaper.clone(),
        )
    }

    /// Run one reclamation sweep now
    pub async fn sweep(&self) -> SweepReport {
        self.reaper().sweep_once().await
    }

    /// Start the periodic reaper
    #[must_use]
    pub fn spawn_reaper(&self) -> ReaperHandle {
        self.reaper().spawn()
    }
}

impl std::fmt::Debug for LifecycleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use sha2::{Digest, Sha256};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> LifecycleEngine {
        LifecycleEngine::start(EngineConfig::with_artifact_dir(dir.path().join("artifacts")))
            .await
            .unwrap()
    }

    fn client(n: u8) -> ClientIdentity {
        ClientIdentity::resolve(None, &format!("10.0.0.{n}:40000"))
    }

    #[tokio::test]
    async fn test_initiate_creates_session_and_artifact() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let ticket = engine.initiate(&client(1), SizeSelector::Mib10).await.unwrap();

        assert_eq!(ticket.size_bytes, 10 * 1024 * 1024);
        assert_eq!(ticket.digest_algorithm, "sha256");
        let session = engine.store().get(&ticket.session_id).await.unwrap();
        let data = std::fs::read(&session.artifact_path).unwrap();
        assert_eq!(data.len() as u64, ticket.size_bytes);
        assert_eq!(hex::encode(Sha256::digest(&data)), ticket.expected_digest);
    }

    #[tokio::test]
    async fn test_invalid_size_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let result = engine.initiate_mebibytes(&client(1), 7).await;

        assert!(matches!(result, Err(LifecycleError::InvalidSize(7))));
        assert_eq!(engine.active_sessions().await, 0);
        let files = std::fs::read_dir(&engine.config().artifact_dir).unwrap().count();
        assert_eq!(files, 0);
        // A rejected size does not consume the client's window
        assert!(engine.initiate_mebibytes(&client(1), 5).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limited_initiation() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        engine.initiate(&client(2), SizeSelector::Mib5).await.unwrap();
        let second = engine.initiate(&client(2), SizeSelector::Mib5).await;

        assert!(matches!(second, Err(LifecycleError::RateLimited { .. })));
        assert_eq!(engine.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_generation_failure_registers_nothing() {
        let dir = TempDir::new().unwrap();
        // Never prepared, so the directory does not exist
        let engine = LifecycleEngine::new(EngineConfig::with_artifact_dir(dir.path().join("nope")));

        let result = engine.initiate(&client(3), SizeSelector::Mib5).await;

        assert!(matches!(result, Err(LifecycleError::ArtifactCreation(_))));
        assert_eq!(engine.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;
        let ticket = engine.initiate(&client(4), SizeSelector::Mib5).await.unwrap();
        let id = ticket.session_id;

        // Speed is zero and stable before any transfer
        assert_eq!(engine.speed(&id).await.unwrap().speed_mbps, 0.0);
        assert_eq!(engine.speed(&id).await.unwrap().speed_mbps, 0.0);

        let transfer = engine.transfer(&id).await.unwrap();
        let mut hasher = Sha256::new();
        let mut stream = transfer.stream;
        while let Some(chunk) = stream.next().await {
            hasher.update(chunk.unwrap());
        }
        drop(stream);
        let measured = transfer.recorder.await.unwrap().unwrap();
        let digest = hex::encode(hasher.finalize());
        assert_eq!(digest, ticket.expected_digest);

        assert_eq!(engine.speed(&id).await.unwrap().speed_mbps, measured);
        assert_eq!(engine.speed(&id).await.unwrap().speed_mbps, measured);

        let record = engine.verify(&id, &digest).await.unwrap();
        assert_eq!(record.speed_mbps, measured);

        assert!(matches!(
            engine.transfer(&id).await,
            Err(LifecycleError::SessionNotFound(_))
        ));
        assert_eq!(engine.speed(&id).await.unwrap().speed_mbps, measured);
    }

    #[tokio::test]
    async fn test_verify_races_with_reaper() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::with_artifact_dir(dir.path()).max_age(Duration::ZERO);
        let engine = LifecycleEngine::start(config).await.unwrap();
        let ticket = engine.initiate(&client(5), SizeSelector::Mib5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let (verified, report) = tokio::join!(
            engine.verify(&ticket.session_id, &ticket.expected_digest),
            engine.sweep()
        );

        // Exactly one of them reclaimed the session
        match verified {
            Ok(_) => assert!(report.sessions_reaped.is_empty()),
            Err(LifecycleError::SessionNotFound(_)) => {
                assert_eq!(report.sessions_reaped, vec![ticket.session_id]);
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
        assert!(report.deletion_failures.is_empty());
        assert_eq!(engine.active_sessions().await, 0);
    }
}
