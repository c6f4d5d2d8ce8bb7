//! Background reclamation of stale sessions.
//!
//! The reaper sweeps the store on a fixed interval. Sessions older than the
//! maximum age have their artifact deleted and their entry removed. A failed
//! deletion is logged and the session is left for the next sweep; it never
//! stops the sweep or the loop. Retained speed results past the same age are
//! dropped and stale rate limiter entries are evicted.
//!
//! The loop runs until [`ReaperHandle::shutdown`] is called or the handle is
//! dropped.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::rate_limiter::RateLimiter;
use crate::session::{SessionId, SessionStore};

/// Shortest period the sweep loop will tick at
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Reaper configuration
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Age after which a session is reclaimed
    pub max_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
        }
    }
}

/// Result of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose artifact and entry were removed
    pub sessions_reaped: Vec<SessionId>,
    /// Sessions kept because their artifact could not be deleted
    pub deletion_failures: Vec<SessionId>,
    /// Retained speed results dropped
    pub results_expired: usize,
    /// Rate limiter entries evicted
    pub clients_evicted: usize,
}

impl SweepReport {
    /// Whether the sweep changed anything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions_reaped.is_empty()
            && self.deletion_failures.is_empty()
            && self.results_expired == 0
            && self.clients_evicted == 0
    }
}

/// Periodic sweeper over the session store
#[derive(Debug, Clone)]
pub struct Reaper {
    store: Arc<SessionStore>,
    limiter: Arc<RateLimiter>,
    config: ReaperConfig,
}

impl Reaper {
    /// Create a reaper
    #[must_use]
    pub fn new(store: Arc<SessionStore>, limiter: Arc<RateLimiter>, config: ReaperConfig) -> Self {
        Self {
            store,
            limiter,
            config,
        }
    }

    /// Run one sweep now
    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: Instant) -> SweepReport {
        let max_age = self.config.max_age;
        let mut report = SweepReport::default();

        {
            let mut state = self.store.lock().await;

            let eligible: Vec<_> = state
                .active
                .values()
                .filter(|s| s.is_expired(now, max_age))
                .map(|s| (s.id, s.artifact_path.clone()))
                .collect();

            for (id, path) in eligible {
                tracing::info!("Cleaning up session: {}", id);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::debug!(session = %id, "Artifact already gone");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to delete file {}: {}", path.display(), e);
                        report.deletion_failures.push(id);
                        continue;
                    }
                }
                state.active.remove(&id);
                report.sessions_reaped.push(id);
            }

            let before = state.verified.len();
            state
                .verified
                .retain(|_, record| now.saturating_duration_since(record.created_at) <= max_age);
            report.results_expired = before - state.verified.len();
        }

        report.clients_evicted = self.limiter.evict_stale().await;

        if report.is_empty() {
            tracing::debug!("Sweep found nothing to reclaim");
        } else {
            tracing::info!(
                reaped = report.sessions_reaped.len(),
                failures = report.deletion_failures.len(),
                results_expired = report.results_expired,
                clients_evicted = report.clients_evicted,
                "Sweep complete"
            );
        }

        report
    }

    /// Start the periodic sweep loop
    ///
    /// The first sweep happens one interval after the call. Intervals below
    /// [`MIN_SWEEP_INTERVAL`] are raised to it.
    #[must_use]
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.interval.max(MIN_SWEEP_INTERVAL);

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!(?interval, max_age = ?self.config.max_age, "Reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Reaper stopped");
        });

        ReaperHandle {
            shutdown_tx,
            task: Some(task),
        }
    }
}

/// Handle to a running reaper loop
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the loop and wait for an in-progress sweep to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Reaper task ended abnormally: {}", e);
            }
        }
    }

    /// Whether the loop has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
