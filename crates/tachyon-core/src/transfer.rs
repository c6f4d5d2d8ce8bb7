//! Transfer metering.
//!
//! A transfer streams a session's artifact to a client and times it. The
//! session is snapshotted under the store lock, the lock is released, and the
//! artifact is then read chunk by chunk through a [`MeteredStream`]. The clock
//! starts when the transport first polls the stream and stops when the chunk
//! carrying the last expected byte is handed over. The transport only asks for
//! the next chunk once the previous one has been accepted, so the measured
//! window covers the network transfer rather than a buffer fill.
//!
//! When the stream finishes, a recorder task converts the elapsed time into
//! megabits per second and writes it back through
//! [`SessionStore::update_speed`]. A failed, truncated or abandoned stream
//! records nothing.

use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{LifecycleError, Result};
use crate::session::{SessionId, SessionStore};

/// A boxed byte stream
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Convert a transfer of `size_bytes` over `elapsed` into megabits per second
///
/// Uses binary megabits: `(bytes * 8) / (seconds * 1024 * 1024)`. Returns
/// `None` when the result would not be a finite positive number.
#[must_use]
pub fn throughput_mbps(size_bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    let mbps = (size_bytes as f64 * 8.0) / (secs * 1024.0 * 1024.0);
    mbps.is_finite().then_some(mbps)
}

/// How a metered stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every byte was delivered
    Completed {
        /// Bytes delivered
        bytes: u64,
        /// Time from first poll to end-of-file
        elapsed: Duration,
    },
    /// The artifact could not be read to the end
    Failed {
        /// Bytes delivered before the failure
        bytes: u64,
    },
    /// The stream was dropped before completion (client went away)
    Aborted {
        /// Bytes delivered before the drop
        bytes: u64,
    },
}

/// Byte stream that reports its outcome when it ends
pub struct MeteredStream {
    inner: BoxStream<io::Result<Bytes>>,
    expected: u64,
    delivered: u64,
    started_at: Option<Instant>,
    outcome_tx: Option<oneshot::Sender<TransferOutcome>>,
}

impl MeteredStream {
    /// Wrap `inner`, which should yield exactly `expected` bytes
    pub fn new(
        inner: BoxStream<io::Result<Bytes>>,
        expected: u64,
    ) -> (Self, oneshot::Receiver<TransferOutcome>) {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let stream = Self {
            inner,
            expected,
            delivered: 0,
            started_at: None,
            outcome_tx: Some(outcome_tx),
        };
        (stream, outcome_rx)
    }

    /// Bytes delivered so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    fn finish(&mut self, outcome: TransferOutcome) {
        if let Some(tx) = self.outcome_tx.take() {
            // Receiver gone means nobody is recording
            let _ = tx.send(outcome);
        }
    }
}

impl Stream for MeteredStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let started_at = *this.started_at.get_or_insert_with(Instant::now);

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.delivered += chunk.len() as u64;
                // A transport that knows the length stops polling at the last
                // byte, so completion cannot wait for end-of-file
                if this.delivered == this.expected {
                    let bytes = this.delivered;
                    this.finish(TransferOutcome::Completed {
                        bytes,
                        elapsed: started_at.elapsed(),
                    });
                } else if this.delivered > this.expected {
                    let bytes = this.delivered;
                    this.finish(TransferOutcome::Failed { bytes });
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let bytes = this.delivered;
                this.finish(TransferOutcome::Failed { bytes });
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                let bytes = this.delivered;
                let outcome = if bytes == this.expected {
                    TransferOutcome::Completed {
                        bytes,
                        elapsed: started_at.elapsed(),
                    }
                } else {
                    TransferOutcome::Failed { bytes }
                };
                this.finish(outcome);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        let bytes = self.delivered;
        self.finish(TransferOutcome::Aborted { bytes });
    }
}

/// An in-flight transfer
pub struct Transfer {
    /// Session being served
    pub id: SessionId,
    /// Artifact size in bytes
    pub size_bytes: u64,
    /// Artifact bytes, metered
    pub stream: MeteredStream,
    /// Resolves to the recorded speed once the stream ends
    pub recorder: JoinHandle<Option<f64>>,
}

/// Streams artifacts and records the measured speed
#[derive(Debug, Clone)]
pub struct TransferTracker {
    store: Arc<SessionStore>,
    chunk_size: usize,
}

impl TransferTracker {
    /// Create a tracker over `store` reading artifacts in `chunk_size` pieces
    #[must_use]
    pub fn new(store: Arc<SessionStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Open the artifact of `id` for streaming
    ///
    /// The recorder task is spawned immediately and finishes when the returned
    /// stream ends or is dropped.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown or retired sessions and
    /// `ArtifactRead` if the artifact cannot be opened.
    pub async fn begin(&self, id: &SessionId) -> Result<Transfer> {
        let session = self.store.get(id).await?;

        let file = match tokio::fs::File::open(&session.artifact_path).await {
            Ok(file) => file,
            // Verified or reaped between the lookup and the open
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LifecycleError::SessionNotFound(*id));
            }
            Err(e) => {
                tracing::error!("Error opening artifact for session {}: {}", id, e);
                return Err(LifecycleError::ArtifactRead(e));
            }
        };

        let (stream, outcome_rx) =
            MeteredStream::new(read_chunks(file, self.chunk_size), session.size_bytes);

        let recorder = tokio::spawn(record_speed(
            Arc::clone(&self.store),
            session.id,
            session.size_bytes,
            outcome_rx,
        ));

        Ok(Transfer {
            id: session.id,
            size_bytes: session.size_bytes,
            stream,
            recorder,
        })
    }
}

fn read_chunks(file: tokio::fs::File, chunk_size: usize) -> BoxStream<io::Result<Bytes>> {
    Box::pin(futures_util::stream::try_unfold(
        file,
        move |mut file| async move {
            let mut buf = vec![0u8; chunk_size];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), file)))
        },
    ))
}

async fn record_speed(
    store: Arc<SessionStore>,
    id: SessionId,
    size_bytes: u64,
    outcome_rx: oneshot::Receiver<TransferOutcome>,
) -> Option<f64> {
    let outcome = outcome_rx.await.ok()?;

    let TransferOutcome::Completed { bytes, elapsed } = outcome else {
        tracing::debug!(session = %id, ?outcome, "Transfer did not complete, speed not recorded");
        return None;
    };

    let Some(mbps) = throughput_mbps(size_bytes, elapsed) else {
        tracing::debug!(session = %id, ?elapsed, "Transfer too fast to measure");
        return None;
    };

    match store.update_speed(&id, mbps).await {
        Ok(()) => {
            tracing::info!(
                session = %id,
                bytes,
                elapsed_ms = elapsed.as_millis() as u64,
                "Download speed for session {}: {:.2} Mbps",
                id,
                mbps
            );
            Some(mbps)
        }
        Err(_) => {
            tracing::debug!(session = %id, "Session gone before speed could be recorded");
            None
        }
    }
}
