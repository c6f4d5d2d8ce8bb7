//! Speed test client.
//!
//! Drives one full session against a running server: initiate, download while
//! hashing, read back the measured speed, then verify. Verification is skipped
//! when the local digest differs so the server keeps the artifact for
//! inspection.

use anyhow::Context;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tachyon_server::api::{InitRequest, InitResponse, SpeedResponse, VerifyRequest, VerifyResponse};
use tokio::io::AsyncWriteExt;

use crate::progress::DownloadProgress;

const SPEED_POLL_ATTEMPTS: usize = 20;
const SPEED_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Parameters of a client run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Server base URL, e.g. `http://127.0.0.1:8080`
    pub server: String,
    /// Requested size in MiB
    pub size_mb: u32,
    /// Save the downloaded artifact here
    pub keep: Option<PathBuf>,
}

/// Result of a client run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub session_id: String,
    pub size: u64,
    pub received: u64,
    pub expected_hash: String,
    pub computed_hash: String,
    pub client_elapsed: Duration,
    pub server_speed_mbps: f64,
    pub verified: bool,
}

impl RunSummary {
    /// Whether the received bytes hash to the advertised digest
    #[must_use]
    pub fn digest_matches(&self) -> bool {
        self.computed_hash == self.expected_hash
    }
}

/// HTTP client for a Tachyon server
pub struct SpeedTestClient {
    http: reqwest::Client,
    base: String,
}

impl SpeedTestClient {
    /// Create a client for `server`
    #[must_use]
    pub fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: server.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn init(&self, size_mb: u32) -> anyhow::Result<InitResponse> {
        let response = self
            .http
            .post(self.url("/download/init"))
            .json(&InitRequest { size_mb })
            .send()
            .await
            .context("failed to reach server")?;
        Ok(checked(response).await?.json().await?)
    }

    async fn download(
        &self,
        init: &InitResponse,
        keep: Option<&PathBuf>,
    ) -> anyhow::Result<(u64, String, Duration)> {
        let started = Instant::now();
        let response = self
            .http
            .get(self.url("/download/data"))
            .query(&[("session_id", init.session_id.as_str())])
            .send()
            .await?;
        let response = checked(response).await?;

        let mut file = match keep {
            Some(path) => Some(
                tokio::fs::File::create(path)
                    .await
                    .with_context(|| format!("failed to create {}", path.display()))?,
            ),
            None => None,
        };

        let progress = DownloadProgress::new(init.size, &init.session_id);
        let mut hasher = Sha256::new();
        let mut received = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    progress.abandon();
                    return Err(e).context("download interrupted");
                }
            };
            hasher.update(&chunk);
            if let Some(file) = file.as_mut() {
                file.write_all(&chunk).await?;
            }
            received += chunk.len() as u64;
            progress.advance(chunk.len() as u64);
        }

        if let Some(mut file) = file {
            file.flush().await?;
        }

        let elapsed = started.elapsed();
        progress.finish_with_message(format!("Downloaded {} bytes", received));
        Ok((received, hex::encode(hasher.finalize()), elapsed))
    }

    async fn speed(&self, session_id: &str) -> anyhow::Result<SpeedResponse> {
        let response = self
            .http
            .get(self.url("/download/speed"))
            .query(&[("session_id", session_id)])
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    /// Read the measured speed, allowing the server a moment to record it
    async fn measured_speed(&self, session_id: &str) -> anyhow::Result<SpeedResponse> {
        let mut speed = self.speed(session_id).await?;
        for _ in 0..SPEED_POLL_ATTEMPTS {
            if speed.download_speed_mbps > 0.0 {
                break;
            }
            tokio::time::sleep(SPEED_POLL_INTERVAL).await;
            speed = self.speed(session_id).await?;
        }
        Ok(speed)
    }

    async fn verify(&self, session_id: &str, computed_hash: &str) -> anyhow::Result<VerifyResponse> {
        let response = self
            .http
            .post(self.url("/download/verify"))
            .json(&VerifyRequest {
                session_id: session_id.to_string(),
                computed_hash: computed_hash.to_string(),
            })
            .send()
            .await?;
        Ok(checked(response).await?.json().await?)
    }

    /// Run a complete session
    ///
    /// # Errors
    ///
    /// Returns an error if any request fails or the server rejects it.
    pub async fn run(&self, options: &RunOptions) -> anyhow::Result<RunSummary> {
        let init = self.init(options.size_mb).await?;
        tracing::info!(
            session = %init.session_id,
            size = init.size,
            "Session initiated"
        );

        let (received, computed_hash, client_elapsed) =
            self.download(&init, options.keep.as_ref()).await?;

        let speed = if received == init.size {
            self.measured_speed(&init.session_id).await?
        } else {
            self.speed(&init.session_id).await?
        };

        let verified = if computed_hash == init.expected_hash {
            self.verify(&init.session_id, &computed_hash).await?;
            true
        } else {
            tracing::warn!(
                expected = %init.expected_hash,
                computed = %computed_hash,
                "Hash mismatch, skipping verification"
            );
            false
        };

        Ok(RunSummary {
            session_id: init.session_id,
            size: init.size,
            received,
            expected_hash: init.expected_hash,
            computed_hash,
            client_elapsed,
            server_speed_mbps: speed.download_speed_mbps,
            verified,
        })
    }
}

/// Turn a non-success response into an error carrying the server's message
async fn checked(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();

    match retry_after {
        Some(secs) => anyhow::bail!("server returned {status}: {body} (retry after {secs}s)"),
        None => anyhow::bail!("server returned {status}: {body}"),
    }
}
