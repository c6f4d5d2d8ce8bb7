//! # Tachyon Server
//!
//! HTTP surface of the download speed test service. Each route is a thin
//! adapter over [`LifecycleEngine`]; all lifecycle rules live in
//! `tachyon-core`.
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /download/init` | create a session and its artifact |
//! | `GET /download/data` | stream the artifact, timing the transfer |
//! | `POST /download/verify` | check the client digest, delete the artifact |
//! | `GET /download/speed` | report the measured throughput |
//! | `GET /health` | liveness and active session count |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod error;
mod handlers;

use axum::Router;
use axum::routing::{get, post};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tachyon_core::LifecycleEngine;
use tokio::net::TcpListener;

pub use error::ApiError;

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct AppState {
    /// Lifecycle engine
    pub engine: LifecycleEngine,
    /// Use the first `X-Forwarded-For` entry as the client identity
    pub trust_forwarded_for: bool,
}

impl AppState {
    /// State over `engine`, trusting `X-Forwarded-For`
    #[must_use]
    pub fn new(engine: LifecycleEngine) -> Self {
        Self {
            engine,
            trust_forwarded_for: true,
        }
    }

    /// Set whether `X-Forwarded-For` is trusted
    #[must_use]
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download/init", post(handlers::init))
        .route("/download/data", get(handlers::data))
        .route("/download/verify", post(handlers::verify))
        .route("/download/speed", get(handlers::speed))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` resolves
///
/// In-flight requests are drained before returning.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "HTTP server listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
