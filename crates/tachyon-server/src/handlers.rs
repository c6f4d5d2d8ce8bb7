//! Request handlers.

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use tachyon_core::{ClientIdentity, SessionId};

use crate::AppState;
use crate::api::{
    HealthResponse, InitRequest, InitResponse, SessionQuery, SpeedResponse, VerifyRequest,
    VerifyResponse,
};
use crate::error::ApiError;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Identity of the caller, honouring `X-Forwarded-For` when trusted
pub(crate) fn client_identity(
    headers: &HeaderMap,
    peer: SocketAddr,
    trust_forwarded: bool,
) -> ClientIdentity {
    let forwarded = trust_forwarded
        .then(|| headers.get(FORWARDED_FOR))
        .flatten()
        .and_then(|value| value.to_str().ok());

    match forwarded {
        Some(value) => ClientIdentity::resolve(Some(value), &peer.to_string()),
        None => ClientIdentity::from_peer(peer),
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    // Anything that is not a UUID cannot name a session
    raw.trim()
        .parse()
        .map_err(|_| ApiError::UnknownSession(raw.to_string()))
}

fn required_session_id(query: &SessionQuery) -> Result<SessionId, ApiError> {
    match query.session_id.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => parse_session_id(raw),
        _ => Err(ApiError::MissingSessionId),
    }
}

pub(crate) async fn init(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Result<Json<InitRequest>, JsonRejection>,
) -> Result<Json<InitResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidBody(e.body_text()))?;
    let client = client_identity(&headers, peer, state.trust_forwarded_for);

    let ticket = state
        .engine
        .initiate_mebibytes(&client, request.size_mb)
        .await?;

    Ok(Json(InitResponse::from(ticket)))
}

pub(crate) async fn data(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Response, ApiError> {
    let id = required_session_id(&query)?;
    let transfer = state.engine.transfer(&id).await?;

    tracing::debug!(session = %id, size = transfer.size_bytes, "Streaming artifact");

    let headers = [
        (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (header::CONTENT_LENGTH, transfer.size_bytes.to_string()),
    ];

    // The recorder task outlives the response and stores the speed on EOF
    Ok((StatusCode::OK, headers, Body::from_stream(transfer.stream)).into_response())
}

pub(crate) async fn verify(
    State(state): State<AppState>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidBody(e.body_text()))?;
    let id = parse_session_id(&request.session_id)?;

    state.engine.verify(&id, &request.computed_hash).await?;

    Ok(Json(VerifyResponse::success()))
}

pub(crate) async fn speed(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SpeedResponse>, ApiError> {
    let id = required_session_id(&query)?;
    let record = state.engine.speed(&id).await?;

    Ok(Json(SpeedResponse::from(record)))
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.engine.active_sessions().await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.0.2.10:51515".parse().unwrap()
    }

    #[test]
    fn test_identity_from_peer() {
        let identity = client_identity(&HeaderMap::new(), peer(), true);
        assert_eq!(identity.as_str(), "192.0.2.10");
    }

    #[test]
    fn test_identity_from_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );

        assert_eq!(client_identity(&headers, peer(), true).as_str(), "203.0.113.7");
        assert_eq!(client_identity(&headers, peer(), false).as_str(), "192.0.2.10");
    }

    #[test]
    fn test_empty_forwarded_for_falls_back_to_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static(""));
        assert_eq!(client_identity(&headers, peer(), true).as_str(), "192.0.2.10");
    }

    #[test]
    fn test_required_session_id() {
        assert!(matches!(
            required_session_id(&SessionQuery::default()),
            Err(ApiError::MissingSessionId)
        ));
        assert!(matches!(
            required_session_id(&SessionQuery {
                session_id: Some("  ".into())
            }),
            Err(ApiError::MissingSessionId)
        ));
        assert!(matches!(
            required_session_id(&SessionQuery {
                session_id: Some("not-a-session".into())
            }),
            Err(ApiError::UnknownSession(_))
        ));

        let id = SessionId::new();
        assert_eq!(
            required_session_id(&SessionQuery {
                session_id: Some(id.to_string())
            })
            .unwrap(),
            id
        );
    }
}
