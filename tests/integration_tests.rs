//! End-to-end tests for the Tachyon HTTP service
//!
//! Each test starts its own server on a loopback port and drives it with a
//! real HTTP client.

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tachyon_integration_tests::test_helpers::{TestServer, eventually};

async fn download_and_hash(server: &TestServer, session_id: &str) -> (u64, String) {
    let response = server.data(session_id).await;
    assert_eq!(response.status(), 200);
    let bytes = response.bytes().await.unwrap();
    (bytes.len() as u64, hex::encode(Sha256::digest(&bytes)))
}

/// Wait for the recorder task to store a non-zero speed
async fn wait_for_speed(server: &TestServer, id: &str) -> bool {
    eventually(Duration::from_secs(2), move || async move {
        server.speed_ok(id).await > 0.0
    })
    .await
}

fn session_id(body: &serde_json::Value) -> String {
    body["session_id"].as_str().unwrap().to_string()
}

// ============================================================================
// Initiation
// ============================================================================

#[tokio::test]
async fn test_ten_mebibyte_session_roundtrip() {
    let server = TestServer::start().await;

    let init = server.init_ok("198.51.100.1", 10).await;
    assert_eq!(init["size"], 10_485_760);
    assert_eq!(init["hash_algorithm"], "sha256");
    let expected = init["expected_hash"].as_str().unwrap();
    assert_eq!(expected.len(), 64);
    assert!(expected.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    let response = server.data(&session_id(&init)).await;
    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert_eq!(headers["content-type"], "application/octet-stream");
    assert_eq!(headers["cache-control"], "no-cache, no-store, must-revalidate");
    assert_eq!(headers["content-length"], "10485760");

    let bytes = response.bytes().await.unwrap();
    assert_eq!(bytes.len(), 10_485_760);
    assert_eq!(hex::encode(Sha256::digest(&bytes)), expected);

    server.shutdown().await;
}

#[tokio::test]
async fn test_small_sizes_match_their_digest() {
    let server = TestServer::start().await;

    for (n, size_mb) in [5u32, 10, 20].into_iter().enumerate() {
        let ip = format!("198.51.100.{}", 10 + n);
        let init = server.init_ok(&ip, size_mb).await;
        let (len, digest) = download_and_hash(&server, &session_id(&init)).await;

        assert_eq!(len, u64::from(size_mb) * 1024 * 1024);
        assert_eq!(init["size"], len);
        assert_eq!(init["expected_hash"], digest);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_size_rejected_without_side_effects() {
    let server = TestServer::start().await;

    for size_mb in [0u32, 1, 7, 15, 2000] {
        let response = server.init("198.51.100.20", size_mb).await;
        assert_eq!(response.status(), 400);
        let message = response.text().await.unwrap();
        assert!(message.contains("5, 10, 20, 50, 100, 200, 500, 1000"));
    }

    assert_eq!(server.artifact_count(), 0);
    assert_eq!(server.engine.active_sessions().await, 0);

    // Rejected sizes do not start the cooldown
    server.init_ok("198.51.100.20", 5).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_init_body() {
    let server = TestServer::start().await;

    for body in [r#"{"size_mb": "ten"}"#, r#"{"size_mb": -5}"#, "{}", "not json"] {
        let response = server
            .client
            .post(server.url("/download/init"))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "body {body:?}");
    }

    assert_eq!(server.artifact_count(), 0);
    server.shutdown().await;
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test]
async fn test_rate_limit_per_client() {
    let server = TestServer::start_with(|c| c.cooldown(Duration::from_millis(400))).await;

    server.init_ok("203.0.113.5", 5).await;

    let denied = server.init("203.0.113.5", 5).await;
    assert_eq!(denied.status(), 429);
    let retry_after: u64 = denied.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert_eq!(server.engine.active_sessions().await, 1);

    // Only the first forwarded-for entry counts
    let proxied = server.init("203.0.113.5, 10.0.0.1", 5).await;
    assert_eq!(proxied.status(), 429);

    // Other clients are unaffected
    server.init_ok("203.0.113.6", 5).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    server.init_ok("203.0.113.5", 5).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_initiations_admit_one() {
    let server = TestServer::start().await;

    let attempts = (0..8).map(|_| server.init("203.0.113.50", 5));
    let responses = futures_util::future::join_all(attempts).await;

    let granted = responses.iter().filter(|r| r.status() == 200).count();
    let denied = responses.iter().filter(|r| r.status() == 429).count();
    assert_eq!(granted, 1);
    assert_eq!(denied, 7);
    assert_eq!(server.engine.active_sessions().await, 1);

    server.shutdown().await;
}

// ============================================================================
// Speed measurement
// ============================================================================

#[tokio::test]
async fn test_speed_before_and_after_transfer() {
    let server = TestServer::start().await;
    let init = server.init_ok("198.51.100.30", 5).await;
    let id = session_id(&init);

    assert_eq!(server.speed_ok(&id).await, 0.0);
    assert_eq!(server.speed_ok(&id).await, 0.0);

    download_and_hash(&server, &id).await;

    // The speed is written by a task that runs once the last byte is sent
    assert!(wait_for_speed(&server, &id).await, "speed was not recorded");

    let first = server.speed_ok(&id).await;
    let second = server.speed_ok(&id).await;
    assert!(first.is_finite() && first > 0.0);
    assert_eq!(first, second);

    server.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_download_records_nothing() {
    let server = TestServer::start().await;
    let init = server.init_ok("198.51.100.31", 50).await;
    let id = session_id(&init);

    let response = server.data(&id).await;
    let mut stream = response.bytes_stream();
    let first = stream.next().await.unwrap().unwrap();
    assert!(!first.is_empty());
    drop(stream);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.speed_ok(&id).await, 0.0);

    // The session survives and can be downloaded again
    let (len, digest) = download_and_hash(&server, &id).await;
    assert_eq!(len, 50 * 1024 * 1024);
    assert_eq!(init["expected_hash"], digest);

    server.shutdown().await;
}

// ============================================================================
// Verification
// ============================================================================

#[tokio::test]
async fn test_verify_success_removes_artifact_and_keeps_speed() {
    let server = TestServer::start().await;
    let init = server.init_ok("198.51.100.40", 5).await;
    let id = session_id(&init);
    let artifact = server.artifact_dir().join(format!("{id}.bin"));
    assert!(artifact.exists());

    let (_, digest) = download_and_hash(&server, &id).await;
    assert!(wait_for_speed(&server, &id).await);
    let measured = server.speed_ok(&id).await;

    let response = server.verify(&id, &digest).await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "status": "success" }));

    assert!(!artifact.exists());
    assert_eq!(server.engine.active_sessions().await, 0);
    assert_eq!(server.data(&id).await.status(), 404);
    assert_eq!(server.speed_ok(&id).await, measured);

    // A second verification finds nothing
    assert_eq!(server.verify(&id, &digest).await.status(), 404);

    server.shutdown().await;
}

#[tokio::test]
async fn test_verify_mismatch_preserves_session() {
    let server = TestServer::start().await;
    let init = server.init_ok("198.51.100.41", 5).await;
    let id = session_id(&init);
    let expected = init["expected_hash"].as_str().unwrap();
    let artifact = server.artifact_dir().join(format!("{id}.bin"));

    let response = server.verify(&id, &"0".repeat(64)).await;
    assert_eq!(response.status(), 400);

    // Case matters
    let response = server.verify(&id, &expected.to_uppercase()).await;
    assert_eq!(response.status(), 400);

    assert!(artifact.exists());
    let (_, digest) = download_and_hash(&server, &id).await;
    assert_eq!(digest, expected);

    assert_eq!(server.verify(&id, expected).await.status(), 200);
    assert!(!artifact.exists());

    server.shutdown().await;
}

// ============================================================================
// Lookup errors
// ============================================================================

#[tokio::test]
async fn test_unknown_and_missing_session_ids() {
    let server = TestServer::start().await;
    let unknown = "6f1c7b0e-3c55-4d6b-9f0c-2a8e4b1d9c77";

    assert_eq!(server.data(unknown).await.status(), 404);
    assert_eq!(server.speed(unknown).await.status(), 404);
    assert_eq!(server.verify(unknown, "abc").await.status(), 404);

    assert_eq!(server.data("not-a-session").await.status(), 404);
    assert_eq!(server.speed("not-a-session").await.status(), 404);
    assert_eq!(server.verify("not-a-session", "abc").await.status(), 404);

    for path in ["/download/data", "/download/speed"] {
        let response = server.client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 400, "{path}");
    }

    let response = server
        .client
        .post(server.url("/download/verify"))
        .json(&serde_json::json!({ "session_id": unknown }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    server.shutdown().await;
}

// ============================================================================
// Reaping
// ============================================================================

#[tokio::test]
async fn test_expired_sessions_are_reaped() {
    let server = TestServer::start_with(|c| {
        c.max_age(Duration::from_millis(150))
            .sweep_interval(Duration::from_millis(50))
    })
    .await;

    let init = server.init_ok("198.51.100.50", 5).await;
    let id = session_id(&init);
    assert_eq!(server.artifact_count(), 1);

    let engine = &server.engine;
    let reaped = eventually(Duration::from_secs(3), move || async move {
        engine.active_sessions().await == 0
    })
    .await;
    assert!(reaped, "session was not reaped");

    assert_eq!(server.artifact_count(), 0);
    assert_eq!(server.data(&id).await.status(), 404);
    assert_eq!(server.speed(&id).await.status(), 404);
    assert_eq!(server.verify(&id, "abc").await.status(), 404);

    server.shutdown().await;
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_reports_active_sessions() {
    let server = TestServer::start().await;

    let body: serde_json::Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_sessions"], 0);

    server.init_ok("198.51.100.60", 5).await;
    server.init_ok("198.51.100.61", 5).await;

    let body: serde_json::Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["active_sessions"], 2);

    server.shutdown().await;
}
