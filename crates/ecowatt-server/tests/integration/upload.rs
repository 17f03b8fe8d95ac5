//! Telemetry upload path over real HTTP.

use crate::harness::{TestServerBuilder, TOKEN};
use serde_json::json;

#[tokio::test]
async fn test_enveloped_upload_is_stored_and_decoded() {
    let server = TestServerBuilder::new().build().await.unwrap();
    let mut device = server.device("EcoWatt-01");

    let payload = device.telemetry();
    let (status, reply) = device.send(&payload).await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(reply, json!({}));

    let (status, body) = server.api_get("/api/uploads?device=EcoWatt-01").await.unwrap();
    assert_eq!(status, 200);
    let uploads = body["uploads"].as_array().unwrap();
    assert_eq!(uploads.len(), 1);
    let id = uploads[0]["id"].as_i64().unwrap();

    let (status, view) = server.api_get(&format!("/api/upload/{id}")).await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(view["status"], "ok");
    assert_eq!(view["checksum_ok"], true);
    assert_eq!(
        view["rows"],
        json!([[2301, 52, 1200], [2302, 52, 1210], [2302, 53, 1210]])
    );
    assert_eq!(view["device_ms"].as_array().unwrap().len(), 3);

    server.shutdown().await;
}

#[tokio::test]
async fn test_raw_payload_mode() {
    let server = TestServerBuilder::new()
        .payload_mode(ecowatt_crypto::PayloadMode::Raw)
        .build()
        .await
        .unwrap();
    let mut device = server.device("EcoWatt-02");

    let payload = device.telemetry();
    let (status, _) = device.send(&payload).await.unwrap();
    assert_eq!(status, 200);

    let (_, body) = server.api_get("/api/uploads").await.unwrap();
    assert_eq!(body["uploads"].as_array().unwrap().len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let server = TestServerBuilder::new().build().await.unwrap();
    let mut device = server.device("EcoWatt-01");
    let payload = device.telemetry();

    let (status, body) = device.post_raw(&payload, None).await.unwrap();
    assert_eq!(status, 401);
    assert_eq!(body, json!({"ok": false, "error": "unauthorized"}));

    let (status, _) = device.post_raw(&payload, Some("Bearer wrong")).await.unwrap();
    assert_eq!(status, 401);

    let bearer = format!("Bearer {TOKEN}");
    let (status, _) = device.post_raw(&payload, Some(bearer.as_str())).await.unwrap();
    assert_eq!(status, 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_forged_envelope_is_rejected() {
    let server = TestServerBuilder::new().build().await.unwrap();
    let mut device = server.device("EcoWatt-01");
    let payload = device.telemetry();

    let forged = device.forge(&payload, "not-the-psk");
    let (status, reply) = device.post(&forged).await.unwrap();
    assert_eq!(status, 400);
    assert_eq!(reply, json!({"error": "bad-mac-or-nonce"}));

    let (_, body) = server.api_get("/api/uploads").await.unwrap();
    assert!(body["uploads"].as_array().unwrap().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_replay_guard_over_http() {
    let server = TestServerBuilder::new()
        .reject_stale_nonce(true)
        .build()
        .await
        .unwrap();
    let mut device = server.device("EcoWatt-01");
    let payload = device.telemetry();

    let (status, _) = device.send(&payload).await.unwrap();
    assert_eq!(status, 200);

    device.set_nonce(0);
    let (status, reply) = device.send(&payload).await.unwrap();
    assert_eq!(status, 400);
    assert_eq!(reply, json!({"error": "bad-mac-or-nonce"}));

    // Other devices keep their own nonce history
    let mut other = server.device("EcoWatt-02");
    other.set_nonce(0);
    let payload = other.telemetry();
    let (status, _) = other.send(&payload).await.unwrap();
    assert_eq!(status, 200);

    server.shutdown().await;
}

#[tokio::test]
async fn test_schema_error_is_wrapped() {
    let server = TestServerBuilder::new().build().await.unwrap();
    let mut device = server.device("EcoWatt-01");

    let mut payload = device.telemetry();
    payload.as_object_mut().unwrap().remove("order");
    let (status, reply) = device.send(&payload).await.unwrap();
    assert_eq!(status, 400);
    assert_eq!(reply, json!({"error": "missing-fields"}));

    server.shutdown().await;
}
