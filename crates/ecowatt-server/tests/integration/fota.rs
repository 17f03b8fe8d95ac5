//! End-to-end firmware delivery: stage, download every chunk, boot, clean up.

use crate::harness::{chunk_bytes, TestServerBuilder};
use ecowatt_fota::ArtifactSource;
use serde_json::json;

const CHUNK: u32 = 256;

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[tokio::test]
async fn test_full_update_over_http() {
    let server = TestServerBuilder::new().build().await.unwrap();
    let firmware = image(700);
    let manifest = server
        .artifacts
        .stage_firmware(&firmware, "1.0.4", CHUNK)
        .unwrap();
    assert_eq!(manifest.total_chunks(), 3);

    let mut device = server.device("EcoWatt-01");

    // First upload: manifest plus chunk 0
    let payload = device.telemetry();
    let (status, reply) = device.send(&payload).await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(reply["fota"]["manifest"]["version"], "1.0.4");
    assert_eq!(reply["fota"]["manifest"]["hash"], manifest.hash);
    assert_eq!(reply["fota"]["chunk_number"], 0);

    let mut received = chunk_bytes(&reply).unwrap();
    for n in 1..manifest.total_chunks() {
        let payload = device.with_fota(json!({ "next_chunk": n }));
        let (_, reply) = device.send(&payload).await.unwrap();
        assert!(reply["fota"].get("manifest").is_none());
        assert_eq!(reply["fota"]["chunk_number"], n);
        received.extend(chunk_bytes(&reply).unwrap());
    }
    assert_eq!(received, firmware);

    let (_, body) = server.api_get("/api/fota/progress/EcoWatt-01").await.unwrap();
    assert_eq!(body["progress"]["percent"], 100);

    let payload = device.with_fota(json!({ "verify": "ok", "apply": "ok", "boot_ok": true }));
    let (status, reply) = device.send(&payload).await.unwrap();
    assert_eq!(status, 200);
    assert!(reply.get("fota").is_none());

    assert!(server.artifacts.current_manifest().unwrap().is_none());
    assert!(server.artifacts.lowest_chunk().unwrap().is_none());

    let (_, body) = server.api_get("/api/fota/progress/EcoWatt-01").await.unwrap();
    assert_eq!(body["progress"]["status"], "boot_ok");

    let (_, body) = server.api_get("/api/fota/events/EcoWatt-01").await.unwrap();
    let kinds: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["kind"].as_str())
        .collect();
    for kind in ["manifest", "verify_ok", "boot_ok", "cleanup"] {
        assert!(kinds.contains(&kind), "missing {kind} event in {kinds:?}");
    }

    let (_, body) = server.api_get("/api/fota/versions/EcoWatt-01").await.unwrap();
    assert_eq!(body["versions"][0]["version"], "1.0.4");
    assert_eq!(body["versions"][0]["status"], "boot_ok");

    // Nothing staged any more: plain acknowledgement
    let payload = device.telemetry();
    let (_, reply) = device.send(&payload).await.unwrap();
    assert_eq!(reply, json!({}));

    server.shutdown().await;
}

#[tokio::test]
async fn test_stalled_device_is_reoffered() {
    let server = TestServerBuilder::new().stall_threshold(2).build().await.unwrap();
    server
        .artifacts
        .stage_firmware(&image(1000), "2.0.0", CHUNK)
        .unwrap();
    let mut device = server.device("EcoWatt-07");

    let payload = device.telemetry();
    let (_, reply) = device.send(&payload).await.unwrap();
    assert!(reply["fota"]["manifest"].is_object());

    // Device keeps asking for chunk 1 without advancing
    let mut reoffered = false;
    for _ in 0..4 {
        let payload = device.with_fota(json!({ "next_chunk": 1 }));
        let (_, reply) = device.send(&payload).await.unwrap();
        assert_eq!(reply["fota"]["chunk_number"], 1);
        if reply["fota"]["manifest"].is_object() {
            reoffered = true;
            break;
        }
    }
    assert!(reoffered, "stalled session was never re-offered");

    let (_, body) = server.api_get("/api/fota/events/EcoWatt-07").await.unwrap();
    assert!(body["events"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["kind"] == "manifest" && e["detail"].as_str().unwrap_or("").contains("stalled")));

    server.shutdown().await;
}

#[tokio::test]
async fn test_one_shot_config_delivered_once() {
    let server = TestServerBuilder::new().build().await.unwrap();
    server
        .artifacts
        .queue_config(&json!({ "sampling_interval": 5 }))
        .unwrap();
    let mut device = server.device("EcoWatt-01");

    let payload = device.telemetry();
    let (_, reply) = device.send(&payload).await.unwrap();
    assert_eq!(reply["config_update"], json!({ "sampling_interval": 5 }));

    let payload = device.telemetry();
    let (_, reply) = device.send(&payload).await.unwrap();
    assert!(reply.get("config_update").is_none());

    server.shutdown().await;
}
