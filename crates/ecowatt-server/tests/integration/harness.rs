//! Test harness for in-process ecowatt-server integration tests.
//!
//! Provides TestServer (real router on an ephemeral port, SQLite and artifact
//! directory in a tempdir), TestServerBuilder (config) and TestDevice (a
//! simulated EcoWatt device that seals uploads and opens replies).

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ecowatt_crypto::{EnvelopeKey, PayloadMode};
use ecowatt_fota::FsArtifactSource;
use ecowatt_server::config::ServerConfig;
use serde_json::{json, Value};
use tokio::sync::broadcast;

pub const PSK: &str = "integration-psk";
pub const TOKEN: &str = "integration-token";

/// A running in-process server.
pub struct TestServer {
    pub addr: String,
    pub config: ServerConfig,
    pub artifacts: FsArtifactSource,
    shutdown_tx: broadcast::Sender<()>,
    _tempdir: tempfile::TempDir,
    _handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pub fn device(&self, device_id: &str) -> TestDevice {
        TestDevice {
            device_id: device_id.into(),
            url: format!("http://{}/api/device/upload", self.addr),
            key: EnvelopeKey::new(
                self.config.envelope.psk.as_bytes(),
                self.config.envelope.payload_mode,
            ),
            token: self.config.auth.tokens.first().cloned(),
            nonce: 1_700_000_000_000,
            seq: 0,
        }
    }

    /// Authenticated GET returning (status_code, body_json).
    pub async fn api_get(&self, path: &str) -> anyhow::Result<(u16, Value)> {
        let url = format!("http://{}{}", self.addr, path);
        let resp = reqwest::Client::new()
            .get(&url)
            .header("Authorization", format!("Bearer {TOKEN}"))
            .send()
            .await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let val: Value = serde_json::from_str(&text).unwrap_or(json!({"_raw": text}));
        Ok((status, val))
    }
}

/// Builder for configuring and spawning a TestServer.
pub struct TestServerBuilder {
    payload_mode: PayloadMode,
    reject_stale_nonce: bool,
    stall_threshold: u32,
}

#[allow(dead_code)]
impl TestServerBuilder {
    pub fn new() -> Self {
        Self {
            payload_mode: PayloadMode::Base64,
            reject_stale_nonce: false,
            stall_threshold: 3,
        }
    }

    pub fn payload_mode(mut self, mode: PayloadMode) -> Self {
        self.payload_mode = mode;
        self
    }

    pub fn reject_stale_nonce(mut self, on: bool) -> Self {
        self.reject_stale_nonce = on;
        self
    }

    pub fn stall_threshold(mut self, n: u32) -> Self {
        self.stall_threshold = n;
        self
    }

    pub async fn build(self) -> anyhow::Result<TestServer> {
        let tempdir = tempfile::tempdir()?;

        let mut config = ServerConfig::default();
        config.server.database = tempdir.path().join("ecowatt.db").display().to_string();
        config.server.artifact_dir = tempdir.path().join("artifacts").display().to_string();
        config.auth.tokens = vec![TOKEN.to_string()];
        config.envelope.psk = PSK.to_string();
        config.envelope.payload_mode = self.payload_mode;
        config.envelope.reject_stale_nonce = self.reject_stale_nonce;
        config.fota.stall_threshold = self.stall_threshold;

        let state = ecowatt_server::build_state(&config)?;
        let artifacts = FsArtifactSource::open(tempdir.path().join("artifacts").as_path())?;

        // Bind on ephemeral port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let router = ecowatt_api::router(state);
        let shutdown = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            ecowatt_server::serve::serve_http(listener, router, shutdown)
                .await
                .ok();
        });

        Ok(TestServer {
            addr,
            config,
            artifacts,
            shutdown_tx,
            _tempdir: tempdir,
            _handle: handle,
        })
    }
}

/// Simulated device: builds delta-RLE uploads, seals them, opens replies.
pub struct TestDevice {
    pub device_id: String,
    url: String,
    key: EnvelopeKey,
    token: Option<String>,
    nonce: i64,
    seq: i64,
}

#[allow(dead_code)]
impl TestDevice {
    /// A telemetry upload with three samples of vac1/iac1/pac.
    pub fn telemetry(&mut self) -> Value {
        self.seq += 1;
        let order = vec!["vac1".to_string(), "iac1".to_string(), "pac".to_string()];
        let rows = vec![
            vec![2301, 52, 1200],
            vec![2302, 52, 1210],
            vec![2302, 53, 1210],
        ];
        let block = ecowatt_protocol::encode(&order, &rows).expect("valid rows");
        json!({
            "device_id": self.device_id,
            "ts_start": self.seq * 15_000,
            "ts_end": self.seq * 15_000 + 10_000,
            "seq": self.seq,
            "codec": "delta_rle_v1",
            "order": order,
            "block_b64": BASE64.encode(block),
            "orig_samples": 3,
            "orig_bytes": 18,
        })
    }

    /// Telemetry upload carrying a `fota` sub-object.
    pub fn with_fota(&mut self, fota: Value) -> Value {
        let mut body = self.telemetry();
        body["fota"] = fota;
        body
    }

    /// Seal `payload` and POST it. Returns (status, opened reply).
    pub async fn send(&mut self, payload: &Value) -> anyhow::Result<(u16, Value)> {
        self.nonce += 1;
        let envelope = self.key.wrap_with_nonce(payload, self.nonce).to_value();
        self.post(&envelope).await
    }

    /// POST `body` as-is (plain upload or hand-built envelope).
    pub async fn post(&self, body: &Value) -> anyhow::Result<(u16, Value)> {
        let mut req = reqwest::Client::new().post(&self.url).json(body);
        if let Some(token) = &self.token {
            req = req.header("Authorization", token.clone());
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await?;
        let reply = match self.key.unwrap(&body) {
            Ok(unwrapped) => unwrapped.into_payload(),
            Err(e) => anyhow::bail!("reply did not verify: {e}"),
        };
        Ok((status, reply))
    }

    /// POST without opening the reply. `auth` overrides the device token.
    pub async fn post_raw(&self, body: &Value, auth: Option<&str>) -> anyhow::Result<(u16, Value)> {
        let mut req = reqwest::Client::new().post(&self.url).json(body);
        if let Some(auth) = auth {
            req = req.header("Authorization", auth);
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;
        let val: Value = serde_json::from_str(&text).unwrap_or(json!({"_raw": text}));
        Ok((status, val))
    }

    /// Seal `payload` under a different key.
    pub fn forge(&self, payload: &Value, secret: &str) -> Value {
        EnvelopeKey::new(secret.as_bytes(), self.key.mode())
            .wrap_with_nonce(payload, self.nonce + 1)
            .to_value()
    }

    pub fn set_nonce(&mut self, nonce: i64) {
        self.nonce = nonce;
    }
}

/// Decode a chunk from a reply's `fota.data`.
#[allow(dead_code)]
pub fn chunk_bytes(reply: &Value) -> Option<Vec<u8>> {
    reply["fota"]["data"]
        .as_str()
        .and_then(|d| BASE64.decode(d).ok())
}
