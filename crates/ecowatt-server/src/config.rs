//! Configuration types for ecowatt-server.
//! Parsed from ~/.ecowatt/config.toml, then overridden from the environment.

use ecowatt_crypto::PayloadMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub envelope: EnvelopeSection,
    #[serde(default)]
    pub fota: FotaSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// "http" or "unix".
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_socket")]
    pub socket: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            listen_addr: default_listen_addr(),
            socket: default_socket(),
            database: default_database(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Accepted `Authorization` tokens. Empty disables outer auth.
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSection {
    #[serde(default = "default_psk")]
    pub psk: String,
    #[serde(default)]
    pub payload_mode: PayloadMode,
    #[serde(default)]
    pub reject_stale_nonce: bool,
}

impl Default for EnvelopeSection {
    fn default() -> Self {
        Self {
            psk: default_psk(),
            payload_mode: PayloadMode::default(),
            reject_stale_nonce: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FotaSection {
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub artifact_timeout_ms: u64,
}

impl Default for FotaSection {
    fn default() -> Self {
        Self {
            stall_threshold: default_stall_threshold(),
            chunk_size: default_chunk_size(),
            store_timeout_ms: default_timeout_ms(),
            artifact_timeout_ms: default_timeout_ms(),
        }
    }
}

impl FotaSection {
    pub fn engine_config(&self) -> ecowatt_fota::FotaConfig {
        ecowatt_fota::FotaConfig {
            stall_threshold: self.stall_threshold,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            artifact_timeout: Duration::from_millis(self.artifact_timeout_ms),
        }
    }
}

// Default value functions
fn default_transport() -> String {
    "http".into()
}
fn default_listen_addr() -> String {
    "0.0.0.0:5000".into()
}
fn default_socket() -> String {
    "~/.ecowatt/ecowatt.sock".into()
}
fn default_database() -> String {
    "~/.ecowatt/ecowatt.db".into()
}
fn default_artifact_dir() -> String {
    "~/.ecowatt/artifacts".into()
}
fn default_psk() -> String {
    "ecowatt-demo-psk".into()
}
fn default_stall_threshold() -> u32 {
    ecowatt_protocol::STALL_THRESHOLD
}
fn default_chunk_size() -> u32 {
    ecowatt_protocol::DEFAULT_CHUNK_SIZE
}
fn default_timeout_ms() -> u64 {
    2000
}

impl ServerConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ServerConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `ECOWATT_*` environment overrides.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(psk) = var("ECOWATT_PSK") {
            self.envelope.psk = psk;
        }
        if let Some(tokens) = var("ECOWATT_AUTH_TOKENS") {
            self.auth.tokens = tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(db) = var("ECOWATT_DATABASE") {
            self.server.database = db;
        }
        if let Some(addr) = var("ECOWATT_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Some(dir) = var("ECOWATT_ARTIFACT_DIR") {
            self.server.artifact_dir = dir;
        }
        if let Some(mode) = var("ECOWATT_PAYLOAD_MODE") {
            self.envelope.payload_mode = mode.parse().map_err(|e: String| anyhow::anyhow!(e))?;
        }
        Ok(())
    }
}
