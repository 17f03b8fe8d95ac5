//! EcoWatt Server -- library crate behind the `ecowatt-server` binary.
//!
//! Wires config, storage, artifact source, FOTA engine and the API router
//! together so integration tests can run the same stack in-process.

pub mod config;
pub mod serve;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use config::ServerConfig;
use ecowatt_api::{AppState, ReplayGuard};
use ecowatt_crypto::EnvelopeKey;
use ecowatt_fota::{ArtifactSource, FotaEngine, FsArtifactSource};
use ecowatt_storage::{SqliteStorage, Storage};

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Open storage and the artifact directory, and build the shared API state.
pub fn build_state(cfg: &ServerConfig) -> anyhow::Result<Arc<AppState>> {
    let db_path = expand_tilde(&cfg.server.database);
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(&db_path)?);
    tracing::info!(db = %db_path.display(), "storage opened");

    let artifact_dir = expand_tilde(&cfg.server.artifact_dir);
    let artifacts: Arc<dyn ArtifactSource> = Arc::new(FsArtifactSource::open(&artifact_dir)?);
    tracing::info!(dir = %artifact_dir.display(), "artifact source opened");

    let fota_config = cfg.fota.engine_config();
    let store_timeout = fota_config.store_timeout;
    let fota = Arc::new(FotaEngine::new(storage.clone(), artifacts, fota_config));

    if cfg.auth.tokens.is_empty() {
        tracing::warn!("auth: no tokens configured, Authorization header not checked");
    }

    Ok(Arc::new(AppState {
        storage,
        fota,
        envelope: EnvelopeKey::new(cfg.envelope.psk.as_bytes(), cfg.envelope.payload_mode),
        auth_tokens: cfg.auth.tokens.clone(),
        replay_guard: cfg.envelope.reject_stale_nonce.then(ReplayGuard::new),
        store_timeout,
        start_time: Instant::now(),
    }))
}
