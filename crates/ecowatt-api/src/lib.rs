//! EcoWatt API -- device upload endpoint and operator read endpoints.
//!
//! Devices POST one upload per polling cycle to `/api/device/upload`; the
//! reply always travels back inside an HMAC envelope. Operators read stored
//! uploads and FOTA progress through the `GET` routes.
//! Token auth from the `Authorization` header (optional `Basic`/`Bearer` prefix)
//! on every route except `/api/health`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ecowatt_crypto::{EnvelopeError, EnvelopeKey, Unwrapped};
use ecowatt_fota::{bounded, FotaEngine};
use ecowatt_protocol::{
    codec::checksum_matches,
    decode,
    samples::{device_ms, epoch_ms, format_row, scaled_value},
    Reply, UploadMessage, ValidatedUpload, CODEC_DELTA_RLE_V1,
};
use ecowatt_storage::{Storage, UploadWrite};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Per-device last accepted nonce. Opt-in; devices that reuse nonces are rejected.
#[derive(Default)]
pub struct ReplayGuard {
    last: Mutex<HashMap<String, i64>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `nonce` only if it is newer than the last one seen for `device`.
    pub fn check(&self, device: &str, nonce: i64) -> Result<(), EnvelopeError> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match last.get(device) {
            Some(&prev) if nonce <= prev => Err(EnvelopeError::StaleNonce { nonce, last: prev }),
            _ => {
                last.insert(device.to_string(), nonce);
                Ok(())
            }
        }
    }
}

/// Shared state for all API handlers.
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub fota: Arc<FotaEngine>,
    pub envelope: EnvelopeKey,
    /// Accepted `Authorization` tokens. Empty disables the check.
    pub auth_tokens: Vec<String>,
    pub replay_guard: Option<ReplayGuard>,
    pub store_timeout: Duration,
    pub start_time: Instant,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/device/upload", post(device_upload))
        .route("/api/health", get(health))
        .route("/api/uploads", get(uploads_list))
        .route("/api/upload/:id", get(upload_read))
        .route("/api/fota/progress", get(fota_progress_list))
        .route("/api/fota/progress/:device", get(fota_progress_read))
        .route("/api/fota/events", get(fota_events_all))
        .route("/api/fota/events/:device", get(fota_events_device))
        .route("/api/fota/versions/:device", get(fota_versions))
        .with_state(state)
}

// ============================================================================
// Auth (inline check)
// ============================================================================

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if state.auth_tokens.is_empty() {
        return Ok(());
    }

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .trim();
    let token = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("Basic "))
        .unwrap_or(auth)
        .trim();

    if state.auth_tokens.iter().any(|t| token_matches(t, token)) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "unauthorized" })),
        )
            .into_response())
    }
}

fn token_matches(expected: &str, presented: &str) -> bool {
    ring::constant_time::verify_slices_are_equal(expected.as_bytes(), presented.as_bytes()).is_ok()
}

// ============================================================================
// Device upload
// ============================================================================

fn wrapped(state: &AppState, status: StatusCode, reply: &Reply) -> Response {
    let envelope = state.envelope.wrap(&reply.to_value());
    (status, Json(envelope.to_value())).into_response()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn device_upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    let body: Value = match serde_json::from_slice(&body) {
        Ok(v @ Value::Object(_)) => v,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "invalid-json" })),
            )
                .into_response()
        }
    };

    let unwrapped = match state.envelope.unwrap(&body) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(error = %e, "envelope: rejected upload");
            return wrapped(&state, StatusCode::BAD_REQUEST, &Reply::error(e.code()));
        }
    };
    let nonce = unwrapped.nonce();
    if matches!(unwrapped, Unwrapped::Plain(_)) {
        tracing::debug!("envelope: plain upload accepted");
    }

    let upload = match UploadMessage::validate(unwrapped.payload()) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(error = %e, "upload: invalid message");
            return wrapped(&state, StatusCode::BAD_REQUEST, &Reply::error(e.code()));
        }
    };

    if let (Some(guard), Some(nonce)) = (&state.replay_guard, nonce) {
        if let Err(e) = guard.check(&upload.message.device_id, nonce) {
            tracing::warn!(device = %upload.message.device_id, error = %e, "envelope: stale nonce");
            return wrapped(&state, StatusCode::BAD_REQUEST, &Reply::error(e.code()));
        }
    }

    let reply = handle_upload(&state, upload).await;
    wrapped(&state, StatusCode::OK, &reply)
}

/// Side effects of one validated upload. Every step is fault-isolated.
async fn handle_upload(state: &AppState, upload: ValidatedUpload) -> Reply {
    let ValidatedUpload { message, block } = upload;
    let device = message.device_id.clone();
    let received_at = now_ms();

    // Same-device uploads serialize from here until the reply is built.
    let mut session = state.fota.lock_device(&device).await;

    let record = UploadWrite {
        device_id: device.clone(),
        ts_start: message.ts_start,
        ts_end: message.ts_end,
        seq: message.seq,
        codec: message.codec.clone(),
        order: message.order.clone(),
        ts_list: message.ts_list.clone(),
        orig_samples: message.orig_samples,
        orig_bytes: message.orig_bytes,
        received_at,
        block: block.clone(),
    };
    match store(state, "insert_upload", move |s| s.insert_upload(&record)).await {
        Ok(id) => tracing::debug!(device = %device, id, "upload: stored"),
        Err(e) => tracing::warn!(device = %device, error = %e, "upload: raw upload not stored"),
    }

    let reports = message.fota_reports();
    let fota = state.fota.turn(&device, &mut session, &reports).await;

    persist_sub_objects(state, &message, received_at).await;
    log_decoded(&message, &block, received_at);

    let mut reply = Reply::default();
    match state.fota.take_pending_config().await {
        Ok(config) => reply.config_update = config,
        Err(e) => tracing::warn!(device = %device, error = %e, "upload: pending config unreadable"),
    }
    match state.fota.take_pending_command().await {
        Ok(command) => reply.command = command,
        Err(e) => tracing::warn!(device = %device, error = %e, "upload: pending command unreadable"),
    }
    if !fota.reply.is_empty() {
        reply.fota = Some(fota.reply);
    }
    state.fota.release_device(&device, session);

    tracing::info!(
        device = %device,
        seq = ?message.seq,
        bytes = block.len(),
        phase = fota.phase.name(),
        config = reply.config_update.is_some(),
        command = reply.command.is_some(),
        "upload: handled"
    );
    reply
}

async fn store<T, F>(state: &AppState, op: &'static str, f: F) -> ecowatt_fota::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Storage) -> ecowatt_storage::Result<T> + Send + 'static,
{
    let storage = Arc::clone(&state.storage);
    bounded(state.store_timeout, op, move || Ok(f(storage.as_ref())?)).await
}

async fn persist_sub_objects(state: &AppState, message: &UploadMessage, received_at: i64) {
    let device = &message.device_id;

    let events = message.event_list();
    if !events.is_empty() {
        let key = device.clone();
        if let Err(e) = store(state, "insert_device_events", move |s| {
            s.insert_device_events(&key, received_at, &events)
        })
        .await
        {
            tracing::warn!(device = %device, error = %e, "upload: events not stored");
        }
    }

    let optional = [
        ("power_stats", message.power_stats.clone()),
        ("diag", message.diag.clone()),
        ("sim_fault", message.sim_fault.clone()),
    ];
    for (name, value) in optional {
        let Some(value) = value.filter(|v| !v.is_null()) else {
            continue;
        };
        let key = device.clone();
        let result = store(state, name, move |s| match name {
            "power_stats" => s.insert_power_stats(&key, received_at, &value),
            "diag" => s.insert_diag(&key, received_at, &value),
            _ => s.insert_sim_fault(&key, received_at, &value),
        })
        .await;
        if let Err(e) = result {
            tracing::warn!(device = %device, object = name, error = %e, "upload: sub-object not stored");
        }
    }
}

fn log_decoded(message: &UploadMessage, block: &[u8], received_at: i64) {
    let device = &message.device_id;
    if message.codec != CODEC_DELTA_RLE_V1 {
        tracing::debug!(device = %device, codec = %message.codec, "upload: codec not decoded");
        return;
    }

    let decoded = decode(block, &message.order);
    if !decoded.status.is_ok() {
        tracing::warn!(
            device = %device,
            status = %decoded.status,
            bytes = block.len(),
            "upload: block did not decode"
        );
        return;
    }

    let ratio = message
        .orig_bytes
        .filter(|&b| b > 0 && !block.is_empty())
        .map(|b| b as f64 / block.len() as f64);
    tracing::info!(
        device = %device,
        samples = decoded.rows.len(),
        fields = message.order.len(),
        ratio = ?ratio,
        "upload: block decoded"
    );

    if tracing::enabled!(tracing::Level::DEBUG) {
        let ts_list = message.timestamps();
        let times = epoch_ms(
            decoded.rows.len(),
            message.ts_start,
            message.ts_end,
            received_at,
            ts_list.as_deref(),
        );
        for (ts, row) in times.iter().zip(&decoded.rows) {
            tracing::debug!(device = %device, ts, "upload: {}", format_row(&message.order, row));
        }
    }
}

// ============================================================================
// Read endpoints
// ============================================================================

#[derive(Deserialize)]
pub struct ListQuery {
    pub device: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub uptime_secs: u64,
    pub fota_devices: usize,
    pub payload_mode: String,
}

/// Decoded view of one stored upload.
#[derive(Serialize)]
pub struct UploadView {
    pub id: i64,
    pub device_id: String,
    pub ts_start: i64,
    pub ts_end: i64,
    pub seq: Option<i64>,
    pub codec: String,
    pub order: Vec<String>,
    pub received_at: i64,
    pub block_bytes: usize,
    pub orig_samples: Option<i64>,
    pub orig_bytes: Option<i64>,
    pub status: String,
    pub checksum_ok: bool,
    pub rows: Vec<Vec<u16>>,
    pub scaled: Vec<Vec<f64>>,
    pub device_ms: Vec<i64>,
    pub epoch_ms: Vec<i64>,
}

fn internal(e: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// Liveness check for load balancers. Open to unauthenticated callers.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        uptime_secs: state.start_time.elapsed().as_secs(),
        fota_devices: state.fota.sessions().devices(),
        payload_mode: state.envelope.mode().to_string(),
    })
    .into_response()
}

async fn uploads_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state.storage.list_uploads(q.device.as_deref(), q.limit) {
        Ok(uploads) => Json(json!({ "uploads": uploads })).into_response(),
        Err(e) => internal(e),
    }
}

async fn upload_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    let row = match state.storage.read_upload(id) {
        Ok(Some(row)) => row,
        Ok(None) => return (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => return internal(e),
    };

    let (status, rows) = if row.codec == CODEC_DELTA_RLE_V1 {
        let decoded = decode(&row.block, &row.order);
        (decoded.status.to_string(), decoded.rows)
    } else {
        ("unsupported-codec".to_string(), Vec::new())
    };
    let scaled = rows
        .iter()
        .map(|r| {
            row.order
                .iter()
                .zip(r)
                .map(|(name, &raw)| scaled_value(name, raw))
                .collect()
        })
        .collect();
    let ts_list: Option<Vec<i64>> = match &row.ts_list {
        Some(Value::Array(items)) => items.iter().map(Value::as_i64).collect(),
        _ => None,
    };

    Json(UploadView {
        id: row.id,
        checksum_ok: checksum_matches(&row.block),
        device_ms: if rows.is_empty() {
            Vec::new()
        } else {
            device_ms(rows.len(), row.ts_start, row.ts_end)
        },
        epoch_ms: if rows.is_empty() {
            Vec::new()
        } else {
            epoch_ms(
                rows.len(),
                row.ts_start,
                row.ts_end,
                row.received_at,
                ts_list.as_deref(),
            )
        },
        block_bytes: row.block.len(),
        device_id: row.device_id,
        ts_start: row.ts_start,
        ts_end: row.ts_end,
        seq: row.seq,
        codec: row.codec,
        order: row.order,
        received_at: row.received_at,
        orig_samples: row.orig_samples,
        orig_bytes: row.orig_bytes,
        status,
        rows,
        scaled,
    })
    .into_response()
}

async fn fota_progress_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state.storage.list_progress() {
        Ok(progress) => Json(json!({ "progress": progress })).into_response(),
        Err(e) => internal(e),
    }
}

async fn fota_progress_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device): Path<String>,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    let session = state.fota.sessions().snapshot(&device).await;
    match state.storage.read_progress(&device) {
        Ok(Some(progress)) => {
            Json(json!({ "progress": progress, "session": session })).into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => internal(e),
    }
}

async fn fota_events_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state.storage.list_events(q.device.as_deref(), q.limit) {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => internal(e),
    }
}

async fn fota_events_device(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device): Path<String>,
    Query(q): Query<ListQuery>,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state.storage.list_events(Some(&device), q.limit) {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => internal(e),
    }
}

async fn fota_versions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(device): Path<String>,
) -> impl IntoResponse {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }

    match state.storage.list_versions(&device) {
        Ok(versions) => Json(json!({ "versions": versions })).into_response(),
        Err(e) => internal(e),
    }
}
