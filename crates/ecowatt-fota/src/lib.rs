//! EcoWatt FOTA -- per-device firmware update sessions over the upload channel.
//!
//! Each upload runs one turn of the session state machine while holding the
//! device's lock. Durable and artifact calls are synchronous and run on the
//! blocking pool under a timeout; their failures are logged, never fatal.

pub mod artifacts;
pub mod session;

pub use artifacts::{ArtifactSource, FsArtifactSource, MemoryArtifactSource, OneShot};
pub use session::{offer_reason, FotaSession, OfferReason, SessionPhase};

use ecowatt_protocol::{FotaReply, FotaReport, Manifest, STALL_THRESHOLD};
use ecowatt_storage::{ProgressRow, ProgressStatus, ProgressUpdate, Storage, VersionRecord};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, thiserror::Error)]
pub enum FotaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("chunk is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("storage error: {0}")]
    Storage(#[from] ecowatt_storage::StorageError),
    #[error("{op} timed out after {ms}ms")]
    Timeout { op: &'static str, ms: u64 },
    #[error("blocking task failed: {0}")]
    Join(String),
    #[error("chunk size must be non-zero")]
    InvalidChunkSize,
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, FotaError>;

#[derive(Debug, Clone)]
pub struct FotaConfig {
    /// Non-advancing uploads before the manifest is offered again.
    pub stall_threshold: u32,
    pub store_timeout: Duration,
    pub artifact_timeout: Duration,
}

impl Default for FotaConfig {
    fn default() -> Self {
        Self {
            stall_threshold: STALL_THRESHOLD,
            store_timeout: Duration::from_millis(2000),
            artifact_timeout: Duration::from_millis(2000),
        }
    }
}

// ============================================================================
// Session registry
// ============================================================================

type Slot = Arc<AsyncMutex<Option<FotaSession>>>;

/// Device id -> session slot. One async lock per device.
#[derive(Default)]
pub struct SessionRegistry {
    slots: std::sync::Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, device: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(device.to_string()).or_default())
    }

    /// Lock the device's slot. Same-device callers queue; other devices are unaffected.
    pub async fn lock(&self, device: &str) -> OwnedMutexGuard<Option<FotaSession>> {
        self.slot(device).lock_owned().await
    }

    /// Unlock after a turn. A slot left without a session is dropped from the
    /// map once no other caller holds or waits on it.
    pub fn release(&self, device: &str, guard: OwnedMutexGuard<Option<FotaSession>>) {
        let cleared = guard.is_none();
        drop(guard);
        if !cleared {
            return;
        }

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = slots.get(device).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|s| s.is_none())
        });
        if idle {
            slots.remove(device);
        }
    }

    /// Current session, without creating a slot for unknown devices.
    pub async fn snapshot(&self, device: &str) -> Option<FotaSession> {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.get(device).cloned()
        }?;
        let session = slot.lock().await;
        session.clone()
    }

    /// Devices with a live session. Slots locked mid-turn count as live.
    pub fn devices(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.try_lock().map_or(true, |s| s.is_some()))
            .count()
    }

    /// Slots currently held in the map.
    pub fn tracked(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Run a synchronous call on the blocking pool, bounded by `timeout`.
pub async fn bounded<T, F>(timeout: Duration, op: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(FotaError::Join(join.to_string())),
        Err(_) => Err(FotaError::Timeout {
            op,
            ms: timeout.as_millis() as u64,
        }),
    }
}

/// Run a synchronous call on the blocking pool and wait for it to finish.
///
/// For calls with effects the caller must observe: a timed-out take or
/// delete keeps running on the blocking pool after the caller has moved on.
/// Calls slower than `warn_after` are logged.
pub async fn settled<T, F>(warn_after: Duration, op: &'static str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let started = std::time::Instant::now();
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|join| FotaError::Join(join.to_string()))?;
    let elapsed = started.elapsed();
    if elapsed > warn_after {
        tracing::warn!(
            op,
            elapsed_ms = elapsed.as_millis() as u64,
            "fota: slow artifact call"
        );
    }
    result
}

// ============================================================================
// Engine
// ============================================================================

/// What one turn decided.
#[derive(Debug, Clone, Default)]
pub struct FotaOutcome {
    pub reply: FotaReply,
    pub phase: SessionPhase,
    pub offered: Option<OfferReason>,
    pub cleaned_up: bool,
}

pub struct FotaEngine {
    storage: Arc<dyn Storage>,
    artifacts: Arc<dyn ArtifactSource>,
    sessions: SessionRegistry,
    config: FotaConfig,
}

impl FotaEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        artifacts: Arc<dyn ArtifactSource>,
        config: FotaConfig,
    ) -> Self {
        Self {
            storage,
            artifacts,
            sessions: SessionRegistry::new(),
            config,
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactSource> {
        &self.artifacts
    }

    pub async fn lock_device(&self, device: &str) -> OwnedMutexGuard<Option<FotaSession>> {
        self.sessions.lock(device).await
    }

    /// Lock the device and run one turn.
    pub async fn process(&self, device: &str, reports: &[FotaReport]) -> FotaOutcome {
        let mut session = self.lock_device(device).await;
        let outcome = self.turn(device, &mut session, reports).await;
        self.sessions.release(device, session);
        outcome
    }

    /// Unlock a device locked with [`FotaEngine::lock_device`].
    pub fn release_device(&self, device: &str, session: OwnedMutexGuard<Option<FotaSession>>) {
        self.sessions.release(device, session);
    }

    /// Pending one-shot config. Waited on to completion: the take clears the slot.
    pub async fn take_pending_config(&self) -> Result<Option<serde_json::Value>> {
        self.artifact_settled("take_pending_config", |a| a.take_pending_config())
            .await
    }

    pub async fn take_pending_command(&self) -> Result<Option<serde_json::Value>> {
        self.artifact_settled("take_pending_command", |a| a.take_pending_command())
            .await
    }

    /// One upload's worth of FOTA processing. Caller holds the device lock.
    ///
    /// Order: progress accounting, verify/apply audit, failure, completion,
    /// manifest check, chunk dispensing.
    pub async fn turn(
        &self,
        device: &str,
        session: &mut Option<FotaSession>,
        reports: &[FotaReport],
    ) -> FotaOutcome {
        let mut outcome = FotaOutcome::default();

        let declared = reports.iter().find_map(|r| match r {
            FotaReport::Progress { next_chunk } => Some(*next_chunk),
            _ => None,
        });

        // 1. Progress accounting (observe only)
        if let Some(next_chunk) = declared {
            if let Some(s) = session.as_mut() {
                let advanced = s.record_progress(next_chunk);
                tracing::debug!(
                    device,
                    next_chunk,
                    advanced,
                    cycles = s.cycles_without_progress,
                    "fota: progress"
                );
            }
            self.note_event(device, "progress", format!("next={next_chunk}"))
                .await;
        }

        // 2. Verify/apply audit, failure reports
        for report in reports {
            match report {
                FotaReport::VerifyResult { ok } => {
                    let kind = if *ok { "verify_ok" } else { "verify_fail" };
                    self.note_event(device, kind, String::new()).await;
                    if let Some(s) = session.as_ref() {
                        let status = if *ok { "verify_ok" } else { "verify_failed" };
                        self.note_version(device, s.version.clone(), s.size, s.hash.clone(), status)
                            .await;
                    }
                }
                FotaReport::ApplyResult { ok } => {
                    let kind = if *ok { "apply_ok" } else { "apply_fail" };
                    self.note_event(device, kind, String::new()).await;
                }
                FotaReport::Failure { reason, version } => {
                    self.handle_failure(device, session.as_ref(), reason, version.as_deref())
                        .await;
                }
                FotaReport::Progress { .. } | FotaReport::BootOk => {}
            }
        }

        // 3. Completion
        let mut manifest_checked = None;
        if reports.contains(&FotaReport::BootOk) {
            let manifest = self.current_manifest(device).await;
            outcome.cleaned_up = self.handle_boot_ok(device, session, manifest.as_ref()).await;
            manifest_checked = Some(manifest);
        }

        // 4. Manifest availability
        let manifest = match manifest_checked {
            Some(_) if outcome.cleaned_up => None,
            Some(manifest) => manifest,
            None => self.current_manifest(device).await,
        };
        if let Some(manifest) = manifest {
            if let Some(reason) =
                offer_reason(session.as_ref(), &manifest, self.config.stall_threshold)
            {
                self.offer_manifest(device, session, &manifest, reason).await;
                outcome.reply.manifest = Some(manifest);
                outcome.offered = Some(reason);
            }
        }

        // 5. Chunk dispensing. A device reporting failure or boot is past
        // downloading unless it was just handed a new manifest.
        let finished = reports
            .iter()
            .any(|r| matches!(r, FotaReport::Failure { .. } | FotaReport::BootOk));
        if let Some(s) = session.as_mut().filter(|_| !finished || outcome.offered.is_some()) {
            self.dispense_chunk(device, s, declared, &mut outcome.reply)
                .await;
        }

        outcome.phase = SessionPhase::of(session.as_ref());
        outcome
    }

    async fn offer_manifest(
        &self,
        device: &str,
        session: &mut Option<FotaSession>,
        manifest: &Manifest,
        reason: OfferReason,
    ) {
        match session.as_mut() {
            Some(s) => s.reoffer(manifest),
            None => *session = Some(FotaSession::seeded(manifest)),
        }
        let written = session.as_ref().map_or(0, |s| s.written_bytes);

        tracing::info!(
            device,
            version = %manifest.version,
            size = manifest.size,
            reason = reason.name(),
            "fota: manifest offered"
        );
        self.note_event(
            device,
            "manifest",
            format!("v={} reason={}", manifest.version, reason.name()),
        )
        .await;
        self.note_progress(ProgressUpdate {
            device: device.to_string(),
            version: manifest.version.clone(),
            size: manifest.size,
            written,
            status: ProgressStatus::Pending,
        })
        .await;
        self.note_version(
            device,
            manifest.version.clone(),
            manifest.size,
            manifest.hash.clone(),
            "offered",
        )
        .await;
    }

    async fn dispense_chunk(
        &self,
        device: &str,
        session: &mut FotaSession,
        declared: Option<u32>,
        reply: &mut FotaReply,
    ) {
        let chunk_num = match declared {
            Some(n) => Some(n),
            None => match self.artifact("lowest_chunk", |a| a.lowest_chunk()).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(device, error = %e, "fota: lowest chunk lookup failed");
                    None
                }
            },
        };
        let Some(n) = chunk_num else {
            return;
        };

        let bytes = match self.artifact("read_chunk", move |a| a.read_chunk(n)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::debug!(device, chunk = n, "fota: chunk not staged");
                return;
            }
            Err(e) => {
                tracing::warn!(device, chunk = n, error = %e, "fota: chunk read failed");
                return;
            }
        };

        reply.attach_chunk(n, &bytes);
        session.mark_served(n);
        tracing::info!(
            device,
            chunk = n,
            bytes = bytes.len(),
            written = session.written_bytes,
            size = session.size,
            "fota: chunk served"
        );

        self.note_event(device, "chunk", format!("n={n} bytes={}", bytes.len()))
            .await;
        self.note_progress(ProgressUpdate {
            device: device.to_string(),
            version: session.version.clone(),
            size: session.size,
            written: session.written_bytes,
            status: ProgressStatus::Downloading,
        })
        .await;
    }

    async fn handle_failure(
        &self,
        device: &str,
        session: Option<&FotaSession>,
        reason: &str,
        version: Option<&str>,
    ) {
        let status = if reason.to_ascii_lowercase().contains("rollback") {
            ProgressStatus::BootRollback
        } else {
            ProgressStatus::VerifyFailed
        };
        tracing::warn!(device, reason, status = %status, "fota: device reported failure");
        self.note_event(device, "failure", reason.to_string()).await;

        let durable = if session.is_none() {
            self.read_progress(device).await
        } else {
            None
        };
        let (session_version, size, written, hash) = match (session, durable.as_ref()) {
            (Some(s), _) => (Some(s.version.clone()), s.size, s.written_bytes, s.hash.clone()),
            (None, Some(p)) => (Some(p.version.clone()), p.size, p.written, String::new()),
            (None, None) => (None, 0, 0, String::new()),
        };
        let Some(version) = version.map(str::to_string).or(session_version) else {
            return;
        };

        self.note_progress(ProgressUpdate {
            device: device.to_string(),
            version: version.clone(),
            size,
            written,
            status,
        })
        .await;
        self.note_version(device, version, size, hash, status.as_str())
            .await;
    }

    /// Cleanup after a confirmed boot. Returns true when the update was closed out.
    async fn handle_boot_ok(
        &self,
        device: &str,
        session: &mut Option<FotaSession>,
        manifest: Option<&Manifest>,
    ) -> bool {
        self.note_event(device, "boot_ok", String::new()).await;

        let durable = self.read_progress(device).await;
        let served = session
            .as_ref()
            .map(|s| s.version.clone())
            .or_else(|| durable.as_ref().map(|p| p.version.clone()));

        let Some(manifest) = manifest else {
            return self
                .finish_unstaged(device, session, durable.as_ref())
                .await;
        };
        if served.as_deref() != Some(manifest.version.as_str()) {
            tracing::warn!(
                device,
                served = ?served,
                current = %manifest.version,
                "fota: boot_ok for a version other than the staged one, cleanup skipped"
            );
            return false;
        }
        let complete = durable
            .as_ref()
            .is_some_and(|p| p.version == manifest.version && p.is_complete());
        if !complete {
            tracing::warn!(
                device,
                version = %manifest.version,
                written = durable.as_ref().map(|p| p.written),
                size = manifest.size,
                "fota: boot_ok before all bytes were served, cleanup skipped"
            );
            return false;
        }

        let version = manifest.version.clone();
        let removed = {
            let version = version.clone();
            self.artifact_settled("delete_manifest_and_chunks", move |a| {
                a.delete_manifest_and_chunks(&version)
            })
            .await
        };
        match removed {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(device, version = %version, "fota: manifest changed before cleanup");
                return false;
            }
            Err(e) => {
                tracing::warn!(device, version = %version, error = %e, "fota: cleanup failed");
                return false;
            }
        }

        self.complete_update(device, session, version, manifest.size, manifest.hash.clone())
            .await;
        true
    }

    /// boot_ok with nothing staged. The artifacts of a fully served update may
    /// already be gone (an earlier cleanup or the operator); close it out
    /// from the session, or the durable record when the session was lost.
    async fn finish_unstaged(
        &self,
        device: &str,
        session: &mut Option<FotaSession>,
        durable: Option<&ProgressRow>,
    ) -> bool {
        let served = match (session.as_ref(), durable) {
            (Some(s), Some(p)) if s.is_complete() && p.version == s.version && p.is_complete() => {
                Some((s.version.clone(), s.size, s.hash.clone()))
            }
            (None, Some(p)) if p.is_complete() && p.status != ProgressStatus::BootOk => {
                Some((p.version.clone(), p.size, String::new()))
            }
            _ => None,
        };
        let Some((version, size, hash)) = served else {
            tracing::warn!(device, "fota: boot_ok with no staged manifest, nothing to clean");
            return false;
        };

        tracing::info!(device, version = %version, "fota: artifacts already removed");
        self.complete_update(device, session, version, size, hash).await;
        true
    }

    async fn complete_update(
        &self,
        device: &str,
        session: &mut Option<FotaSession>,
        version: String,
        size: u64,
        hash: String,
    ) {
        *session = None;
        tracing::info!(device, version = %version, "fota: update complete, session cleared");
        self.note_event(device, "cleanup", format!("v={version}")).await;
        self.note_progress(ProgressUpdate {
            device: device.to_string(),
            version: version.clone(),
            size,
            written: size,
            status: ProgressStatus::BootOk,
        })
        .await;
        self.note_version(device, version, size, hash, ProgressStatus::BootOk.as_str())
            .await;
    }

    // ========================================================================
    // Bounded I/O helpers
    // ========================================================================

    async fn store<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Storage) -> ecowatt_storage::Result<T> + Send + 'static,
    {
        let storage = Arc::clone(&self.storage);
        bounded(self.config.store_timeout, op, move || {
            f(storage.as_ref()).map_err(FotaError::from)
        })
        .await
    }

    async fn artifact<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ArtifactSource) -> Result<T> + Send + 'static,
    {
        let artifacts = Arc::clone(&self.artifacts);
        bounded(self.config.artifact_timeout, op, move || f(artifacts.as_ref())).await
    }

    async fn artifact_settled<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ArtifactSource) -> Result<T> + Send + 'static,
    {
        let artifacts = Arc::clone(&self.artifacts);
        settled(self.config.artifact_timeout, op, move || f(artifacts.as_ref())).await
    }

    async fn current_manifest(&self, device: &str) -> Option<Manifest> {
        match self.artifact("current_manifest", |a| a.current_manifest()).await {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::warn!(device, error = %e, "fota: manifest lookup failed");
                None
            }
        }
    }

    async fn read_progress(&self, device: &str) -> Option<ProgressRow> {
        let key = device.to_string();
        match self.store("read_progress", move |s| s.read_progress(&key)).await {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(device, error = %e, "fota: progress read failed");
                None
            }
        }
    }

    async fn note_progress(&self, update: ProgressUpdate) {
        let device = update.device.clone();
        if let Err(e) = self
            .store("upsert_progress", move |s| s.upsert_progress(&update))
            .await
        {
            tracing::warn!(device = %device, error = %e, "fota: progress write failed");
        }
    }

    async fn note_event(&self, device: &str, kind: &'static str, detail: String) {
        let key = device.to_string();
        if let Err(e) = self
            .store("append_event", move |s| s.append_event(&key, kind, &detail))
            .await
        {
            tracing::warn!(device, kind, error = %e, "fota: event write failed");
        }
    }

    async fn note_version(&self, device: &str, version: String, size: u64, hash: String, status: &str) {
        let record = VersionRecord {
            device: device.to_string(),
            version,
            size,
            hash,
            status: status.to_string(),
        };
        if let Err(e) = self
            .store("record_version_status", move |s| s.record_version_status(&record))
            .await
        {
            tracing::warn!(device, error = %e, "fota: version history write failed");
        }
    }
}
