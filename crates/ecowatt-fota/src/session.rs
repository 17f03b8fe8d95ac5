//! Per-device FOTA session state.
//!
//! Pure state transitions; the engine in `lib.rs` performs the I/O around them.
//! NoSession -> ManifestOffered -> Downloading (-> Stalled) -> Complete.

use ecowatt_protocol::Manifest;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    NoSession,
    ManifestOffered,
    Downloading,
    /// Downloading, but the device has not advanced for one or more uploads.
    Stalled,
    Complete,
}

impl SessionPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SessionPhase::NoSession => "no_session",
            SessionPhase::ManifestOffered => "manifest_offered",
            SessionPhase::Downloading => "downloading",
            SessionPhase::Stalled => "stalled",
            SessionPhase::Complete => "complete",
        }
    }

    pub fn of(session: Option<&FotaSession>) -> Self {
        session.map(FotaSession::phase).unwrap_or_default()
    }
}

/// Why the manifest is attached to a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferReason {
    NewSession,
    NewVersion,
    Stalled,
}

impl OfferReason {
    pub fn name(&self) -> &'static str {
        match self {
            OfferReason::NewSession => "new_session",
            OfferReason::NewVersion => "new_version",
            OfferReason::Stalled => "stalled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FotaSession {
    pub version: String,
    pub size: u64,
    pub chunk_size: u32,
    pub hash: String,
    pub next_expected_chunk: u32,
    pub written_bytes: u64,
    pub last_served_manifest_version: String,
    pub cycles_without_progress: u32,
    /// Most recent `next_chunk` the device declared.
    pub last_reported_chunk: Option<u32>,
}

impl FotaSession {
    /// Fresh session for `manifest`, starting at chunk 0.
    pub fn seeded(manifest: &Manifest) -> Self {
        Self {
            version: manifest.version.clone(),
            size: manifest.size,
            chunk_size: manifest.chunk_size,
            hash: manifest.hash.clone(),
            next_expected_chunk: 0,
            written_bytes: 0,
            last_served_manifest_version: manifest.version.clone(),
            cycles_without_progress: 0,
            last_reported_chunk: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        if self.is_complete() {
            SessionPhase::Complete
        } else if self.next_expected_chunk == 0 && self.written_bytes == 0 {
            SessionPhase::ManifestOffered
        } else if self.cycles_without_progress > 0 {
            SessionPhase::Stalled
        } else {
            SessionPhase::Downloading
        }
    }

    pub fn is_complete(&self) -> bool {
        self.written_bytes >= self.size
    }

    /// Account for a declared `next_chunk`. Returns true when it counts as progress.
    ///
    /// The first declaration and any strict increase count; anything else
    /// bumps the stall counter. Never touches `next_expected_chunk`.
    pub fn record_progress(&mut self, next_chunk: u32) -> bool {
        let advanced = match self.last_reported_chunk {
            None => true,
            Some(previous) => next_chunk > previous,
        };
        self.last_reported_chunk = Some(next_chunk);
        if advanced {
            self.cycles_without_progress = 0;
        } else {
            self.cycles_without_progress = self.cycles_without_progress.saturating_add(1);
        }
        advanced
    }

    /// Bookkeeping after chunk `chunk` was attached to a reply.
    pub fn mark_served(&mut self, chunk: u32) {
        self.next_expected_chunk = chunk.saturating_add(1);
        let end = (chunk as u64 + 1).saturating_mul(self.chunk_size as u64);
        self.written_bytes = end.min(self.size);
    }

    /// Re-advertise the manifest. Same version keeps the counters so the device can resume.
    pub fn reoffer(&mut self, manifest: &Manifest) {
        if manifest.version == self.version {
            self.last_served_manifest_version = manifest.version.clone();
            self.cycles_without_progress = 0;
        } else {
            *self = FotaSession::seeded(manifest);
        }
    }
}

/// Whether `manifest` must be attached this turn, and why.
pub fn offer_reason(
    session: Option<&FotaSession>,
    manifest: &Manifest,
    stall_threshold: u32,
) -> Option<OfferReason> {
    match session {
        None => Some(OfferReason::NewSession),
        Some(s) if s.last_served_manifest_version != manifest.version => {
            Some(OfferReason::NewVersion)
        }
        Some(s) if s.cycles_without_progress >= stall_threshold => Some(OfferReason::Stalled),
        Some(_) => None,
    }
}
