//! EcoWatt Storage -- rusqlite wrapper for schema v1.
//!
//! Holds raw uploads, the optional telemetry sub-objects devices attach to
//! them, and the FOTA progress/audit tables operators read.
//! WAL mode + busy_timeout so the CLI can read while the server writes.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("unknown progress status: {0}")]
    UnknownStatus(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Operator-facing FOTA status for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Downloading,
    VerifyOk,
    VerifyFailed,
    BootOk,
    BootRollback,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Downloading => "downloading",
            ProgressStatus::VerifyOk => "verify_ok",
            ProgressStatus::VerifyFailed => "verify_failed",
            ProgressStatus::BootOk => "boot_ok",
            ProgressStatus::BootRollback => "boot_rollback",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProgressStatus::Pending),
            "downloading" => Ok(ProgressStatus::Downloading),
            "verify_ok" => Ok(ProgressStatus::VerifyOk),
            "verify_failed" => Ok(ProgressStatus::VerifyFailed),
            "boot_ok" => Ok(ProgressStatus::BootOk),
            "boot_rollback" => Ok(ProgressStatus::BootRollback),
            other => Err(StorageError::UnknownStatus(other.to_string())),
        }
    }
}

/// Row types matching the SQLite schema v1.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadWrite {
    pub device_id: String,
    pub ts_start: i64,
    pub ts_end: i64,
    pub seq: Option<i64>,
    pub codec: String,
    pub order: Vec<String>,
    pub ts_list: Option<Value>,
    pub orig_samples: Option<i64>,
    pub orig_bytes: Option<i64>,
    /// Server receive time, ms since epoch.
    pub received_at: i64,
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRow {
    pub id: i64,
    pub device_id: String,
    pub ts_start: i64,
    pub ts_end: i64,
    pub seq: Option<i64>,
    pub codec: String,
    pub order: Vec<String>,
    pub ts_list: Option<Value>,
    pub orig_samples: Option<i64>,
    pub orig_bytes: Option<i64>,
    pub received_at: i64,
    #[serde(skip)]
    pub block: Vec<u8>,
}

/// Upload listing entry without the block itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSummary {
    pub id: i64,
    pub device_id: String,
    pub ts_start: i64,
    pub ts_end: i64,
    pub seq: Option<i64>,
    pub codec: String,
    pub received_at: i64,
    pub block_bytes: i64,
    pub orig_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub device: String,
    pub version: String,
    pub size: u64,
    pub written: u64,
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRow {
    pub device: String,
    pub version: String,
    pub size: u64,
    pub written: u64,
    pub percent: u32,
    pub status: ProgressStatus,
    pub updated: String,
}

impl ProgressRow {
    /// All bytes of the image have been handed to the device.
    pub fn is_complete(&self) -> bool {
        self.size == 0 || self.written >= self.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FotaEventRow {
    pub id: i64,
    pub ts: String,
    pub device: String,
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub device: String,
    pub version: String,
    pub size: u64,
    pub hash: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRow {
    pub device: String,
    pub version: String,
    pub size: u64,
    pub hash: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

/// `written * 100 / size`, clamped to 100; 0 for an empty image.
pub fn percent(written: u64, size: u64) -> u32 {
    if size == 0 {
        return 0;
    }
    (written.saturating_mul(100) / size).min(100) as u32
}

/// Storage trait for the ingest service.
pub trait Storage: Send + Sync {
    // Raw uploads
    fn insert_upload(&self, upload: &UploadWrite) -> Result<i64>;
    fn read_upload(&self, id: i64) -> Result<Option<UploadRow>>;
    fn list_uploads(&self, device_id: Option<&str>, limit: u32) -> Result<Vec<UploadSummary>>;

    // Optional telemetry sub-objects
    fn insert_power_stats(&self, device_id: &str, received_at: i64, stats: &Value) -> Result<()>;
    fn insert_diag(&self, device_id: &str, received_at: i64, diag: &Value) -> Result<()>;
    fn insert_device_events(
        &self,
        device_id: &str,
        received_at: i64,
        events: &[String],
    ) -> Result<usize>;
    fn insert_sim_fault(&self, device_id: &str, received_at: i64, fault: &Value) -> Result<()>;

    // FOTA progress (one row per device, last write wins)
    fn upsert_progress(&self, update: &ProgressUpdate) -> Result<()>;
    fn read_progress(&self, device: &str) -> Result<Option<ProgressRow>>;
    fn list_progress(&self) -> Result<Vec<ProgressRow>>;

    // FOTA audit trail, newest first
    fn append_event(&self, device: &str, kind: &str, detail: &str) -> Result<()>;
    fn list_events(&self, device: Option<&str>, limit: u32) -> Result<Vec<FotaEventRow>>;

    // FOTA version history
    fn record_version_status(&self, record: &VersionRecord) -> Result<()>;
    fn list_versions(&self, device: &str) -> Result<Vec<VersionRow>>;
}

/// SQLite-backed storage.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStorage {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let storage = Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        };

        storage.ensure_schema()?;
        Ok(storage)
    }

    /// Open an existing database read-only (CLI inspection).
    pub fn open_readonly(db_path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(include_str!("schema_v1.sql"))?;
            tracing::info!(db = %self.db_path.display(), "storage: created schema v1");
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }

        Ok(())
    }

    fn map_progress(row: &rusqlite::Row) -> rusqlite::Result<(ProgressRow, String)> {
        let status: String = row.get(5)?;
        Ok((
            ProgressRow {
                device: row.get(0)?,
                version: row.get(1)?,
                size: row.get::<_, i64>(2)?.max(0) as u64,
                written: row.get::<_, i64>(3)?.max(0) as u64,
                percent: row.get::<_, i64>(4)?.clamp(0, 100) as u32,
                status: ProgressStatus::Pending,
                updated: row.get(6)?,
            },
            status,
        ))
    }

    fn finish_progress((mut row, status): (ProgressRow, String)) -> Result<ProgressRow> {
        row.status = status.parse()?;
        Ok(row)
    }
}

impl Storage for SqliteStorage {
    fn insert_upload(&self, upload: &UploadWrite) -> Result<i64> {
        let order_json = serde_json::to_string(&upload.order)?;
        let ts_list_json = upload
            .ts_list
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO uploads (device_id, ts_start, ts_end, seq, codec, order_json,
                                  ts_list_json, orig_samples, orig_bytes, received_at, block)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                upload.device_id,
                upload.ts_start,
                upload.ts_end,
                upload.seq,
                upload.codec,
                order_json,
                ts_list_json,
                upload.orig_samples,
                upload.orig_bytes,
                upload.received_at,
                upload.block,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn read_upload(&self, id: i64) -> Result<Option<UploadRow>> {
        let conn = self.db()?;
        let raw = conn
            .query_row(
                "SELECT id, device_id, ts_start, ts_end, seq, codec, order_json, ts_list_json,
                        orig_samples, orig_bytes, received_at, block
                 FROM uploads WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        UploadRow {
                            id: row.get(0)?,
                            device_id: row.get(1)?,
                            ts_start: row.get(2)?,
                            ts_end: row.get(3)?,
                            seq: row.get(4)?,
                            codec: row.get(5)?,
                            order: Vec::new(),
                            ts_list: None,
                            orig_samples: row.get(8)?,
                            orig_bytes: row.get(9)?,
                            received_at: row.get(10)?,
                            block: row.get(11)?,
                        },
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((mut upload, order_json, ts_list_json)) = raw else {
            return Ok(None);
        };
        upload.order = serde_json::from_str(&order_json)?;
        upload.ts_list = ts_list_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Some(upload))
    }

    fn list_uploads(&self, device_id: Option<&str>, limit: u32) -> Result<Vec<UploadSummary>> {
        let conn = self.db()?;
        let map_row = |row: &rusqlite::Row| {
            Ok(UploadSummary {
                id: row.get(0)?,
                device_id: row.get(1)?,
                ts_start: row.get(2)?,
                ts_end: row.get(3)?,
                seq: row.get(4)?,
                codec: row.get(5)?,
                received_at: row.get(6)?,
                block_bytes: row.get(7)?,
                orig_bytes: row.get(8)?,
            })
        };

        let rows = if let Some(device_id) = device_id {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, ts_start, ts_end, seq, codec, received_at,
                        length(block), orig_bytes
                 FROM uploads WHERE device_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![device_id, limit], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, ts_start, ts_end, seq, codec, received_at,
                        length(block), orig_bytes
                 FROM uploads ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        Ok(rows)
    }

    fn insert_power_stats(&self, device_id: &str, received_at: i64, stats: &Value) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO power_stats (device_id, received_at, stats_json) VALUES (?1, ?2, ?3)",
            params![device_id, received_at, stats.to_string()],
        )?;
        Ok(())
    }

    fn insert_diag(&self, device_id: &str, received_at: i64, diag: &Value) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO diag_counters (device_id, received_at, diag_json) VALUES (?1, ?2, ?3)",
            params![device_id, received_at, diag.to_string()],
        )?;
        Ok(())
    }

    fn insert_device_events(
        &self,
        device_id: &str,
        received_at: i64,
        events: &[String],
    ) -> Result<usize> {
        let mut conn = self.db()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO device_events (device_id, received_at, event) VALUES (?1, ?2, ?3)",
            )?;
            for event in events {
                stmt.execute(params![device_id, received_at, event])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    fn insert_sim_fault(&self, device_id: &str, received_at: i64, fault: &Value) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO sim_faults (device_id, received_at, fault_json) VALUES (?1, ?2, ?3)",
            params![device_id, received_at, fault.to_string()],
        )?;
        Ok(())
    }

    fn upsert_progress(&self, update: &ProgressUpdate) -> Result<()> {
        let written = if update.size > 0 {
            update.written.min(update.size)
        } else {
            update.written
        };
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO fota_progress (device, version, size, written, percent, status, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
             ON CONFLICT(device) DO UPDATE SET
               version = excluded.version,
               size = excluded.size,
               written = excluded.written,
               percent = excluded.percent,
               status = excluded.status,
               updated = datetime('now')",
            params![
                update.device,
                update.version,
                update.size as i64,
                written as i64,
                percent(written, update.size),
                update.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn read_progress(&self, device: &str) -> Result<Option<ProgressRow>> {
        let conn = self.db()?;
        let raw = conn
            .query_row(
                "SELECT device, version, size, written, percent, status, updated
                 FROM fota_progress WHERE device = ?1",
                params![device],
                Self::map_progress,
            )
            .optional()?;
        raw.map(Self::finish_progress).transpose()
    }

    fn list_progress(&self) -> Result<Vec<ProgressRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT device, version, size, written, percent, status, updated
             FROM fota_progress ORDER BY device",
        )?;
        let raw = stmt
            .query_map([], Self::map_progress)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter().map(Self::finish_progress).collect()
    }

    fn append_event(&self, device: &str, kind: &str, detail: &str) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO fota_events (ts, device, kind, detail)
             VALUES (datetime('now'), ?1, ?2, ?3)",
            params![device, kind, detail],
        )?;
        Ok(())
    }

    fn list_events(&self, device: Option<&str>, limit: u32) -> Result<Vec<FotaEventRow>> {
        let conn = self.db()?;
        let map_row = |row: &rusqlite::Row| {
            Ok(FotaEventRow {
                id: row.get(0)?,
                ts: row.get(1)?,
                device: row.get(2)?,
                kind: row.get(3)?,
                detail: row.get(4)?,
            })
        };

        let rows = if let Some(device) = device {
            let mut stmt = conn.prepare(
                "SELECT id, ts, device, kind, detail FROM fota_events
                 WHERE device = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![device, limit], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, ts, device, kind, detail FROM fota_events
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], map_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        Ok(rows)
    }

    fn record_version_status(&self, record: &VersionRecord) -> Result<()> {
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO fota_versions (device, version, size, hash, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'), datetime('now'))
             ON CONFLICT(device, version) DO UPDATE SET
               size = CASE WHEN excluded.size > 0 THEN excluded.size ELSE fota_versions.size END,
               hash = CASE WHEN excluded.hash != '' THEN excluded.hash ELSE fota_versions.hash END,
               status = excluded.status,
               updated_at = datetime('now')",
            params![
                record.device,
                record.version,
                record.size as i64,
                record.hash,
                record.status,
            ],
        )?;
        Ok(())
    }

    fn list_versions(&self, device: &str) -> Result<Vec<VersionRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT device, version, size, hash, status, created_at, updated_at
             FROM fota_versions WHERE device = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map(params![device], |row| {
                Ok(VersionRow {
                    device: row.get(0)?,
                    version: row.get(1)?,
                    size: row.get::<_, i64>(2)?.max(0) as u64,
                    hash: row.get(3)?,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
