//! Device upload and cloud reply types.
//!
//! Uploads are validated in two passes: a presence check over the raw JSON
//! object, then typed deserialization. Optional sub-objects stay as JSON
//! until a consumer interprets them; the `fota` sub-object is decoded once
//! into [`FotaReport`] variants.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{DeviceId, MessageError};

/// Fields every upload must carry.
pub const REQUIRED_FIELDS: [&str; 6] = [
    "device_id",
    "ts_start",
    "ts_end",
    "codec",
    "order",
    "block_b64",
];

// ============================================================================
// Upload
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMessage {
    #[serde(deserialize_with = "string_or_number")]
    pub device_id: DeviceId,
    /// Device-local milliseconds of the first sample.
    pub ts_start: i64,
    /// Device-local milliseconds of the last sample.
    pub ts_end: i64,
    #[serde(default)]
    pub seq: Option<i64>,
    pub codec: String,
    pub order: Vec<String>,
    pub block_b64: String,
    #[serde(default)]
    pub ts_list: Option<Value>,
    #[serde(default)]
    pub orig_samples: Option<i64>,
    #[serde(default)]
    pub orig_bytes: Option<i64>,
    #[serde(default)]
    pub power_stats: Option<Value>,
    #[serde(default)]
    pub diag: Option<Value>,
    #[serde(default)]
    pub events: Option<Value>,
    #[serde(default)]
    pub fota: Option<Value>,
    #[serde(default)]
    pub sim_fault: Option<Value>,
}

/// An upload whose required fields are present and whose block decoded from base64.
#[derive(Debug, Clone)]
pub struct ValidatedUpload {
    pub message: UploadMessage,
    pub block: Vec<u8>,
}

impl UploadMessage {
    /// Validate an unwrapped payload. Performs no side effects.
    pub fn validate(body: &Value) -> Result<ValidatedUpload, MessageError> {
        let obj = body
            .as_object()
            .ok_or_else(|| MessageError::InvalidFields("upload is not a JSON object".into()))?;

        let missing: Vec<&'static str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|field| !obj.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(MessageError::MissingFields(missing));
        }

        let message = UploadMessage::deserialize(body)
            .map_err(|e| MessageError::InvalidFields(e.to_string()))?;
        let block = BASE64
            .decode(message.block_b64.as_bytes())
            .map_err(|_| MessageError::BadBase64)?;

        Ok(ValidatedUpload { message, block })
    }

    /// FOTA reports carried by this upload, in processing order.
    pub fn fota_reports(&self) -> Vec<FotaReport> {
        self.fota.as_ref().map(FotaReport::parse_all).unwrap_or_default()
    }

    /// Event strings, if the device sent a list. Non-string entries are rendered as JSON.
    pub fn event_list(&self) -> Vec<String> {
        match &self.events {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Explicit per-sample timestamps, if present and all integral.
    pub fn timestamps(&self) -> Option<Vec<i64>> {
        match &self.ts_list {
            Some(Value::Array(items)) => items.iter().map(Value::as_i64).collect(),
            _ => None,
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

// ============================================================================
// FOTA reports (device -> cloud)
// ============================================================================

/// One fact the device reported about its firmware update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FotaReport {
    /// Device wants chunk `next_chunk` next.
    Progress { next_chunk: u32 },
    VerifyResult { ok: bool },
    ApplyResult { ok: bool },
    Failure {
        reason: String,
        version: Option<String>,
    },
    BootOk,
}

impl FotaReport {
    /// Decode a `fota` sub-object. Unknown keys and malformed values are skipped.
    ///
    /// Order: progress, verify, apply, failure, boot_ok.
    pub fn parse_all(fota: &Value) -> Vec<FotaReport> {
        let mut reports = Vec::new();
        let Some(obj) = fota.as_object() else {
            return reports;
        };

        if let Some(next_chunk) = obj.get("next_chunk").and_then(as_chunk_number) {
            reports.push(FotaReport::Progress { next_chunk });
        }
        if let Some(ok) = obj.get("verify").and_then(as_outcome) {
            reports.push(FotaReport::VerifyResult { ok });
        }
        if let Some(ok) = obj.get("apply").and_then(as_outcome) {
            reports.push(FotaReport::ApplyResult { ok });
        }
        match obj.get("failure") {
            Some(Value::Object(failure)) => reports.push(FotaReport::Failure {
                reason: failure
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                version: failure
                    .get("version")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            Some(Value::String(reason)) => reports.push(FotaReport::Failure {
                reason: reason.clone(),
                version: None,
            }),
            _ => {}
        }
        if obj.get("boot_ok") == Some(&Value::Bool(true)) {
            reports.push(FotaReport::BootOk);
        }

        reports
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FotaReport::Progress { .. } => "progress",
            FotaReport::VerifyResult { .. } => "verify",
            FotaReport::ApplyResult { .. } => "apply",
            FotaReport::Failure { .. } => "failure",
            FotaReport::BootOk => "boot_ok",
        }
    }
}

fn as_chunk_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_outcome(value: &Value) -> Option<bool> {
    match value {
        Value::String(s) => Some(s == "ok"),
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

// ============================================================================
// Manifest and reply (cloud -> device)
// ============================================================================

/// Firmware image advertised to devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub size: u64,
    /// Lower-case hex SHA-256 of the whole image.
    pub hash: String,
    pub chunk_size: u32,
}

impl Manifest {
    pub fn total_chunks(&self) -> u32 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.size.div_ceil(self.chunk_size as u64) as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FotaReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Manifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_number: Option<u32>,
    /// Base64 of the chunk bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl FotaReply {
    pub fn is_empty(&self) -> bool {
        self.manifest.is_none() && self.chunk_number.is_none()
    }

    pub fn attach_chunk(&mut self, chunk_number: u32, bytes: &[u8]) {
        self.chunk_number = Some(chunk_number);
        self.data = Some(BASE64.encode(bytes));
    }
}

/// Reply object wrapped in the response envelope. Empty replies serialize as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_update: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fota: Option<FotaReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn error(code: &str) -> Self {
        Self {
            error: Some(code.to_string()),
            ..Default::default()
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}
