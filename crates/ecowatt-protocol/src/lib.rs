//! EcoWatt Protocol -- upload message types, block codec, sample helpers.
//!
//! Devices poll the cloud with one JSON upload per cycle. The upload carries
//! a delta-RLE v1 block of register samples plus optional sub-objects
//! (power stats, diag counters, events, FOTA progress). The reply carries
//! one-shot config/command payloads and FOTA manifest/chunks.

pub mod codec;
pub mod messages;
pub mod samples;

pub use codec::{decode, encode, Decoded, DecodeStatus};
pub use messages::*;

/// Codec identifier for delta-RLE v1 blocks.
pub const CODEC_DELTA_RLE_V1: &str = "delta_rle_v1";

/// Block format version written in the first header byte.
pub const BLOCK_VERSION: u8 = 1;

/// Fixed header: version, field_count, sample_count (u16 LE), 4 reserved bytes.
pub const HEADER_LEN: usize = 8;

/// Trailing region reserved for the CRC-32.
pub const TRAILER_LEN: usize = 4;

/// Smallest block that can hold a header and trailer.
pub const MIN_BLOCK_LEN: usize = HEADER_LEN + TRAILER_LEN;

/// Longest run a single repeat opcode can express.
pub const MAX_REPEAT_RUN: u8 = u8::MAX;

/// Non-advancing uploads tolerated before the manifest is offered again.
pub const STALL_THRESHOLD: u32 = 3;

/// Default FOTA chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u32 = 8192;

/// Device identifier (opaque string chosen by the firmware).
pub type DeviceId = String;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("block needs at least one sample")]
    NoSamples,
    #[error("too many samples: {0} (max 65535)")]
    TooManySamples(usize),
    #[error("too many fields: {0} (max 255)")]
    TooManyFields(usize),
    #[error("row {row} has {got} values, expected {expected}")]
    RaggedRow {
        row: usize,
        got: usize,
        expected: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("invalid field: {0}")]
    InvalidFields(String),
    #[error("block_b64 is not valid base64")]
    BadBase64,
}

impl MessageError {
    /// Error code echoed to the device inside the reply envelope.
    pub fn code(&self) -> &'static str {
        match self {
            MessageError::MissingFields(_) => "missing-fields",
            MessageError::InvalidFields(_) => "invalid-fields",
            MessageError::BadBase64 => "bad-base64",
        }
    }
}
