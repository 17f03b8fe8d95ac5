//! Artifact Source -- one-shot config/command payloads and the staged firmware.
//!
//! Filesystem layout (artifact directory):
//!
//! ```text
//! fota_manifest.json       current manifest, written last when staging
//! fota_chunk_0000.b64      base64 text of chunk 0, one file per chunk
//! config_update.json       pending config update (taken once)
//! command.json             pending command (taken once)
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ecowatt_protocol::Manifest;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::{FotaError, Result};

pub const MANIFEST_FILE: &str = "fota_manifest.json";
pub const CONFIG_FILE: &str = "config_update.json";
pub const COMMAND_FILE: &str = "command.json";
const CHUNK_PREFIX: &str = "fota_chunk_";
const CHUNK_SUFFIX: &str = ".b64";

pub fn chunk_file_name(n: u32) -> String {
    format!("{CHUNK_PREFIX}{n:04}{CHUNK_SUFFIX}")
}

fn parse_chunk_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(CHUNK_PREFIX)?
        .strip_suffix(CHUNK_SUFFIX)?
        .parse()
        .ok()
}

/// Source of everything the cloud pushes down to devices.
pub trait ArtifactSource: Send + Sync {
    fn take_pending_config(&self) -> Result<Option<Value>>;
    fn take_pending_command(&self) -> Result<Option<Value>>;
    fn queue_config(&self, config: &Value) -> Result<()>;
    fn queue_command(&self, command: &Value) -> Result<()>;

    fn current_manifest(&self) -> Result<Option<Manifest>>;
    fn read_chunk(&self, n: u32) -> Result<Option<Vec<u8>>>;
    fn lowest_chunk(&self) -> Result<Option<u32>>;
    /// Remove the manifest and all chunks if the manifest is still `version`.
    /// Returns false when a different (or no) manifest is staged.
    fn delete_manifest_and_chunks(&self, version: &str) -> Result<bool>;

    /// Replace the staged firmware with `image`.
    fn stage_firmware(&self, image: &[u8], version: &str, chunk_size: u32) -> Result<Manifest>;
}

/// Split `image` into chunks and describe it.
pub fn split_firmware(
    image: &[u8],
    version: &str,
    chunk_size: u32,
) -> Result<(Manifest, Vec<Vec<u8>>)> {
    if chunk_size == 0 {
        return Err(FotaError::InvalidChunkSize);
    }
    let manifest = Manifest {
        version: version.to_string(),
        size: image.len() as u64,
        hash: ecowatt_crypto::sha256_hex(image),
        chunk_size,
    };
    let chunks = image
        .chunks(chunk_size as usize)
        .map(<[u8]>::to_vec)
        .collect();
    Ok((manifest, chunks))
}

// ============================================================================
// One-shot slot
// ============================================================================

/// Single-slot queue: `put` overwrites, `take` returns the value and clears it.
pub enum OneShot {
    File(PathBuf),
    Memory(Mutex<Option<Value>>),
}

impl OneShot {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        OneShot::File(path.into())
    }

    pub fn memory() -> Self {
        OneShot::Memory(Mutex::new(None))
    }

    pub fn put(&self, value: &Value) -> Result<()> {
        match self {
            OneShot::File(path) => write_atomic(path, serde_json::to_string_pretty(value)?.as_bytes()),
            OneShot::Memory(slot) => {
                *lock(slot)? = Some(value.clone());
                Ok(())
            }
        }
    }

    pub fn take(&self) -> Result<Option<Value>> {
        match self {
            OneShot::File(path) => {
                let text = match std::fs::read_to_string(path) {
                    Ok(text) => text,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                // Cleared before parsing: a malformed file is reported once, not every poll.
                std::fs::remove_file(path)?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            OneShot::Memory(slot) => Ok(lock(slot)?.take()),
        }
    }

    pub fn is_pending(&self) -> Result<bool> {
        match self {
            OneShot::File(path) => Ok(path.exists()),
            OneShot::Memory(slot) => Ok(lock(slot)?.is_some()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| FotaError::LockPoisoned)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// Filesystem source
// ============================================================================

pub struct FsArtifactSource {
    dir: PathBuf,
    config: OneShot,
    command: OneShot,
}

impl FsArtifactSource {
    /// Use `dir` as the artifact directory, creating it if needed.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config: OneShot::file(dir.join(CONFIG_FILE)),
            command: OneShot::file(dir.join(COMMAND_FILE)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn chunk_numbers(&self) -> Result<Vec<u32>> {
        let mut numbers = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(n) = entry.file_name().to_str().and_then(parse_chunk_file_name) {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    fn remove_chunks(&self) -> Result<usize> {
        let numbers = self.chunk_numbers()?;
        for n in &numbers {
            std::fs::remove_file(self.dir.join(chunk_file_name(*n)))?;
        }
        Ok(numbers.len())
    }
}

impl ArtifactSource for FsArtifactSource {
    fn take_pending_config(&self) -> Result<Option<Value>> {
        self.config.take()
    }

    fn take_pending_command(&self) -> Result<Option<Value>> {
        self.command.take()
    }

    fn queue_config(&self, config: &Value) -> Result<()> {
        self.config.put(config)
    }

    fn queue_command(&self, command: &Value) -> Result<()> {
        self.command.put(command)
    }

    fn current_manifest(&self) -> Result<Option<Manifest>> {
        match std::fs::read_to_string(self.dir.join(MANIFEST_FILE)) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_chunk(&self, n: u32) -> Result<Option<Vec<u8>>> {
        match std::fs::read_to_string(self.dir.join(chunk_file_name(n))) {
            Ok(text) => Ok(Some(BASE64.decode(text.trim())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn lowest_chunk(&self) -> Result<Option<u32>> {
        Ok(self.chunk_numbers()?.first().copied())
    }

    fn delete_manifest_and_chunks(&self, version: &str) -> Result<bool> {
        match self.current_manifest()? {
            Some(manifest) if manifest.version == version => {}
            _ => return Ok(false),
        }
        std::fs::remove_file(self.dir.join(MANIFEST_FILE))?;
        let removed = self.remove_chunks()?;
        tracing::info!(version, chunks = removed, "fota: artifacts removed");
        Ok(true)
    }

    fn stage_firmware(&self, image: &[u8], version: &str, chunk_size: u32) -> Result<Manifest> {
        let (manifest, chunks) = split_firmware(image, version, chunk_size)?;

        // Devices must never see a manifest whose chunks are not on disk yet.
        match std::fs::remove_file(self.dir.join(MANIFEST_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.remove_chunks()?;
        for (n, chunk) in chunks.iter().enumerate() {
            let path = self.dir.join(chunk_file_name(n as u32));
            std::fs::write(path, BASE64.encode(chunk))?;
        }
        write_atomic(
            &self.dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )?;

        tracing::info!(
            version,
            size = manifest.size,
            chunks = chunks.len(),
            "fota: firmware staged"
        );
        Ok(manifest)
    }
}

// ============================================================================
// In-memory source
// ============================================================================

#[derive(Default)]
struct StagedImage {
    manifest: Option<Manifest>,
    chunks: BTreeMap<u32, Vec<u8>>,
}

/// Artifact source held entirely in memory (tests, ephemeral servers).
pub struct MemoryArtifactSource {
    staged: Mutex<StagedImage>,
    config: OneShot,
    command: OneShot,
}

impl Default for MemoryArtifactSource {
    fn default() -> Self {
        Self {
            staged: Mutex::new(StagedImage::default()),
            config: OneShot::memory(),
            command: OneShot::memory(),
        }
    }
}

impl MemoryArtifactSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactSource for MemoryArtifactSource {
    fn take_pending_config(&self) -> Result<Option<Value>> {
        self.config.take()
    }

    fn take_pending_command(&self) -> Result<Option<Value>> {
        self.command.take()
    }

    fn queue_config(&self, config: &Value) -> Result<()> {
        self.config.put(config)
    }

    fn queue_command(&self, command: &Value) -> Result<()> {
        self.command.put(command)
    }

    fn current_manifest(&self) -> Result<Option<Manifest>> {
        Ok(lock(&self.staged)?.manifest.clone())
    }

    fn read_chunk(&self, n: u32) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.staged)?.chunks.get(&n).cloned())
    }

    fn lowest_chunk(&self) -> Result<Option<u32>> {
        Ok(lock(&self.staged)?.chunks.keys().next().copied())
    }

    fn delete_manifest_and_chunks(&self, version: &str) -> Result<bool> {
        let mut staged = lock(&self.staged)?;
        match &staged.manifest {
            Some(manifest) if manifest.version == version => {
                *staged = StagedImage::default();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn stage_firmware(&self, image: &[u8], version: &str, chunk_size: u32) -> Result<Manifest> {
        let (manifest, chunks) = split_firmware(image, version, chunk_size)?;
        let mut staged = lock(&self.staged)?;
        staged.chunks = chunks
            .into_iter()
            .enumerate()
            .map(|(n, chunk)| (n as u32, chunk))
            .collect();
        staged.manifest = Some(manifest.clone());
        Ok(manifest)
    }
}
