//! On-disk detection cache stored next to the checkpoints it describes.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{ArchKind, ArchParams, ArchitectureDescriptor};

pub const CACHE_FILE_NAME: &str = ".arch_cache.json";
pub const CACHE_SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub arch_name: ArchKind,
    pub arch_params: ArchParams,
    pub score: f64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime: u64,
    pub size: u64,
    pub timestamp: String,
    pub schema_version: String,
}

/// `(mtime_ns, size)` of a file as recorded in the cache.
pub fn file_identity(path: &Path) -> Result<(u64, u64)> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    Ok((mtime, meta.len()))
}

#[derive(Debug, Default)]
pub struct DetectionCache {
    path: PathBuf,
    entries: BTreeMap<String, serde_json::Value>,
}

impl DetectionCache {
    pub fn path_for_dir(dir: &Path) -> PathBuf {
        dir.join(CACHE_FILE_NAME)
    }

    /// Read the cache in `dir`; an absent or unreadable file is an empty cache.
    pub fn load(dir: &Path) -> Self {
        let path = Self::path_for_dir(dir);
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt detection cache");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read detection cache");
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A hit requires the current schema and an unchanged mtime and size.
    pub fn lookup(&self, key: &Path, mtime: u64, size: u64) -> Option<ArchitectureDescriptor> {
        let raw = self.entries.get(&key.to_string_lossy().into_owned())?;
        let entry: CacheEntry = match serde_json::from_value(raw.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(key = %key.display(), error = %e, "Unreadable cache entry");
                return None;
            }
        };
        if entry.schema_version != CACHE_SCHEMA_VERSION {
            debug!(key = %key.display(), version = %entry.schema_version, "Cache schema mismatch");
            return None;
        }
        if entry.mtime != mtime || entry.size != size {
            debug!(key = %key.display(), "Checkpoint changed since it was cached");
            return None;
        }
        Some(ArchitectureDescriptor {
            name: entry.arch_name,
            params: entry.arch_params,
            confidence: entry.score,
        })
    }

    pub fn insert(&mut self, key: &Path, descriptor: &ArchitectureDescriptor, mtime: u64, size: u64) {
        let entry = CacheEntry {
            arch_name: descriptor.name,
            arch_params: descriptor.params.clone(),
            score: descriptor.confidence,
            mtime,
            size,
            timestamp: chrono::Utc::now().to_rfc3339(),
            schema_version: CACHE_SCHEMA_VERSION.to_string(),
        };
        match serde_json::to_value(&entry) {
            Ok(value) => {
                self.entries.insert(key.to_string_lossy().into_owned(), value);
            }
            Err(e) => warn!(error = %e, "Failed to serialize cache entry"),
        }
    }

    /// Write to a sibling temp file then rename over the cache.
    pub fn save(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let json = serde_json::to_string_pretty(&self.entries)?;

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), entries = self.entries.len(), "Saved detection cache");
        Ok(())
    }
}

pub fn clear_cache(dir: &Path) -> Result<bool> {
    let path = DetectionCache::path_for_dir(dir);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}
