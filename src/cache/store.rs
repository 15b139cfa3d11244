//! Preview Artifact Store
//!
//! A single flat directory of `<key>.mp4` files. All metadata (size and
//! recency) comes from filesystem stat; nothing is tracked in memory, so the
//! store survives restarts and external cleanup without reconciliation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::key::CacheKey;

/// Name prefix of per-fetch scratch directories inside the store root
pub const SCRATCH_PREFIX: &str = ".fetch-";

/// One artifact as seen by a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMeta {
    /// File name relative to the store root
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Last write time, used as the recency proxy
    pub modified: SystemTime,
}

/// Enumerate/delete seam used by the eviction sweeper
pub trait ArtifactStore {
    /// Snapshot of every artifact currently on disk
    fn list_all(&self) -> io::Result<Vec<ArtifactMeta>>;

    /// Delete one artifact by name
    fn remove(&self, name: &str) -> io::Result<()>;
}

/// On-disk preview store
#[derive(Debug, Clone)]
pub struct CacheStore {
    /// Root directory holding artifacts
    root: PathBuf,
}

impl CacheStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create preview directory: {:?}", root))?;

        let store = Self { root };
        info!(root = %store.root.display(), "Preview store opened");
        Ok(store)
    }

    /// Whether an artifact exists for `key`. Content is not validated.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.artifact_path(key).is_file()
    }

    /// Path an artifact for `key` lives at. No I/O.
    pub fn artifact_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifact count and aggregate size
    pub fn usage(&self) -> io::Result<(usize, u64)> {
        let artifacts = self.list_all()?;
        let total = artifacts.iter().map(|a| a.size).sum();
        Ok((artifacts.len(), total))
    }

    /// Remove scratch directories left by interrupted fetches.
    ///
    /// Only directories untouched for longer than `max_age` are removed; a
    /// younger one may belong to a fetch another process is running.
    pub fn cleanup(&self, max_age: Duration) {
        let now = SystemTime::now();
        if let Ok(read_dir) = fs::read_dir(&self.root) {
            for entry in read_dir.flatten() {
                let name = entry.file_name();
                if !name.to_string_lossy().starts_with(SCRATCH_PREFIX) {
                    continue;
                }
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|modified| now.duration_since(modified).unwrap_or_default());
                match age {
                    Ok(age) if age > max_age => {}
                    _ => continue,
                }
                let path = entry.path();
                debug!(path = %path.display(), "Removing stale fetch scratch directory");
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove scratch directory");
                }
            }
        }
    }
}

impl ArtifactStore for CacheStore {
    fn list_all(&self) -> io::Result<Vec<ArtifactMeta>> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(m) => m,
                // Removed between readdir and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if !metadata.is_file() {
                continue;
            }
            artifacts.push(ArtifactMeta {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified()?,
            });
        }
        Ok(artifacts)
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.root.join(name))?;
        debug!(name = name, "Removed artifact");
        Ok(())
    }
}
