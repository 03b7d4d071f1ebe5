// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent manifest and version state.
//!
//! The cache directory holds four JSON blobs next to the cached assets:
//!
//! - `manifest_version.dat` / `manifest.dat`: the last fully synced snapshot
//! - `temp_version.dat` / `temp_manifest.dat`: the server snapshot captured
//!   before a sync's downloads began, removed once that sync is finalized
//!
//! The version file is always written after its manifest. A present version
//! file means the paired manifest can be trusted.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::{Manifest, VersionMarker};
use crate::error::{SyncError, SyncResult};

pub const VERSION_FILE: &str = "manifest_version.dat";
pub const MANIFEST_FILE: &str = "manifest.dat";
pub const TEMP_VERSION_FILE: &str = "temp_version.dat";
pub const TEMP_MANIFEST_FILE: &str = "temp_manifest.dat";
pub const LOCK_FILE: &str = ".assetsync.lock";

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Everything the store found on disk at startup. Unreadable or invalid files
/// are left as `None`.
#[derive(Debug, Clone, Default)]
pub struct LocalState {
    pub version: Option<VersionMarker>,
    pub manifest: Option<Manifest>,
    pub temp_version: Option<VersionMarker>,
    pub temp_manifest: Option<Manifest>,
}

impl LocalState {
    /// The server snapshot left behind by an interrupted sync, if both halves
    /// survived.
    pub fn recovery_snapshot(&self) -> Option<(VersionMarker, Manifest)> {
        match (&self.temp_version, &self.temp_manifest) {
            (Some(version), Some(manifest)) => Some((version.clone(), manifest.clone())),
            _ => None,
        }
    }

    /// True if exactly one temp file survived. The half snapshot is unusable.
    pub fn has_partial_snapshot(&self) -> bool {
        self.temp_version.is_some() != self.temp_manifest.is_some()
    }
}

/// Load/save access to the state blobs in one cache directory.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Raw bytes of a state file, or `None` if it does not exist.
    pub fn load(&self, name: &str) -> SyncResult<Option<Vec<u8>>> {
        let path = self.path_of(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    /// Overwrite a state file. Readers see either the old or the new content.
    pub fn save(&self, name: &str, bytes: &[u8]) -> SyncResult<()> {
        write_atomic(&self.path_of(name), bytes)
    }

    /// Remove a state file. A missing file is not an error.
    pub fn remove(&self, name: &str) -> SyncResult<()> {
        let path = self.path_of(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::io(path, e)),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    /// Read every state file, treating anything unreadable as unset.
    pub fn load_local(&self) -> LocalState {
        LocalState {
            version: self.load_json(VERSION_FILE),
            manifest: self.load_manifest(MANIFEST_FILE),
            temp_version: self.load_json(TEMP_VERSION_FILE),
            temp_manifest: self.load_manifest(TEMP_MANIFEST_FILE),
        }
    }

    fn load_json<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let bytes = match self.load(name) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(file = name, "Failed to read state file: {}", e);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(file = name, "Ignoring corrupt state file: {}", e);
                None
            }
        }
    }

    fn load_manifest(&self, name: &str) -> Option<Manifest> {
        let manifest: Manifest = self.load_json(name)?;
        match manifest.validate() {
            Ok(()) => Some(manifest),
            Err(e) => {
                tracing::warn!(file = name, "Ignoring invalid local manifest: {}", e);
                None
            }
        }
    }

    fn save_json<T: Serialize>(&self, name: &str, value: &T) -> SyncResult<()> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| SyncError::parse(name, e))?;
        self.save(name, &bytes)
    }

    /// Record the server snapshot before any download starts.
    pub fn save_temp(&self, version: &VersionMarker, manifest: &Manifest) -> SyncResult<()> {
        self.save_json(TEMP_MANIFEST_FILE, manifest)?;
        self.save_json(TEMP_VERSION_FILE, version)
    }

    /// Persist a fully synced snapshot. The manifest goes first; the version
    /// file is the durability marker.
    pub fn save_final(&self, version: &VersionMarker, manifest: &Manifest) -> SyncResult<()> {
        self.save_json(MANIFEST_FILE, manifest)?;
        let mut marker = version.clone();
        marker.synced_at = Some(Utc::now());
        self.save_json(VERSION_FILE, &marker)
    }

    /// Persist a manifest that only lists assets known to be on disk, and drop
    /// the version marker so the next startup runs a full diff.
    pub fn save_degraded(&self, manifest: &Manifest) -> SyncResult<()> {
        self.remove(VERSION_FILE)?;
        self.save_json(MANIFEST_FILE, manifest)
    }

    pub fn clear_temp(&self) -> SyncResult<()> {
        self.remove(TEMP_VERSION_FILE)?;
        self.remove(TEMP_MANIFEST_FILE)
    }
}

/// Write `bytes` to `path` through a synced sibling file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
    }

    let temp_path = partial_path(path);
    {
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| SyncError::io(&temp_path, e))?;
        temp_file.write_all(bytes).map_err(|e| SyncError::io(&temp_path, e))?;
        temp_file.sync_all().map_err(|e| SyncError::io(&temp_path, e))?;
    }

    fs::rename(&temp_path, path).map_err(|e| SyncError::io(path, e))
}

/// Sibling path used while a file is being written.
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Exclusive ownership of a cache directory for the duration of a sync.
///
/// Released when dropped.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Acquire the lock, polling until `timeout` expires.
    pub fn acquire(dir: &Path, timeout: Duration) -> SyncResult<Self> {
        fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
        let path = dir.join(LOCK_FILE);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SyncError::io(&path, e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file, path }),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(SyncError::Lock(format!(
                            "timed out after {:?} waiting for {}; another process is syncing this cache",
                            timeout,
                            path.display()
                        )));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(SyncError::io(&path, e)),
            }
        }
    }

    /// Acquire the lock from async code without stalling the runtime.
    pub async fn acquire_async(dir: PathBuf, timeout: Duration) -> SyncResult<Self> {
        tokio::task::spawn_blocking(move || Self::acquire(&dir, timeout)).await?
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), "Failed to release cache lock: {}", e);
        }
    }
}
