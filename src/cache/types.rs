// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Catalog types shared by the store, the diff engine and the pipeline.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// File names owned by the store inside the cache directory. Asset paths may
/// not collide with them.
pub const RESERVED_NAMES: &[&str] = &[
    "manifest_version.dat",
    "manifest.dat",
    "temp_version.dat",
    "temp_manifest.dat",
    ".assetsync.lock",
];

/// Readiness of the in-memory asset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    /// No sync has been started yet
    Unready,
    /// A sync is running
    Initializing,
    /// The table is fully populated and safe to query
    Ready,
    /// The last sync could not complete (version/manifest unavailable, lock, persist)
    Failed,
}

impl CacheStatus {
    /// Returns true once the status can no longer change without a new startup.
    pub fn is_settled(&self) -> bool {
        matches!(self, CacheStatus::Ready | CacheStatus::Failed)
    }

    /// Returns true if a new sync may start from this status.
    pub fn can_start(&self) -> bool {
        matches!(self, CacheStatus::Unready | CacheStatus::Failed)
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CacheStatus::Unready => "unready",
            CacheStatus::Initializing => "initializing",
            CacheStatus::Ready => "ready",
            CacheStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One entry of a manifest.
///
/// `path` is the stable key: it is the URL suffix on the origin and the
/// relative location inside the cache directory. `hash` is only compared for
/// change detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AssetRecord {
    pub name: String,
    pub path: String,
    pub hash: String,
}

impl AssetRecord {
    pub fn new(name: impl Into<String>, path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            hash: hash.into(),
        }
    }

    /// Location of this asset inside `cache_dir`.
    ///
    /// Assumes the record came from a validated manifest.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(&self.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestMeta {
    #[serde(default)]
    pub hash: String,
}

/// Full catalog snapshot as served by `{origin}/manifest.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    #[serde(default)]
    pub meta: ManifestMeta,
    #[serde(default)]
    pub assets: Vec<AssetRecord>,
}

impl Manifest {
    pub fn new(meta_hash: impl Into<String>, assets: Vec<AssetRecord>) -> Self {
        Self {
            meta: ManifestMeta { hash: meta_hash.into() },
            assets,
        }
    }

    pub fn meta_hash(&self) -> &str {
        &self.meta.hash
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&AssetRecord> {
        self.assets.iter().find(|r| r.path == path)
    }

    /// Copy of this manifest without the given paths.
    pub fn without(&self, paths: &HashSet<String>) -> Manifest {
        Manifest {
            meta: self.meta.clone(),
            assets: self
                .assets
                .iter()
                .filter(|r| !paths.contains(&r.path))
                .cloned()
                .collect(),
        }
    }

    /// Check that every path is unique and stays inside the cache directory.
    ///
    /// Paths are compared in normalised form, so `./art/a.png` and
    /// `art/a.png` are the same asset. A path may not also be the parent
    /// directory of another path.
    pub fn validate(&self) -> SyncResult<()> {
        let mut seen = HashSet::with_capacity(self.assets.len());
        for record in &self.assets {
            validate_asset_path(&record.path)?;
            if !seen.insert(normalize_asset_path(&record.path)) {
                return Err(SyncError::InvalidManifest(format!(
                    "duplicate asset path '{}'",
                    record.path
                )));
            }
        }

        for path in &seen {
            let mut rest = path.as_str();
            while let Some((parent, _)) = rest.rsplit_once('/') {
                if seen.contains(parent) {
                    return Err(SyncError::InvalidManifest(format!(
                        "asset path '{}' is the parent directory of '{}'",
                        parent, path
                    )));
                }
                rest = parent;
            }
        }
        Ok(())
    }
}

/// Canonical form of an asset path: its plain segments joined with `/`.
///
/// `./art//a.png` and `art/a.png/` both become `art/a.png`. Only meaningful
/// for paths that pass [`validate_asset_path`].
pub fn normalize_asset_path(path: &str) -> String {
    Path::new(path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(segment) => segment.to_str(),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Check that an asset path is a non-empty relative path that cannot escape
/// the cache directory or shadow one of the store's own files.
pub fn validate_asset_path(path: &str) -> SyncResult<()> {
    let invalid = |reason: &str| {
        Err(SyncError::InvalidManifest(format!("asset path '{}' {}", path, reason)))
    };

    if path.is_empty() {
        return invalid("is empty");
    }
    if path.contains('\0') {
        return invalid("contains a NUL byte");
    }

    let mut top = None;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) => {
                top.get_or_insert(segment);
            }
            Component::CurDir => {}
            Component::ParentDir => return invalid("escapes the cache directory"),
            Component::RootDir | Component::Prefix(_) => return invalid("is absolute"),
        }
    }
    let Some(top) = top else {
        return invalid("has no file name");
    };
    // State files live at the top of the cache directory; a directory with
    // the same name would block them too.
    if RESERVED_NAMES.iter().any(|name| top == *name) {
        return invalid("collides with a cache state file");
    }
    Ok(())
}

/// Coarse catalog version. Equal markers mean the whole catalog is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionMarker {
    pub version: String,
    /// When this marker was persisted locally. Never sent by the origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl VersionMarker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            synced_at: None,
        }
    }

    /// Versions match regardless of when they were persisted.
    pub fn same_version(&self, other: &VersionMarker) -> bool {
        self.version == other.version
    }
}

/// An asset decoded and resident in memory.
///
/// Only built from a successful download or a successful disk load.
#[derive(Debug, Clone)]
pub struct LoadedAsset {
    pub name: String,
    pub path: String,
    pub hash: String,
    pub image: RgbaImage,
}

impl LoadedAsset {
    pub fn new(record: AssetRecord, image: RgbaImage) -> Self {
        Self {
            name: record.name,
            path: record.path,
            hash: record.hash,
            image,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
