// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The in-memory asset table.
//!
//! Safe to read from any thread at any time. Only pipeline workers write.

use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use super::types::{normalize_asset_path, LoadedAsset};
use crate::locks::{resilient_read, resilient_write};

/// Decoded assets keyed by normalised path, in insertion order.
#[derive(Debug, Default)]
pub struct AssetTable {
    assets: RwLock<IndexMap<String, Arc<LoadedAsset>>>,
}

impl AssetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an asset, replacing any previous entry for the same path.
    /// A replaced entry keeps its position.
    pub fn insert(&self, asset: Arc<LoadedAsset>) -> Option<Arc<LoadedAsset>> {
        resilient_write(&self.assets).insert(normalize_asset_path(&asset.path), asset)
    }

    pub fn remove(&self, path: &str) -> Option<Arc<LoadedAsset>> {
        resilient_write(&self.assets).shift_remove(&normalize_asset_path(path))
    }

    pub fn get_by_path(&self, path: &str) -> Option<Arc<LoadedAsset>> {
        resilient_read(&self.assets).get(&normalize_asset_path(path)).cloned()
    }

    /// First asset with this name. Names are not unique; paths are.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<LoadedAsset>> {
        resilient_read(&self.assets)
            .values()
            .find(|asset| asset.name == name)
            .cloned()
    }

    /// Assets whose leading directory segments equal `categories`, in order.
    ///
    /// `["ui", "icons"]` matches `ui/icons/save.png` and
    /// `ui/icons/small/save.png`, but not `ui/iconset/save.png` or
    /// `ui/icons.png`. An empty slice matches everything.
    pub fn get_by_categories(&self, categories: &[&str]) -> Vec<Arc<LoadedAsset>> {
        resilient_read(&self.assets)
            .values()
            .filter(|asset| in_categories(&asset.path, categories))
            .cloned()
            .collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        resilient_read(&self.assets).contains_key(&normalize_asset_path(path))
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.assets).len()
    }

    pub fn is_empty(&self) -> bool {
        resilient_read(&self.assets).is_empty()
    }
}

fn in_categories(path: &str, categories: &[&str]) -> bool {
    let mut segments = path.split('/').filter(|s| !s.is_empty() && *s != ".");
    let mut dirs = Vec::new();
    let mut file = segments.next();
    for next in segments {
        if let Some(dir) = file.replace(next) {
            dirs.push(dir);
        }
    }
    dirs.len() >= categories.len() && dirs.iter().zip(categories).all(|(dir, cat)| dir == cat)
}
