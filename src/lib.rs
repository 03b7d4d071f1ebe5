// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! assetsync - Local image asset cache kept in sync with a remote catalog
//!
//! Download once, load from disk afterwards, fetch only what changed.
//!
//! # Core Modules
//!
//! - [`cache`] - Sync engine, asset pipeline and the in-memory asset table
//! - [`config`] - Sync configuration (`~/.assetsync/config.json`)
//! - [`error`] - The [`SyncError`] taxonomy
//! - [`locks`] - Poison-tolerant `RwLock` helpers

pub mod cache;
pub mod config;
pub mod error;
pub mod locks;

// Re-export cache types
pub use cache::{
    AssetCache, AssetRecord, AssetTable, CacheEvent, CacheInspection, CacheStatus, HttpOrigin,
    LoadedAsset, Manifest, Origin, Stage, SyncReport, VersionMarker,
};

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
