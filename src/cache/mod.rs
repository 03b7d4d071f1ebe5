// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asset cache synchronization
//!
//! Keeps a local directory of image assets in step with a remote catalog and
//! serves the decoded images from memory:
//! - Version short-circuit: an unchanged, intact cache is loaded without
//!   fetching the manifest
//! - Incremental sync: only new and changed assets are downloaded, orphans
//!   are deleted
//! - Crash recovery: an interrupted sync resumes from its saved snapshot
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ AssetCache      │────▶│ ManifestStore   │     │ Origin          │
//! │ (startup, sync) │     │ (*.dat files)   │     │ (HttpOrigin)    │
//! └────────┬────────┘     └─────────────────┘     └────────▲────────┘
//!          │ diff                                          │
//!          ▼                                               │
//! ┌─────────────────────────────────────────────────────────┴───────┐
//! │ Pipeline: [download] ──▶ [cache-write]   [load]   [delete]     │
//! └────────────────────────────────┬────────────────────────────────┘
//!                                  ▼
//!                         ┌─────────────────┐
//!                         │ AssetTable      │◀── get_by_path / name /
//!                         │ (in memory)     │    categories
//!                         └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use assetsync::cache::{AssetCache, CacheStatus};
//! use assetsync::SyncConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SyncConfig::new("https://cdn.example.com/game", "/var/cache/game");
//! let cache = AssetCache::with_http(config)?;
//!
//! // Runs in the background
//! cache.startup();
//!
//! if cache.wait_ready().await == CacheStatus::Ready {
//!     let icons = cache.get_by_categories(&["ui", "icons"]);
//!     println!("{} icons loaded", icons.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod diff;
pub mod events;
pub mod integrity;
pub mod manager;
pub mod origin;
pub mod pipeline;
pub mod state;
pub mod table;
pub mod types;

// Re-export commonly used items
pub use diff::ManifestDiff;
pub use events::{CacheEvent, EventBus, Stage};
pub use integrity::{check_integrity, IntegrityReport};
pub use manager::{AssetCache, CacheInspection, SyncReport};
pub use origin::{HttpOrigin, Origin};
pub use pipeline::{AssetFailure, PipelineSettings, RetryPolicy};
pub use state::{CacheLock, LocalState, ManifestStore};
pub use table::AssetTable;
pub use types::{AssetRecord, CacheStatus, LoadedAsset, Manifest, ManifestMeta, VersionMarker};
