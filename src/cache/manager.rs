// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asset cache manager: startup, sync orchestration and the read facade.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use super::diff::ManifestDiff;
use super::events::{CacheEvent, EventBus, DEFAULT_EVENT_CAPACITY};
use super::integrity::{check_integrity, IntegrityReport};
use super::origin::{HttpOrigin, Origin};
use super::pipeline::{AssetFailure, Pipeline, PipelineContext, PipelineReport};
use super::state::{CacheLock, LocalState, ManifestStore};
use super::table::AssetTable;
use super::types::{CacheStatus, LoadedAsset, Manifest, VersionMarker};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::locks::{resilient_read, resilient_write};

/// Outcome of one completed sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Catalog version the cache now reflects
    pub version: String,
    /// Resumed from the snapshot of an interrupted sync
    pub recovered: bool,
    /// Versions matched and the local cache was intact: nothing was fetched
    pub short_circuited: bool,
    pub downloaded: usize,
    pub written: usize,
    pub loaded: usize,
    pub deleted: usize,
    /// Assets a stage gave up on. Non-empty means the version marker was
    /// withheld and the next sync retries them.
    pub failures: Vec<AssetFailure>,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn new(version: &VersionMarker, pipeline: &PipelineReport, started: Instant) -> Self {
        Self {
            version: version.version.clone(),
            recovered: false,
            short_circuited: false,
            downloaded: pipeline.download.completed.len(),
            written: pipeline.write.completed.len(),
            loaded: pipeline.load.completed.len(),
            deleted: pipeline.delete.completed.len(),
            failures: pipeline.failures().cloned().collect(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// What is on disk in a cache directory, read without touching the network.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInspection {
    pub cache_dir: PathBuf,
    pub version: Option<VersionMarker>,
    /// Assets listed by the local manifest
    pub listed: usize,
    /// Listed assets whose file is missing
    pub missing: Vec<String>,
    /// Version marker present and every listed file on disk
    pub intact: bool,
    /// A previous sync was interrupted and will be resumed
    pub interrupted: bool,
}

impl CacheInspection {
    /// Inspect `cache_dir`. Missing or unreadable state counts as empty.
    pub fn read(cache_dir: &Path) -> Self {
        let local = ManifestStore::new(cache_dir).load_local();
        let listed = local.manifest.as_ref().map_or(0, Manifest::len);
        let interrupted = local.recovery_snapshot().is_some();
        let has_version = local.version.is_some();
        let integrity = check_integrity(local.manifest, cache_dir);

        Self {
            cache_dir: cache_dir.to_path_buf(),
            version: local.version,
            listed,
            missing: integrity.missing,
            intact: has_version && integrity.intact,
            interrupted,
        }
    }
}

struct Inner {
    config: SyncConfig,
    origin: Arc<dyn Origin>,
    store: ManifestStore,
    table: Arc<AssetTable>,
    events: EventBus,
    status: watch::Sender<CacheStatus>,
    ready_sent: AtomicBool,
    last_report: RwLock<Option<SyncReport>>,
}

/// Handle to one asset cache. Cheap to clone; clones share everything.
///
/// Readers may query the table at any time. Until [`AssetCache::status`]
/// reports [`CacheStatus::Ready`] the table can be incomplete.
#[derive(Clone)]
pub struct AssetCache {
    inner: Arc<Inner>,
}

impl AssetCache {
    pub fn new(config: SyncConfig, origin: Arc<dyn Origin>) -> Self {
        let (status, _) = watch::channel(CacheStatus::Unready);
        Self {
            inner: Arc::new(Inner {
                store: ManifestStore::new(&config.cache_dir),
                config,
                origin,
                table: Arc::new(AssetTable::new()),
                events: EventBus::new(DEFAULT_EVENT_CAPACITY),
                status,
                ready_sent: AtomicBool::new(false),
                last_report: RwLock::new(None),
            }),
        }
    }

    /// Cache backed by [`HttpOrigin`] at `config.origin`.
    pub fn with_http(config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let origin = HttpOrigin::new(&config)?;
        Ok(Self::new(config, Arc::new(origin)))
    }

    /// Start a sync in the background.
    ///
    /// Returns false without doing anything if a sync is running or the cache
    /// is already ready. Must be called inside a tokio runtime.
    pub fn startup(&self) -> bool {
        if !self.begin() {
            tracing::debug!(status = %self.status(), "Startup ignored");
            return false;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            // Outcome is published through status and events.
            let _ = cache.run().await;
        });
        true
    }

    /// Run a sync to completion on the current task.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        if !self.begin() {
            return Err(SyncError::Busy(self.status()));
        }
        self.run().await
    }

    pub fn status(&self) -> CacheStatus {
        *self.inner.status.borrow()
    }

    /// Status updates. The receiver sees the current value immediately.
    pub fn watch_status(&self) -> watch::Receiver<CacheStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until the running sync settles on `Ready` or `Failed`.
    ///
    /// Waits indefinitely while the cache is `Unready` and nobody starts it.
    pub async fn wait_ready(&self) -> CacheStatus {
        let mut rx = self.inner.status.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_settled() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Lifecycle events from now on. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    pub fn get_by_path(&self, path: &str) -> Option<Arc<LoadedAsset>> {
        self.inner.table.get_by_path(path)
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<LoadedAsset>> {
        self.inner.table.get_by_name(name)
    }

    pub fn get_by_categories(&self, categories: &[&str]) -> Vec<Arc<LoadedAsset>> {
        self.inner.table.get_by_categories(categories)
    }

    pub fn table(&self) -> Arc<AssetTable> {
        Arc::clone(&self.inner.table)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Report of the last successful sync.
    pub fn last_report(&self) -> Option<SyncReport> {
        resilient_read(&self.inner.last_report).clone()
    }

    /// Move `Unready`/`Failed` to `Initializing`. False if not allowed.
    fn begin(&self) -> bool {
        self.inner.status.send_if_modified(|status| {
            if status.can_start() {
                *status = CacheStatus::Initializing;
                true
            } else {
                false
            }
        })
    }

    async fn run(&self) -> SyncResult<SyncReport> {
        tracing::info!(
            origin = %self.inner.config.origin,
            cache_dir = %self.inner.config.cache_dir.display(),
            "Asset sync started"
        );

        match self.run_sync().await {
            Ok(report) => {
                *resilient_write(&self.inner.last_report) = Some(report.clone());
                self.inner.status.send_replace(CacheStatus::Ready);
                if !self.inner.ready_sent.swap(true, Ordering::SeqCst) {
                    self.inner.events.emit(CacheEvent::Ready);
                }
                tracing::info!(
                    version = %report.version,
                    assets = self.inner.table.len(),
                    downloaded = report.downloaded,
                    deleted = report.deleted,
                    failed = report.failures.len(),
                    elapsed_ms = report.elapsed_ms,
                    "Asset cache ready"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Asset sync failed: {}", e);
                self.inner.status.send_replace(CacheStatus::Failed);
                self.inner.events.emit(CacheEvent::SyncFailed { reason: e.to_string() });
                Err(e)
            }
        }
    }

    async fn run_sync(&self) -> SyncResult<SyncReport> {
        let started = Instant::now();
        let config = &self.inner.config;
        let _lock = CacheLock::acquire_async(config.cache_dir.clone(), config.lock_timeout()).await?;

        let (local, integrity) = self.read_local().await?;
        if local.has_partial_snapshot() {
            tracing::warn!("Ignoring half-written snapshot of an interrupted sync");
        }

        if let Some((version, manifest)) = local.recovery_snapshot() {
            tracing::info!(version = %version.version, "Resuming interrupted sync");
            let mut report = self.full_sync(version, manifest, integrity, true, started).await?;
            report.recovered = true;
            return Ok(report);
        }

        let server_version = self.inner.origin.fetch_version().await?;
        tracing::debug!(version = %server_version.version, "Fetched remote version");

        if integrity.intact {
            if let (Some(local_version), Some(manifest)) = (&local.version, &integrity.manifest) {
                if local_version.same_version(&server_version) {
                    tracing::info!(version = %server_version.version, "Catalog unchanged; loading from disk");
                    return self.load_local_only(&server_version, manifest, started).await;
                }
            }
        }

        let server_manifest = self.inner.origin.fetch_manifest().await?;
        self.full_sync(server_version, server_manifest, integrity, false, started)
            .await
    }

    async fn read_local(&self) -> SyncResult<(LocalState, IntegrityReport)> {
        let store = self.inner.store.clone();
        let cache_dir = self.inner.config.cache_dir.clone();
        let read = tokio::task::spawn_blocking(move || {
            let local = store.load_local();
            let integrity = check_integrity(local.manifest.clone(), &cache_dir);
            (local, integrity)
        });
        Ok(read.await?)
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::start(
            PipelineContext {
                cache_dir: self.inner.config.cache_dir.clone(),
                origin: Arc::clone(&self.inner.origin),
                table: Arc::clone(&self.inner.table),
                events: self.inner.events.clone(),
            },
            &self.inner.config.pipeline_settings(),
        )
    }

    async fn load_local_only(
        &self,
        version: &VersionMarker,
        manifest: &Manifest,
        started: Instant,
    ) -> SyncResult<SyncReport> {
        let pipeline = self.pipeline();
        for record in &manifest.assets {
            pipeline.enqueue_load(record.clone());
        }
        let outcome = pipeline.drain().await;
        if outcome.aborted() {
            return Err(SyncError::Task("a pipeline worker stopped unexpectedly".into()));
        }

        let unsynced = outcome.unsynced_paths();
        if !unsynced.is_empty() {
            tracing::warn!(failed = unsynced.len(), "Some cached assets could not be loaded");
            self.inner.store.save_degraded(&manifest.without(&unsynced))?;
        }

        let mut report = SyncReport::new(version, &outcome, started);
        report.short_circuited = true;
        Ok(report)
    }

    async fn full_sync(
        &self,
        server_version: VersionMarker,
        server_manifest: Manifest,
        integrity: IntegrityReport,
        recovering: bool,
        started: Instant,
    ) -> SyncResult<SyncReport> {
        server_manifest.validate()?;

        let diff = ManifestDiff::compute(integrity.manifest.as_ref(), &server_manifest);
        tracing::info!(
            new = diff.new.len(),
            changed = diff.changed.len(),
            unchanged = diff.unchanged.len(),
            orphaned = diff.orphaned.len(),
            "Computed manifest diff"
        );

        let store = &self.inner.store;
        if !recovering && diff.download_count() > 0 {
            store.save_temp(&server_version, &server_manifest)?;
        }

        let pipeline = self.pipeline();
        for record in diff.downloads() {
            pipeline.enqueue_download(record.clone());
        }
        for record in &diff.unchanged {
            pipeline.enqueue_load(record.clone());
        }
        for record in &diff.orphaned {
            pipeline.enqueue_delete(record.clone());
        }
        let outcome = pipeline.drain().await;
        if outcome.aborted() {
            return Err(SyncError::Task("a pipeline worker stopped unexpectedly".into()));
        }

        let unsynced = outcome.unsynced_paths();
        let undeleted = outcome.undeleted_paths();
        if unsynced.is_empty() && undeleted.is_empty() {
            store.save_final(&server_version, &server_manifest)?;
        } else {
            // Orphans still on disk stay listed so the next diff deletes them again.
            let mut manifest = server_manifest.without(&unsynced);
            manifest.assets.extend(
                diff.orphaned
                    .iter()
                    .filter(|record| undeleted.contains(&record.path))
                    .cloned(),
            );
            tracing::warn!(
                failed = unsynced.len(),
                undeleted = undeleted.len(),
                "Sync finished with failures; they will be retried on the next startup"
            );
            store.save_degraded(&manifest)?;
        }
        store.clear_temp()?;

        Ok(SyncReport::new(&server_version, &outcome, started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec;
    use crate::cache::state::{MANIFEST_FILE, VERSION_FILE};
    use crate::cache::types::AssetRecord;
    use async_trait::async_trait;
    use image::RgbaImage;
    use tempfile::TempDir;

    struct FixedOrigin {
        version: &'static str,
        manifest: Manifest,
    }

    #[async_trait]
    impl Origin for FixedOrigin {
        async fn fetch_version(&self) -> SyncResult<VersionMarker> {
            Ok(VersionMarker::new(self.version))
        }

        async fn fetch_manifest(&self) -> SyncResult<Manifest> {
            Ok(self.manifest.clone())
        }

        async fn fetch_asset(&self, record: &AssetRecord) -> SyncResult<Vec<u8>> {
            codec::encode(&record.path, &RgbaImage::new(1, 1))
        }
    }

    fn cache_for(dir: &TempDir, manifest: Manifest) -> AssetCache {
        let mut config = SyncConfig::new("http://origin.test", dir.path());
        config.retry_base_delay_ms = 1;
        AssetCache::new(config, Arc::new(FixedOrigin { version: "v1", manifest }))
    }

    #[tokio::test]
    async fn test_sync_reaches_ready() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new("m", vec![AssetRecord::new("a", "ui/a.png", "h")]);
        let cache = cache_for(&dir, manifest);
        assert_eq!(cache.status(), CacheStatus::Unready);

        let report = cache.sync().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert!(!report.is_degraded());
        assert_eq!(cache.status(), CacheStatus::Ready);
        assert!(cache.get_by_path("ui/a.png").is_some());
        assert!(dir.path().join(VERSION_FILE).is_file());
        assert!(dir.path().join(MANIFEST_FILE).is_file());
        assert!(cache.last_report().is_some());
    }

    #[tokio::test]
    async fn test_second_sync_is_busy() {
        let dir = TempDir::new().unwrap();
        let cache = cache_for(&dir, Manifest::default());
        cache.sync().await.unwrap();

        let err = cache.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Busy(CacheStatus::Ready)));
        assert!(!cache.startup());
    }

    #[tokio::test]
    async fn test_startup_then_wait() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new("m", vec![AssetRecord::new("a", "a.png", "h")]);
        let cache = cache_for(&dir, manifest);

        assert!(cache.startup());
        assert!(!cache.startup());
        assert_eq!(cache.wait_ready().await, CacheStatus::Ready);
        assert_eq!(cache.table().len(), 1);
    }

    #[tokio::test]
    async fn test_inspection_after_sync() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest::new("m", vec![AssetRecord::new("a", "a.png", "h")]);
        cache_for(&dir, manifest).sync().await.unwrap();

        let inspection = CacheInspection::read(dir.path());
        assert!(inspection.intact);
        assert_eq!(inspection.listed, 1);
        assert_eq!(inspection.version.map(|v| v.version), Some("v1".to_string()));

        std::fs::remove_file(dir.path().join("a.png")).unwrap();
        let inspection = CacheInspection::read(dir.path());
        assert!(!inspection.intact);
        assert_eq!(inspection.missing, vec!["a.png"]);
    }

    #[test]
    fn test_inspection_of_empty_dir() {
        let dir = TempDir::new().unwrap();
        let inspection = CacheInspection::read(dir.path());
        assert!(!inspection.intact);
        assert!(!inspection.interrupted);
        assert_eq!(inspection.listed, 0);
    }
}
