// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The four-stage asset pipeline.
//!
//! ```text
//!   enqueue_download ──► [download] ──► [cache-write]
//!   enqueue_load ──────► [load]
//!   enqueue_delete ────► [delete]
//! ```
//!
//! Each stage is one worker with its own FIFO queue and concurrency cap.
//! A downloaded asset is inserted into the table before it is queued for
//! writing. [`Pipeline::drain`] closes the queues and waits until every
//! stage is empty and idle.

mod delete;
mod download;
mod load;
pub mod worker;
mod write;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use self::delete::DeleteJob;
use self::download::DownloadJob;
use self::load::LoadJob;
use self::worker::{run_stage, WorkerSettings};
use self::write::WriteJob;
use super::events::{CacheEvent, EventBus, Stage};
use super::origin::Origin;
use super::table::AssetTable;
use super::types::AssetRecord;

pub use self::worker::{AssetFailure, RetryPolicy, StageReport};

/// Concurrency caps and download retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub download_concurrency: usize,
    pub write_concurrency: usize,
    pub load_concurrency: usize,
    pub delete_concurrency: usize,
    pub download_retry: RetryPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            download_concurrency: 1,
            write_concurrency: 4,
            load_concurrency: 8,
            delete_concurrency: 1,
            download_retry: RetryPolicy::default(),
        }
    }
}

/// Shared handles the stages work against.
#[derive(Clone)]
pub struct PipelineContext {
    pub cache_dir: PathBuf,
    pub origin: Arc<dyn Origin>,
    pub table: Arc<AssetTable>,
    pub events: EventBus,
}

/// Per-stage outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub download: StageReport,
    pub write: StageReport,
    pub load: StageReport,
    pub delete: StageReport,
}

impl PipelineReport {
    pub fn stages(&self) -> [&StageReport; 4] {
        [&self.download, &self.write, &self.load, &self.delete]
    }

    pub fn failures(&self) -> impl Iterator<Item = &AssetFailure> {
        self.stages().into_iter().flat_map(|s| s.failures.iter())
    }

    pub fn failure_count(&self) -> usize {
        self.stages().iter().map(|s| s.failures.len()).sum()
    }

    /// True if any worker loop died and its report is incomplete.
    pub fn aborted(&self) -> bool {
        self.stages().iter().any(|s| s.aborted)
    }

    /// Paths that did not end up both on disk and in the table.
    pub fn unsynced_paths(&self) -> HashSet<String> {
        [&self.download, &self.write, &self.load]
            .into_iter()
            .flat_map(|s| s.failures.iter().map(|f| f.path.clone()))
            .collect()
    }

    /// Orphans whose file could not be removed.
    pub fn undeleted_paths(&self) -> HashSet<String> {
        self.delete.failures.iter().map(|f| f.path.clone()).collect()
    }
}

/// A running pipeline. Dropping it without [`Pipeline::drain`] closes the
/// queues and lets the workers finish in the background.
pub struct Pipeline {
    download_tx: mpsc::UnboundedSender<AssetRecord>,
    load_tx: mpsc::UnboundedSender<AssetRecord>,
    delete_tx: mpsc::UnboundedSender<AssetRecord>,
    download: JoinHandle<StageReport>,
    write: JoinHandle<StageReport>,
    load: JoinHandle<StageReport>,
    delete: JoinHandle<StageReport>,
    events: EventBus,
}

impl Pipeline {
    /// Spawn the four workers. Must be called inside a tokio runtime.
    pub fn start(ctx: PipelineContext, settings: &PipelineSettings) -> Self {
        let (download_tx, download_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (load_tx, load_rx) = mpsc::unbounded_channel();
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();

        // The download job owns the only write sender, so the writer stops
        // once the downloader has.
        let download = tokio::spawn(run_stage(
            Arc::new(DownloadJob::new(
                Arc::clone(&ctx.origin),
                Arc::clone(&ctx.table),
                write_tx,
                ctx.events.clone(),
            )),
            download_rx,
            WorkerSettings::new(Stage::Download, settings.download_concurrency)
                .with_retry(settings.download_retry),
            ctx.events.clone(),
        ));
        let write = tokio::spawn(run_stage(
            Arc::new(WriteJob::new(ctx.cache_dir.clone())),
            write_rx,
            WorkerSettings::new(Stage::Write, settings.write_concurrency),
            ctx.events.clone(),
        ));
        let load = tokio::spawn(run_stage(
            Arc::new(LoadJob::new(ctx.cache_dir.clone(), Arc::clone(&ctx.table))),
            load_rx,
            WorkerSettings::new(Stage::Load, settings.load_concurrency),
            ctx.events.clone(),
        ));
        let delete = tokio::spawn(run_stage(
            Arc::new(DeleteJob::new(ctx.cache_dir.clone(), Arc::clone(&ctx.table))),
            delete_rx,
            WorkerSettings::new(Stage::Delete, settings.delete_concurrency),
            ctx.events.clone(),
        ));

        Self {
            download_tx,
            load_tx,
            delete_tx,
            download,
            write,
            load,
            delete,
            events: ctx.events,
        }
    }

    pub fn enqueue_download(&self, record: AssetRecord) {
        Self::enqueue(&self.events, Stage::Download, &self.download_tx, record);
    }

    pub fn enqueue_load(&self, record: AssetRecord) {
        Self::enqueue(&self.events, Stage::Load, &self.load_tx, record);
    }

    pub fn enqueue_delete(&self, record: AssetRecord) {
        Self::enqueue(&self.events, Stage::Delete, &self.delete_tx, record);
    }

    fn enqueue(
        events: &EventBus,
        stage: Stage,
        tx: &mpsc::UnboundedSender<AssetRecord>,
        record: AssetRecord,
    ) {
        events.emit(CacheEvent::Queued { stage, path: record.path.clone() });
        if let Err(e) = tx.send(record) {
            tracing::error!(stage = %stage, path = %e.0.path, "Worker stopped before the asset was queued");
        }
    }

    /// Close the queues and wait for every stage to go idle.
    pub async fn drain(self) -> PipelineReport {
        let Pipeline {
            download_tx,
            load_tx,
            delete_tx,
            download,
            write,
            load,
            delete,
            ..
        } = self;
        drop(download_tx);
        drop(load_tx);
        drop(delete_tx);

        let (download, write, load, delete) = tokio::join!(download, write, load, delete);
        PipelineReport {
            download: settle(Stage::Download, download),
            write: settle(Stage::Write, write),
            load: settle(Stage::Load, load),
            delete: settle(Stage::Delete, delete),
        }
    }
}

fn settle(stage: Stage, joined: Result<StageReport, JoinError>) -> StageReport {
    match joined {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(stage = %stage, "Worker loop died: {}", e);
            let mut report = StageReport::new(stage);
            report.aborted = true;
            report
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec;
    use crate::error::{SyncError, SyncResult};
    use crate::cache::types::{Manifest, VersionMarker};
    use async_trait::async_trait;
    use image::RgbaImage;
    use tempfile::TempDir;

    /// Serves a 2x2 PNG for every path except `missing`.
    struct StaticOrigin {
        missing: &'static str,
    }

    #[async_trait]
    impl Origin for StaticOrigin {
        async fn fetch_version(&self) -> SyncResult<VersionMarker> {
            Ok(VersionMarker::new("v1"))
        }

        async fn fetch_manifest(&self) -> SyncResult<Manifest> {
            Ok(Manifest::default())
        }

        async fn fetch_asset(&self, record: &AssetRecord) -> SyncResult<Vec<u8>> {
            if record.path == self.missing {
                return Err(SyncError::Status { url: record.path.clone(), status: 404 });
            }
            codec::encode(&record.path, &RgbaImage::new(2, 2))
        }
    }

    fn context(dir: &TempDir) -> PipelineContext {
        PipelineContext {
            cache_dir: dir.path().to_path_buf(),
            origin: Arc::new(StaticOrigin { missing: "art/gone.png" }),
            table: Arc::new(AssetTable::new()),
            events: EventBus::default(),
        }
    }

    #[tokio::test]
    async fn test_download_reaches_table_and_disk() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let table = Arc::clone(&ctx.table);

        let pipeline = Pipeline::start(ctx, &PipelineSettings::default());
        pipeline.enqueue_download(AssetRecord::new("hero", "art/hero.png", "h1"));
        let report = pipeline.drain().await;

        assert_eq!(report.download.completed, vec!["art/hero.png"]);
        assert_eq!(report.write.completed, vec!["art/hero.png"]);
        assert_eq!(report.failure_count(), 0);
        assert!(table.contains("art/hero.png"));
        assert!(dir.path().join("art/hero.png").is_file());
        assert!(!dir.path().join("art/hero.png.partial").exists());
    }

    #[tokio::test]
    async fn test_load_and_delete() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("ui")).unwrap();
        let png = codec::encode("ui/a.png", &RgbaImage::new(1, 1)).unwrap();
        std::fs::write(dir.path().join("ui/a.png"), &png).unwrap();
        std::fs::write(dir.path().join("ui/old.png"), &png).unwrap();

        let ctx = context(&dir);
        let table = Arc::clone(&ctx.table);
        let pipeline = Pipeline::start(ctx, &PipelineSettings::default());
        pipeline.enqueue_load(AssetRecord::new("a", "ui/a.png", "h"));
        pipeline.enqueue_delete(AssetRecord::new("old", "ui/old.png", "h"));
        pipeline.enqueue_delete(AssetRecord::new("never", "ui/never.png", "h"));
        let report = pipeline.drain().await;

        assert_eq!(report.failure_count(), 0);
        assert!(table.contains("ui/a.png"));
        assert!(!dir.path().join("ui/old.png").exists());
        assert_eq!(report.delete.completed.len(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_reported_once() {
        let dir = TempDir::new().unwrap();
        let pipeline = Pipeline::start(context(&dir), &PipelineSettings::default());
        pipeline.enqueue_download(AssetRecord::new("gone", "art/gone.png", "h"));
        let report = pipeline.drain().await;

        assert_eq!(report.download.failures.len(), 1);
        assert_eq!(report.download.failures[0].attempts, 1);
        assert!(report.unsynced_paths().contains("art/gone.png"));
        assert!(report.write.completed.is_empty());
        assert!(!report.aborted());
    }

    #[tokio::test]
    async fn test_unreadable_cache_file_fails_load() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.png"), b"not a png").unwrap();

        let ctx = context(&dir);
        let table = Arc::clone(&ctx.table);
        let pipeline = Pipeline::start(ctx, &PipelineSettings::default());
        pipeline.enqueue_load(AssetRecord::new("bad", "bad.png", "h"));
        let report = pipeline.drain().await;

        assert_eq!(report.load.failures.len(), 1);
        assert!(!table.contains("bad.png"));
    }
}
