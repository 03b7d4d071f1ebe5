// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download stage: fetch from the origin, decode, publish, hand off to the
//! cache writer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::worker::StageJob;
use crate::cache::codec;
use crate::cache::events::{CacheEvent, EventBus, Stage};
use crate::cache::origin::Origin;
use crate::cache::table::AssetTable;
use crate::cache::types::{AssetRecord, LoadedAsset};
use crate::error::{SyncError, SyncResult};

pub(crate) struct DownloadJob {
    origin: Arc<dyn Origin>,
    table: Arc<AssetTable>,
    writer: mpsc::UnboundedSender<Arc<LoadedAsset>>,
    events: EventBus,
}

impl DownloadJob {
    pub(crate) fn new(
        origin: Arc<dyn Origin>,
        table: Arc<AssetTable>,
        writer: mpsc::UnboundedSender<Arc<LoadedAsset>>,
        events: EventBus,
    ) -> Self {
        Self { origin, table, writer, events }
    }
}

#[async_trait]
impl StageJob for DownloadJob {
    type Item = AssetRecord;

    async fn run(&self, record: &AssetRecord) -> SyncResult<()> {
        let bytes = self.origin.fetch_asset(record).await?;
        tracing::debug!(path = %record.path, bytes = bytes.len(), "Downloaded asset");

        let image = codec::decode_blocking(record.path.clone(), bytes).await?;
        let asset = Arc::new(LoadedAsset::new(record.clone(), image));

        // Visible to readers before it reaches disk.
        self.table.insert(Arc::clone(&asset));

        self.events.emit(CacheEvent::Queued {
            stage: Stage::Write,
            path: record.path.clone(),
        });
        self.writer
            .send(asset)
            .map_err(|_| SyncError::Task("cache writer stopped".into()))
    }

    fn should_retry(&self, err: &SyncError) -> bool {
        !err.is_permanent()
    }
}
