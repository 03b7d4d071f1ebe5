// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Load stage: read an unchanged asset from the cache directory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::worker::StageJob;
use crate::cache::codec;
use crate::cache::table::AssetTable;
use crate::cache::types::{AssetRecord, LoadedAsset};
use crate::error::{SyncError, SyncResult};

pub(crate) struct LoadJob {
    cache_dir: PathBuf,
    table: Arc<AssetTable>,
}

impl LoadJob {
    pub(crate) fn new(cache_dir: PathBuf, table: Arc<AssetTable>) -> Self {
        Self { cache_dir, table }
    }
}

#[async_trait]
impl StageJob for LoadJob {
    type Item = AssetRecord;

    async fn run(&self, record: &AssetRecord) -> SyncResult<()> {
        let source = record.cache_path(&self.cache_dir);
        let bytes = tokio::fs::read(&source)
            .await
            .map_err(|e| SyncError::io(&source, e))?;
        let image = codec::decode_blocking(record.path.clone(), bytes).await?;
        self.table.insert(Arc::new(LoadedAsset::new(record.clone(), image)));
        Ok(())
    }
}
