// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delete stage: drop an orphaned asset from the table and the disk.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::worker::StageJob;
use crate::cache::table::AssetTable;
use crate::cache::types::AssetRecord;
use crate::error::{SyncError, SyncResult};

pub(crate) struct DeleteJob {
    cache_dir: PathBuf,
    table: Arc<AssetTable>,
}

impl DeleteJob {
    pub(crate) fn new(cache_dir: PathBuf, table: Arc<AssetTable>) -> Self {
        Self { cache_dir, table }
    }
}

#[async_trait]
impl StageJob for DeleteJob {
    type Item = AssetRecord;

    async fn run(&self, record: &AssetRecord) -> SyncResult<()> {
        self.table.remove(&record.path);

        let target = record.cache_path(&self.cache_dir);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %record.path, "Orphan already gone from disk");
                Ok(())
            }
            Err(e) => Err(SyncError::io(target, e)),
        }
    }
}
