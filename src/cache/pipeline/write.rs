// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cache-write stage: re-encode a downloaded image and store it atomically.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::worker::StageJob;
use crate::cache::codec;
use crate::cache::state::write_atomic;
use crate::cache::types::LoadedAsset;
use crate::error::SyncResult;

pub(crate) struct WriteJob {
    cache_dir: PathBuf,
}

impl WriteJob {
    pub(crate) fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }
}

#[async_trait]
impl StageJob for WriteJob {
    type Item = Arc<LoadedAsset>;

    async fn run(&self, asset: &Arc<LoadedAsset>) -> SyncResult<()> {
        let target = self.cache_dir.join(&asset.path);
        let asset = Arc::clone(asset);
        tokio::task::spawn_blocking(move || -> SyncResult<()> {
            let bytes = codec::encode(&asset.path, &asset.image)?;
            write_atomic(&target, &bytes)?;
            tracing::debug!(path = %asset.path, bytes = bytes.len(), "Cached asset");
            Ok(())
        })
        .await?
    }
}
