// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Image decoding for downloaded/cached bytes and re-encoding for the cache.
//!
//! The origin may serve any supported format; the cache always stores PNG.

use std::io::Cursor;

use image::{ImageFormat, RgbaImage};

use crate::error::{SyncError, SyncResult};

/// Format written to the cache directory.
pub const CACHE_FORMAT: ImageFormat = ImageFormat::Png;

/// Decode bytes of any supported format to RGBA8.
pub fn decode(path: &str, bytes: &[u8]) -> SyncResult<RgbaImage> {
    let image = image::load_from_memory(bytes).map_err(|e| SyncError::decode(path, e))?;
    Ok(image.to_rgba8())
}

/// Encode an image in the cache format.
pub fn encode(path: &str, image: &RgbaImage) -> SyncResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, CACHE_FORMAT)
        .map_err(|e| SyncError::decode(path, e))?;
    Ok(buf.into_inner())
}

/// Decode on the blocking pool.
pub async fn decode_blocking(path: String, bytes: Vec<u8>) -> SyncResult<RgbaImage> {
    tokio::task::spawn_blocking(move || decode(&path, &bytes)).await?
}
