// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote catalog access.
//!
//! The origin serves three kinds of documents:
//!
//! - `{origin}/version.json` → `{"Version": "..."}`
//! - `{origin}/manifest.json` → `{"Meta": {"Hash": ...}, "Assets": [...]}`
//! - `{origin}/{asset.Path}` → raw image bytes

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;

use super::types::{AssetRecord, Manifest, VersionMarker};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

pub const VERSION_DOCUMENT: &str = "version.json";
pub const MANIFEST_DOCUMENT: &str = "manifest.json";

/// Pause between transport-level attempts, multiplied by the attempt number.
const TRANSPORT_RETRY_STEP: Duration = Duration::from_millis(250);

/// Source of the remote catalog.
///
/// [`HttpOrigin`] is the production implementation; tests substitute their own.
#[async_trait]
pub trait Origin: Send + Sync {
    async fn fetch_version(&self) -> SyncResult<VersionMarker>;

    async fn fetch_manifest(&self) -> SyncResult<Manifest>;

    /// Raw bytes of one asset.
    async fn fetch_asset(&self, record: &AssetRecord) -> SyncResult<Vec<u8>>;
}

/// Origin reached over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    /// Parsed origin; asset paths are appended segment by segment
    base_url: Url,
    /// HTTP client with connect and total timeouts
    client: reqwest::Client,
    /// Extra attempts per request for retryable failures
    transport_retries: u32,
    max_body_bytes: u64,
}

impl HttpOrigin {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .user_agent(concat!("assetsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to create HTTP client: {}", e)))?;

        let origin = config.origin.trim_end_matches('/');
        let base_url = Url::parse(origin)
            .map_err(|e| SyncError::Config(format!("origin '{}' is not a valid URL: {}", origin, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::Config(format!("origin '{}' cannot hold asset paths", origin)));
        }

        Ok(Self {
            base_url,
            client,
            transport_retries: config.transport_retries,
            max_body_bytes: config.max_asset_bytes,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Absolute URL of a document or asset path.
    ///
    /// Each segment is percent-encoded, so `#` and `?` stay part of the path.
    /// Empty and `.` segments are dropped.
    pub fn url_for(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        // Only fails for cannot-be-a-base URLs, which `new` rejects.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(path.split('/').filter(|s| !s.is_empty() && *s != "."));
        }
        url
    }

    async fn get_bytes(&self, url: &str) -> SyncResult<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            match self.get_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() && attempt < self.transport_retries => {
                    attempt += 1;
                    tracing::debug!(url, attempt, "Retrying request: {}", e);
                    tokio::time::sleep(TRANSPORT_RETRY_STEP * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, url: &str) -> SyncResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let too_large = || SyncError::TooLarge {
            url: url.to_string(),
            limit: self.max_body_bytes,
        };
        if response.content_length().is_some_and(|len| len > self.max_body_bytes) {
            return Err(too_large());
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_error(url, e))?;
            if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> SyncError {
    SyncError::Transport {
        url: url.to_string(),
        message: err.to_string(),
        timeout: err.is_timeout(),
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch_version(&self) -> SyncResult<VersionMarker> {
        let body = self.get_bytes(self.url_for(VERSION_DOCUMENT).as_str()).await?;
        let mut marker: VersionMarker =
            serde_json::from_slice(&body).map_err(|e| SyncError::parse(VERSION_DOCUMENT, e))?;
        marker.synced_at = None;
        Ok(marker)
    }

    async fn fetch_manifest(&self) -> SyncResult<Manifest> {
        let body = self.get_bytes(self.url_for(MANIFEST_DOCUMENT).as_str()).await?;
        serde_json::from_slice(&body).map_err(|e| SyncError::parse(MANIFEST_DOCUMENT, e))
    }

    async fn fetch_asset(&self, record: &AssetRecord) -> SyncResult<Vec<u8>> {
        self.get_bytes(self.url_for(&record.path).as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_for_normalizes_slashes() {
        let origin = HttpOrigin::new(&SyncConfig::new("https://cdn.example.com/game/", "/tmp")).unwrap();
        assert_eq!(origin.base_url(), "https://cdn.example.com/game");
        assert_eq!(
            origin.url_for("/art/a.png").as_str(),
            "https://cdn.example.com/game/art/a.png"
        );
        assert_eq!(
            origin.url_for("./art//a.png").as_str(),
            "https://cdn.example.com/game/art/a.png"
        );
        assert_eq!(
            origin.url_for(VERSION_DOCUMENT).as_str(),
            "https://cdn.example.com/game/version.json"
        );

        let bare = HttpOrigin::new(&SyncConfig::new("https://cdn.example.com", "/tmp")).unwrap();
        assert_eq!(bare.url_for(MANIFEST_DOCUMENT).as_str(), "https://cdn.example.com/manifest.json");
    }

    #[test]
    fn test_url_for_escapes_each_segment() {
        let origin = HttpOrigin::new(&SyncConfig::new("https://cdn.example.com/game", "/tmp")).unwrap();
        let url = origin.url_for("art/#1 hero?.png");
        assert_eq!(url.as_str(), "https://cdn.example.com/game/art/%231%20hero%3F.png");
        assert!(url.fragment().is_none());
        assert!(url.query().is_none());
        assert_eq!(
            origin.url_for("ui/100%.png").as_str(),
            "https://cdn.example.com/game/ui/100%25.png"
        );
    }

    #[test]
    fn test_unparseable_origin_is_config_error() {
        let err = HttpOrigin::new(&SyncConfig::new("http://", "/tmp")).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_transport_error() {
        let mut config = SyncConfig::new("http://127.0.0.1:9", "/tmp");
        config.transport_retries = 0;
        config.connect_timeout_secs = 1;
        let origin = HttpOrigin::new(&config).unwrap();

        let err = origin.fetch_version().await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {}", err);
    }
}
