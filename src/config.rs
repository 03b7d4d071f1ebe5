// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sync configuration.
//!
//! Loaded from `~/.assetsync/config.json` (or an explicit path). Every field
//! has a default, so a partial file is fine and a missing file yields
//! [`SyncConfig::default`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::pipeline::{PipelineSettings, RetryPolicy};
use crate::error::{SyncError, SyncResult};

/// Name of the config file inside the config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Settings for one asset cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL serving `version.json`, `manifest.json` and the assets
    #[serde(default)]
    pub origin: String,
    /// Directory holding cached assets and state files
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// In-flight HTTP requests. Kept at 1 by default: the origin does not
    /// cope with concurrent load
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_max_concurrent_writes")]
    pub max_concurrent_writes: usize,
    #[serde(default = "default_max_concurrent_loads")]
    pub max_concurrent_loads: usize,
    #[serde(default = "default_max_concurrent_deletes")]
    pub max_concurrent_deletes: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Total time allowed for one request, body included
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Extra attempts the HTTP client makes for one request
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    /// Times an asset goes through the download queue before it is given up on
    #[serde(default = "default_max_download_attempts")]
    pub max_download_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Largest asset body accepted from the origin
    #[serde(default = "default_max_asset_bytes")]
    pub max_asset_bytes: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("assetsync"))
        .unwrap_or_else(|| PathBuf::from(".assetsync/cache"))
}

fn default_max_concurrent_downloads() -> usize {
    1
}

fn default_max_concurrent_writes() -> usize {
    4
}

fn default_max_concurrent_loads() -> usize {
    8
}

fn default_max_concurrent_deletes() -> usize {
    1
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_transport_retries() -> u32 {
    2
}

fn default_max_download_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_max_asset_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_lock_timeout_secs() -> u64 {
    5
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            origin: String::new(),
            cache_dir: default_cache_dir(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_concurrent_writes: default_max_concurrent_writes(),
            max_concurrent_loads: default_max_concurrent_loads(),
            max_concurrent_deletes: default_max_concurrent_deletes(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            transport_retries: default_transport_retries(),
            max_download_attempts: default_max_download_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_asset_bytes: default_max_asset_bytes(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl SyncConfig {
    /// Config for `origin`, cached in `cache_dir`, everything else default.
    pub fn new(origin: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            origin: origin.into(),
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// `~/.assetsync/config.json`, if there is a home directory.
    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Write as pretty JSON, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.origin.trim().is_empty() {
            return Err(SyncError::Config("origin URL is not set".into()));
        }
        if !(self.origin.starts_with("http://") || self.origin.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "origin '{}' must be an http(s) URL",
                self.origin
            )));
        }
        let caps = [
            ("max_concurrent_downloads", self.max_concurrent_downloads),
            ("max_concurrent_writes", self.max_concurrent_writes),
            ("max_concurrent_loads", self.max_concurrent_loads),
            ("max_concurrent_deletes", self.max_concurrent_deletes),
        ];
        for (name, value) in caps {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.max_download_attempts == 0 {
            return Err(SyncError::Config("max_download_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn download_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_download_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms.max(self.retry_base_delay_ms)),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            download_concurrency: self.max_concurrent_downloads.max(1),
            write_concurrency: self.max_concurrent_writes.max(1),
            load_concurrency: self.max_concurrent_loads.max(1),
            delete_concurrency: self.max_concurrent_deletes.max(1),
            download_retry: self.download_retry(),
        }
    }
}

/// `~/.assetsync`, if a home directory exists.
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".assetsync"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_concurrent_downloads, 1);
        assert_eq!(config.max_concurrent_writes, 4);
        assert_eq!(config.max_download_attempts, 5);
        assert!(config.origin.is_empty());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"origin": "https://cdn.example.com/game", "max_concurrent_downloads": 3}"#)
            .unwrap();

        let config = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(config.origin, "https://cdn.example.com/game");
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.max_concurrent_loads, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = SyncConfig::load(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("config.json");
        let config = SyncConfig::new("http://localhost:9000", dir.path().join("cache"));
        config.save(&path).unwrap();

        let loaded = SyncConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.origin, "http://localhost:9000");
        assert_eq!(loaded.cache_dir, dir.path().join("cache"));
    }

    #[test]
    fn test_default_path_is_under_config_dir() {
        if let Some(path) = SyncConfig::default_path() {
            assert!(path.ends_with(".assetsync/config.json"));
        }
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let mut config = SyncConfig::new("http://localhost", "/tmp/x");
        config.max_concurrent_writes = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent_writes"));

        let mut config = SyncConfig::new("ftp://localhost", "/tmp/x");
        assert!(config.validate().is_err());
        config.origin = "http://localhost".into();
        config.max_download_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let mut config = SyncConfig::default();
        config.retry_base_delay_ms = 100;
        config.retry_max_delay_ms = 50;
        let policy = config.download_retry();
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_millis(100));
    }
}
