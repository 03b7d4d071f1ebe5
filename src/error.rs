// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the asset cache.
//!
//! Every failure the sync engine can hit is a [`SyncError`]. Whether a failure
//! ends the sync, or only drops one asset from the current pass, is decided by
//! the caller (see [`SyncError::is_retryable`]).

use std::fmt;
use std::path::PathBuf;

use crate::cache::types::CacheStatus;

/// Result alias used throughout the cache.
pub type SyncResult<T> = Result<T, SyncError>;

/// Error types specific to asset synchronization.
#[derive(Debug)]
pub enum SyncError {
    /// Connection failure or timeout talking to the origin.
    Transport { url: String, message: String, timeout: bool },
    /// The origin answered with a non-success HTTP status.
    Status { url: String, status: u16 },
    /// The response body exceeded the configured size limit.
    TooLarge { url: String, limit: u64 },
    /// A version or manifest document could not be deserialized.
    Parse { what: String, message: String },
    /// Image bytes could not be decoded or re-encoded.
    Decode { path: String, message: String },
    /// A filesystem operation on the cache directory failed.
    Io { path: PathBuf, source: std::io::Error },
    /// The manifest violates a structural invariant (duplicate or unsafe path).
    InvalidManifest(String),
    /// The cache directory lock could not be acquired.
    Lock(String),
    /// A sync was requested while the cache was not in a startable state.
    Busy(CacheStatus),
    /// A background task panicked or was cancelled.
    Task(String),
    /// Invalid configuration.
    Config(String),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn parse(what: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Parse { what: what.into(), message: err.to_string() }
    }

    pub(crate) fn decode(path: impl Into<String>, err: impl fmt::Display) -> Self {
        Self::Decode { path: path.into(), message: err.to_string() }
    }

    /// Returns true for failures that may succeed if the request is repeated:
    /// connection errors, timeouts, 5xx, 408 and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    /// Returns true for failures that repeating the whole download cannot fix.
    /// Decode errors are not permanent: a truncated body decodes fine next time.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status { .. } => !self.is_retryable(),
            Self::TooLarge { .. } | Self::InvalidManifest(_) | Self::Config(_) => true,
            _ => false,
        }
    }

    /// Returns true if the origin could not be reached or refused the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Status { .. })
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport { url, message, timeout: true } => {
                write!(f, "Request to {} timed out: {}", url, message)
            }
            Self::Transport { url, message, .. } => {
                write!(f, "Request to {} failed: {}", url, message)
            }
            Self::Status { url, status } => write!(f, "{} returned HTTP {}", url, status),
            Self::TooLarge { url, limit } => {
                write!(f, "Response from {} exceeds {} bytes", url, limit)
            }
            Self::Parse { what, message } => write!(f, "Failed to parse {}: {}", what, message),
            Self::Decode { path, message } => write!(f, "Failed to decode image {}: {}", path, message),
            Self::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            Self::InvalidManifest(msg) => write!(f, "Invalid manifest: {}", msg),
            Self::Lock(msg) => write!(f, "Cache directory is locked: {}", msg),
            Self::Busy(status) => write!(f, "Cache cannot start a sync while {}", status),
            Self::Task(msg) => write!(f, "Background task failed: {}", msg),
            Self::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transport = SyncError::Transport {
            url: "http://origin/a.png".into(),
            message: "connection refused".into(),
            timeout: false,
        };
        assert!(transport.is_retryable());
        assert!(transport.is_transport());

        let unavailable = SyncError::Status { url: "u".into(), status: 503 };
        let throttled = SyncError::Status { url: "u".into(), status: 429 };
        let missing = SyncError::Status { url: "u".into(), status: 404 };
        assert!(unavailable.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!missing.is_retryable());
        assert!(missing.is_transport());

        let decode = SyncError::decode("art/a.png", "bad header");
        assert!(!decode.is_retryable());
        assert!(!decode.is_transport());
        assert!(!decode.is_permanent());
        assert!(missing.is_permanent());
        assert!(!unavailable.is_permanent());
    }

    #[test]
    fn test_display_mentions_context() {
        let err = SyncError::io(
            "/tmp/cache/art/a.png",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("art/a.png"));
        assert!(msg.contains("denied"));
        assert!(std::error::Error::source(&err).is_some());

        let timeout = SyncError::Transport { url: "u".into(), message: "m".into(), timeout: true };
        assert!(timeout.to_string().contains("timed out"));
    }
}
