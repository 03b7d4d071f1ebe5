// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lifecycle notifications.
//!
//! Collaborators call [`EventBus::subscribe`] and keep the returned receiver
//! for as long as they want events. Dropping the receiver unsubscribes.
//! A subscriber that falls behind by more than the channel capacity gets
//! `RecvError::Lagged` and skips the oldest events.

use std::fmt;

use serde::Serialize;
use tokio::sync::broadcast;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Pipeline stage an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Download,
    Write,
    Load,
    Delete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Download => "download",
            Stage::Write => "cache-write",
            Stage::Load => "load",
            Stage::Delete => "delete",
        };
        f.write_str(label)
    }
}

/// Something happened to an asset or to the cache as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    /// The asset entered a stage's queue
    Queued { stage: Stage, path: String },
    /// A worker picked the asset up
    Started { stage: Stage, path: String },
    /// The stage completed for the asset
    Finished { stage: Stage, path: String },
    /// The stage failed and the asset goes back to the end of its queue
    Retrying { stage: Stage, path: String, attempt: u32, delay_ms: u64 },
    /// The stage gave up on the asset for this sync
    Failed { stage: Stage, path: String, attempts: u32, reason: String },
    /// The asset table is populated. Sent once per process.
    Ready,
    /// The sync stopped before the table could be populated
    SyncFailed { reason: String },
}

impl CacheEvent {
    /// Path the event refers to, if it is a per-asset event.
    pub fn path(&self) -> Option<&str> {
        match self {
            CacheEvent::Queued { path, .. }
            | CacheEvent::Started { path, .. }
            | CacheEvent::Finished { path, .. }
            | CacheEvent::Retrying { path, .. }
            | CacheEvent::Failed { path, .. } => Some(path),
            CacheEvent::Ready | CacheEvent::SyncFailed { .. } => None,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            CacheEvent::Queued { stage, .. }
            | CacheEvent::Started { stage, .. }
            | CacheEvent::Finished { stage, .. }
            | CacheEvent::Retrying { stage, .. }
            | CacheEvent::Failed { stage, .. } => Some(*stage),
            CacheEvent::Ready | CacheEvent::SyncFailed { .. } => None,
        }
    }
}

/// Fan-out of [`CacheEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    /// Send to every current subscriber. Events with no subscriber are dropped.
    pub fn emit(&self, event: CacheEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
