// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! The asset table is read by arbitrary collaborators while pipeline workers
//! write to it. A worker that panics mid-insert poisons the lock; every entry
//! in the table is an immutable `Arc`, so the data behind a poisoned lock is
//! still consistent and readers keep going.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "assetsync::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition; a pipeline task panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "assetsync::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition; a pipeline task panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}
