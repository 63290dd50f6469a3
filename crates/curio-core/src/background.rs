// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backgrounding state shared between request tasks and the collector.
//!
//! [`LockedIds`] is the process-wide set of numeric ids currently exempt
//! from collection because a call declared itself `Background`. The
//! collector snapshots it at the start of every pass. [`BackgroundLog`]
//! accumulates diagnostic messages for a backgrounded target and is
//! drained wholesale on background completion.
//!
//! Both locks are held briefly and never across store I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Process-wide set of numeric ids exempt from collection.
#[derive(Debug, Default)]
pub struct LockedIds {
    inner: Mutex<HashSet<i64>>,
}

impl LockedIds {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an id. Returns false if the id was already locked.
    pub fn lock_id(&self, id: i64) -> bool {
        self.inner.lock().expect("locked-id set poisoned").insert(id)
    }

    /// Remove an id. Returns false if the id was not locked.
    pub fn release(&self, id: i64) -> bool {
        self.inner.lock().expect("locked-id set poisoned").remove(&id)
    }

    /// Whether an id is currently locked.
    pub fn contains(&self, id: i64) -> bool {
        self.inner
            .lock()
            .expect("locked-id set poisoned")
            .contains(&id)
    }

    /// Copy of the current contents, taken by the collector at the start
    /// of each pass.
    pub fn snapshot(&self) -> Vec<i64> {
        self.inner
            .lock()
            .expect("locked-id set poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Number of locked ids.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("locked-id set poisoned").len()
    }

    /// Whether no ids are locked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-target ordered diagnostic messages accumulated while backgrounded.
#[derive(Debug, Default)]
pub struct BackgroundLog {
    inner: Mutex<HashMap<i64, Vec<String>>>,
}

impl BackgroundLog {
    /// Create an empty log map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message for a backgrounded target. The queue is created
    /// on first message.
    pub fn push(&self, id: i64, message: impl Into<String>) {
        self.inner
            .lock()
            .expect("background log poisoned")
            .entry(id)
            .or_default()
            .push(message.into());
    }

    /// Remove and return all messages for a target. Called on background
    /// completion.
    pub fn take(&self, id: i64) -> Vec<String> {
        self.inner
            .lock()
            .expect("background log poisoned")
            .remove(&id)
            .unwrap_or_default()
    }

    /// Copy of the messages for a target without draining them.
    pub fn peek(&self, id: i64) -> Vec<String> {
        self.inner
            .lock()
            .expect("background log poisoned")
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}
