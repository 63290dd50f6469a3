// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener fan-out for storage and lifecycle events.
//!
//! Listeners are notified synchronously, in registration order, after the
//! corresponding unit of work has committed - never before, so a listener
//! can never observe uncommitted state. Listener panics are deliberately
//! not caught; a misbehaving listener aborts the caller's operation after
//! the store mutation has already committed.

use std::sync::{Arc, RwLock};

use uuid::Uuid;

/// A state change that committed successfully, or a process lifecycle
/// transition.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum StoreEvent {
    /// The engine opened.
    SystemUp,
    /// The engine is shutting down.
    SystemDown,
    /// A new artifact row was inserted.
    ArtifactCreated {
        /// External identifier of the artifact.
        uuid: Uuid,
        /// Owning factory name.
        factory: String,
    },
    /// An artifact payload was written back.
    ArtifactStored {
        /// External identifier of the artifact.
        uuid: Uuid,
    },
    /// An artifact row was deleted outside of collection.
    ArtifactDeleted {
        /// External identifier of the artifact.
        uuid: Uuid,
    },
    /// A user row was inserted.
    UserCreated {
        /// External identifier of the user.
        uuid: Uuid,
    },
    /// A user row was deleted (with its collections and memberships).
    UserDeleted {
        /// External identifier of the user.
        uuid: Uuid,
    },
    /// A collection row was inserted.
    CollectionCreated {
        /// External identifier of the collection.
        uuid: Uuid,
        /// Collection name.
        name: String,
    },
    /// A collection row was deleted explicitly (not by the collector).
    CollectionDeleted {
        /// External identifier of the collection.
        uuid: Uuid,
    },
    /// Collection-level or item-level attributes changed. `artifact` is
    /// set for item-level changes.
    AttributesChanged {
        /// The collection whose attributes (or item attributes) changed.
        collection: Uuid,
        /// The member artifact for item-level changes.
        artifact: Option<Uuid>,
    },
    /// An artifact joined a collection.
    MemberAdded {
        /// The collection.
        collection: Uuid,
        /// The artifact.
        artifact: Uuid,
    },
    /// An artifact left a collection.
    MemberRemoved {
        /// The collection.
        collection: Uuid,
        /// The artifact.
        artifact: Uuid,
    },
    /// One collector pass reclaimed these collections.
    CollectionsKilled {
        /// External identifiers, one entry per reclaimed collection.
        uuids: Vec<Uuid>,
    },
    /// One collector pass reclaimed these artifacts.
    ArtifactsKilled {
        /// External identifiers, one entry per reclaimed artifact.
        uuids: Vec<Uuid>,
    },
}

/// Receiver for [`StoreEvent`]s.
pub trait StoreListener: Send + Sync {
    /// Handle one committed event.
    fn on_event(&self, event: &StoreEvent);
}

/// Append-only listener list, shared between the storage backends, the
/// engine, and the collector.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<RwLock<Vec<Arc<dyn StoreListener>>>>,
}

impl Listeners {
    /// Create an empty listener list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener. Listeners cannot be removed.
    pub fn register(&self, listener: Arc<dyn StoreListener>) {
        self.inner
            .write()
            .expect("listener list lock poisoned")
            .push(listener);
    }

    /// Notify all listeners, in registration order.
    pub fn emit(&self, event: &StoreEvent) {
        // Snapshot so new registrations during iteration do not deadlock.
        let snapshot: Vec<Arc<dyn StoreListener>> = self
            .inner
            .read()
            .expect("listener list lock poisoned")
            .clone();
        for listener in snapshot {
            listener.on_event(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.read().expect("listener list lock poisoned").len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
