// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for curio-core integration tests.
//!
//! Builds an engine over an in-memory SQLite store with the testkit
//! note factory, echo service, and a recording listener.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};

use curio_core::engine::{Engine, EngineOptions};
use curio_core::events::Listeners;
use curio_core::registry::{FactoryRegistry, ServiceRegistry};
use curio_core::store::{ArtifactHandle, SqliteStore, Store};
use curio_testkit::{EchoService, NoteFactory, RecordingListener};

/// Everything a test needs: the engine plus direct handles on its parts.
pub struct TestHarness {
    pub engine: Engine,
    pub store: Arc<SqliteStore>,
    pub factory: Arc<NoteFactory>,
    pub recorder: Arc<RecordingListener>,
    pub listeners: Listeners,
}

/// Build a harness with no default TTL on the note factory.
pub async fn harness() -> TestHarness {
    harness_with_ttl(None).await
}

/// Build a harness whose note factory defaults to the given TTL.
pub async fn harness_with_ttl(default_ttl: Option<i64>) -> TestHarness {
    let listeners = Listeners::new();
    let recorder = Arc::new(RecordingListener::new());
    listeners.register(recorder.clone());

    let store = Arc::new(
        SqliteStore::in_memory(listeners.clone())
            .await
            .expect("failed to open in-memory store"),
    );

    let factory = Arc::new(NoteFactory::new(default_ttl));
    let mut factories = FactoryRegistry::new();
    factories.register(factory.clone());

    let mut services = ServiceRegistry::new();
    services.register(Arc::new(EchoService));

    let dyn_store: Arc<dyn Store> = store.clone();
    let engine = Engine::new(
        dyn_store,
        Arc::new(factories),
        Arc::new(services),
        listeners.clone(),
        EngineOptions::default(),
    );

    TestHarness {
        engine,
        store,
        factory,
        recorder,
        listeners,
    }
}

impl TestHarness {
    /// Force an artifact's last access into the past.
    pub async fn backdate_artifact(&self, id: i64, seconds: i64) {
        let past = Utc::now() - Duration::seconds(seconds);
        sqlx::query("UPDATE artifacts SET last_access = ? WHERE id = ?")
            .bind(past)
            .bind(id)
            .execute(self.store.pool())
            .await
            .expect("failed to backdate artifact");
    }

    /// Force a collection's creation time into the past.
    pub async fn backdate_collection(&self, id: i64, seconds: i64) {
        let past = Utc::now() - Duration::seconds(seconds);
        sqlx::query("UPDATE collections SET created_at = ? WHERE id = ?")
            .bind(past)
            .bind(id)
            .execute(self.store.pool())
            .await
            .expect("failed to backdate collection");
    }

    /// Total artifact rows.
    pub async fn artifact_count(&self) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM artifacts")
            .fetch_one(self.store.pool())
            .await
            .expect("failed to count artifacts");
        row.0
    }

    /// Total collection rows.
    pub async fn collection_count(&self) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM collections")
            .fetch_one(self.store.pool())
            .await
            .expect("failed to count collections");
        row.0
    }

    /// Total membership rows.
    pub async fn item_count(&self) -> i64 {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM collection_items")
            .fetch_one(self.store.pool())
            .await
            .expect("failed to count collection items");
        row.0
    }

    /// The stored TTL column for an artifact.
    pub async fn artifact_ttl(&self, id: i64) -> Option<i64> {
        let row: (Option<i64>,) = sqlx::query_as("SELECT ttl FROM artifacts WHERE id = ?")
            .bind(id)
            .fetch_one(self.store.pool())
            .await
            .expect("failed to read artifact ttl");
        row.0
    }

    /// Rebuild a handle and live object from the stored row.
    pub async fn reload(
        &self,
        uuid: &str,
    ) -> (ArtifactHandle, Box<dyn curio_core::artifact::Artifact>) {
        use curio_core::artifact::{Factory as _, Serializer as _};

        let record = self
            .store
            .get_artifact(uuid)
            .await
            .expect("lookup failed")
            .expect("artifact missing");
        let live = self
            .factory
            .serializer()
            .from_bytes(&record.payload)
            .expect("revive failed");
        let handle = ArtifactHandle {
            id: record.id,
            uuid: record.uuid,
            factory: record.factory,
            ttl: record.ttl,
        };
        (handle, live)
    }
}
