// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background collector for TTL-expired collections and artifacts.
//!
//! Each cleaning pass:
//! 1. Snapshots the locked-id set.
//! 2. Deletes expired, unlocked collections (items first, then rows) as
//!    one unit of work.
//! 3. Walks expired, unlocked, unreferenced artifacts in bounded
//!    batches; each row's delete commits on its own before the revived
//!    object's end-of-life hook runs, so a crash never re-processes a
//!    deleted row and never leaves a half-committed batch. Hook errors
//!    are logged and skipped.
//! 4. Notifies listeners once per pass with the killed collection and
//!    artifact ids.
//!
//! Between passes the collector sleeps for the configured interval or
//! until woken early. `Notify` holds a single permit, so wake signals do
//! not queue up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{Factory as _, Serializer as _};
use crate::background::LockedIds;
use crate::error::Result;
use crate::events::{Listeners, StoreEvent};
use crate::registry::FactoryRegistry;
use crate::store::Store;

/// Configuration for the lifecycle collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Sleep between passes. Clamped to at least one second.
    pub interval: Duration,
    /// Maximum expired artifacts per fetch; bounds worst-case work if
    /// many artifacts expire between passes.
    pub batch_size: i64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 100,
        }
    }
}

/// What one cleaning pass reclaimed.
#[derive(Debug, Clone, Default)]
pub struct CleanReport {
    /// External ids of reclaimed collections.
    pub collections_killed: Vec<Uuid>,
    /// External ids of reclaimed artifacts.
    pub artifacts_killed: Vec<Uuid>,
}

/// Background worker that reclaims expired collections and artifacts.
pub struct Collector {
    store: Arc<dyn Store>,
    factories: Arc<FactoryRegistry>,
    locked: Arc<LockedIds>,
    listeners: Listeners,
    config: CollectorConfig,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl Collector {
    /// Create a new collector.
    pub fn new(
        store: Arc<dyn Store>,
        factories: Arc<FactoryRegistry>,
        locked: Arc<LockedIds>,
        listeners: Listeners,
        config: CollectorConfig,
    ) -> Self {
        let config = CollectorConfig {
            interval: config.interval.max(Duration::from_secs(1)),
            ..config
        };
        Self {
            store,
            factories,
            locked,
            listeners,
            config,
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Handle used by request paths to cut the current sleep short.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Handle used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the collector loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Lifecycle collector started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Lifecycle collector received shutdown signal");
                    break;
                }

                _ = self.wake.notified() => {
                    debug!("Lifecycle collector woken early");
                    if let Err(e) = self.clean().await {
                        error!(error = %e, "Cleaning pass failed");
                    }
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.clean().await {
                        error!(error = %e, "Cleaning pass failed");
                    }
                }
            }
        }

        info!("Lifecycle collector stopped");
    }

    /// Run one cleaning pass. Exposed so tests and maintenance tooling
    /// can drive passes without the loop.
    pub async fn clean(&self) -> Result<CleanReport> {
        let now = Utc::now();
        let locked = self.locked.snapshot();

        // Phase 1: collections, as one unit of work. Their items go
        // first, which exposes member artifacts to artifact-level expiry
        // in phase 2.
        let collections_killed = self
            .store
            .collect_expired_collections(now, &locked)
            .await?;

        if !collections_killed.is_empty() {
            debug!(
                count = collections_killed.len(),
                "Reclaimed expired collections"
            );
        }

        // Phase 2: artifacts, in bounded batches. Candidate order within
        // a batch is unspecified.
        let mut artifacts_killed = Vec::new();
        loop {
            let batch = self
                .store
                .expired_artifacts(now, &locked, self.config.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            for record in batch {
                // Revive first so the end-of-life hook can run after the
                // delete commits.
                let revived = match self.factories.get(&record.factory) {
                    Ok(factory) => match factory.serializer().from_bytes(&record.payload) {
                        Ok(live) => Some(live),
                        Err(e) => {
                            warn!(
                                uuid = %record.uuid,
                                factory = %record.factory,
                                error = %e,
                                "Failed to revive expired artifact"
                            );
                            None
                        }
                    },
                    Err(_) => {
                        warn!(
                            uuid = %record.uuid,
                            factory = %record.factory,
                            "No factory registered for expired artifact"
                        );
                        None
                    }
                };

                // Single-statement delete, committed immediately.
                if self.store.delete_artifact(record.id).await?.is_none() {
                    // The row disappeared between fetch and delete.
                    continue;
                }

                if let Some(mut live) = revived
                    && let Err(e) = live.on_expire()
                {
                    warn!(
                        uuid = %record.uuid,
                        error = %e,
                        "End-of-life hook failed, artifact deleted anyway"
                    );
                }

                artifacts_killed.push(record.uuid);
            }
        }

        if !artifacts_killed.is_empty() {
            debug!(count = artifacts_killed.len(), "Reclaimed expired artifacts");
        }

        // Batched notifications, one call per kind per pass.
        if !collections_killed.is_empty() {
            self.listeners.emit(&StoreEvent::CollectionsKilled {
                uuids: collections_killed.clone(),
            });
        }
        if !artifacts_killed.is_empty() {
            self.listeners.emit(&StoreEvent::ArtifactsKilled {
                uuids: artifacts_killed.clone(),
            });
        }

        Ok(CleanReport {
            collections_killed,
            artifacts_killed,
        })
    }
}
