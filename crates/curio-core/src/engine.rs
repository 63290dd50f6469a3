// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine facade: explicitly constructed, dependency-injected, with
//! `open`/`close` owned by the process entry point.
//!
//! Request paths call the four artifact verbs (`describe`, `feed`,
//! `advance`, `out`) plus `export`/`import` and the collection and user
//! verbs. Every artifact verb opens one [`CallContext`], runs the
//! business operation, and finalizes exactly once through the post-call
//! step; if the operation itself fails, no persistence occurs and the
//! error propagates.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifact::{Artifact, Factory as _, Outcome, Serializer as _};
use crate::background::{BackgroundLog, LockedIds};
use crate::collector::{Collector, CollectorConfig};
use crate::config::Config;
use crate::context::{CallContext, CallTarget, PostCallAction};
use crate::error::{EngineError, Result};
use crate::events::{Listeners, StoreEvent};
use crate::registry::{FactoryRegistry, ServiceRegistry};
use crate::store::{
    ArtifactHandle, CollectionRecord, MemberRecord, Store, Ttl, UserRecord, is_expired,
    new_identifier,
};
use crate::transfer::{self, DigestAlgorithm, TransferDocument};

/// Bound on live objects kept across a warm-start scan.
const REVIVE_CACHE_CAPACITY: usize = 64;

/// Engine knobs independent of the database connection.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Digest algorithm for transfer checksums.
    pub digest_algorithm: DigestAlgorithm,
    /// Shared secret mixed into transfer checksums.
    pub transfer_secret: String,
    /// TTL applied when a caller asks for `DEFAULT` on a collection.
    pub default_ttl: Option<i64>,
    /// Collector schedule.
    pub collector: CollectorConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            digest_algorithm: DigestAlgorithm::default(),
            transfer_secret: crate::config::INSECURE_DEFAULT_SECRET.to_string(),
            default_ttl: Some(86400),
            collector: CollectorConfig::default(),
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            digest_algorithm: config.digest_algorithm,
            transfer_secret: config.transfer_secret.clone(),
            default_ttl: config.default_ttl,
            collector: CollectorConfig {
                interval: config.cleanup_interval,
                batch_size: config.cleanup_batch_size,
            },
        }
    }
}

/// The persistence-and-lifecycle engine.
pub struct Engine {
    store: Arc<dyn Store>,
    factories: Arc<FactoryRegistry>,
    services: Arc<ServiceRegistry>,
    locked: Arc<LockedIds>,
    background_log: Arc<BackgroundLog>,
    listeners: Listeners,
    options: EngineOptions,
    collector: Arc<Collector>,
    collector_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over an already-constructed store and registries.
    ///
    /// `listeners` must be the same list the store was built with, so
    /// storage events and lifecycle events reach the same receivers.
    pub fn new(
        store: Arc<dyn Store>,
        factories: Arc<FactoryRegistry>,
        services: Arc<ServiceRegistry>,
        listeners: Listeners,
        options: EngineOptions,
    ) -> Self {
        let locked = Arc::new(LockedIds::new());
        let collector = Arc::new(Collector::new(
            store.clone(),
            factories.clone(),
            locked.clone(),
            listeners.clone(),
            options.collector.clone(),
        ));

        Self {
            store,
            factories,
            services,
            locked,
            background_log: Arc::new(BackgroundLog::new()),
            listeners,
            options,
            collector,
            collector_task: Mutex::new(None),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The locked-id set shared with the collector.
    pub fn locked_ids(&self) -> &Arc<LockedIds> {
        &self.locked
    }

    /// The background message queues.
    pub fn background_log(&self) -> &BackgroundLog {
        &self.background_log
    }

    /// The collector, for driving passes directly in tests and tooling.
    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    /// The factory registry.
    pub fn factories(&self) -> &Arc<FactoryRegistry> {
        &self.factories
    }

    /// Register a listener for storage and lifecycle events.
    pub fn register_listener(&self, listener: Arc<dyn crate::events::StoreListener>) {
        self.listeners.register(listener);
    }

    /// Cut the collector's current sleep short.
    pub fn wake_collector(&self) {
        self.collector.wake_handle().notify_one();
    }

    /// Open the engine: probe the store, announce `SystemUp`, start the
    /// collector task.
    pub async fn open(&self) -> Result<()> {
        self.store.health_check().await?;
        self.listeners.emit(&StoreEvent::SystemUp);

        let collector = self.collector.clone();
        let task = tokio::spawn(async move { collector.run().await });
        *self
            .collector_task
            .lock()
            .expect("collector task slot poisoned") = Some(task);

        info!(factories = ?self.factories.names(), "Engine opened");
        Ok(())
    }

    /// Close the engine: stop the collector and announce `SystemDown`.
    pub async fn close(&self) {
        let task = self
            .collector_task
            .lock()
            .expect("collector task slot poisoned")
            .take();
        if let Some(task) = task {
            self.collector.shutdown_handle().notify_one();
            if let Err(e) = task.await {
                error!(error = %e, "Collector task failed");
            }
        }
        self.listeners.emit(&StoreEvent::SystemDown);
        info!("Engine closed");
    }

    // ------------------------------------------------------------------
    // Artifact verbs
    // ------------------------------------------------------------------

    /// Create a new artifact through a named factory and store it.
    pub async fn create(&self, factory: &str, params: Value, ttl: Ttl) -> Result<ArtifactHandle> {
        let factory_impl = self.factories.get(factory)?;
        let live = factory_impl
            .create(params)
            .map_err(|e| EngineError::CreationFailed {
                factory: factory.to_string(),
                reason: e.to_string(),
            })?;

        let ttl = ttl.resolve(factory_impl.default_ttl());
        let bytes = factory_impl.serializer().to_bytes(live.as_ref())?;
        let handle = self.store.store_initially(&bytes, factory, ttl).await?;

        // Pure construction: the initial store above is the only write.
        let ctx = CallContext::new(
            CallTarget::Artifact(handle.clone()),
            PostCallAction::Nothing,
        );
        self.post_call(ctx, Some(live.as_ref())).await?;

        Ok(handle)
    }

    /// Render a description of an artifact. Read-only introspection, so
    /// the default post-call action is `Touch`.
    pub async fn describe(&self, id: &str) -> Result<Value> {
        let (live, handle) = self.load_live(id).await?;
        let mut ctx = CallContext::new(CallTarget::Artifact(handle), PostCallAction::Touch);
        match live.describe(&mut ctx) {
            Ok(value) => {
                self.post_call(ctx, Some(live.as_ref())).await?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Feed input into an artifact. May mutate in-memory state, so the
    /// default post-call action is `Store`.
    pub async fn feed(&self, id: &str, input: Value) -> Result<()> {
        let (mut live, handle) = self.load_live(id).await?;
        let mut ctx = CallContext::new(CallTarget::Artifact(handle), PostCallAction::Store);
        match live.feed(&mut ctx, input) {
            Ok(Outcome::Continue) => self.post_call(ctx, Some(live.as_ref())).await,
            Ok(Outcome::Replace(next)) => {
                // The replacement becomes the call target; a Store action
                // persists it under the same handle.
                self.post_call(ctx, Some(next.as_ref())).await
            }
            Err(e) => Err(e),
        }
    }

    /// Advance an artifact one step.
    pub async fn advance(&self, id: &str) -> Result<()> {
        let (mut live, handle) = self.load_live(id).await?;
        let mut ctx = CallContext::new(CallTarget::Artifact(handle), PostCallAction::Store);
        match live.advance(&mut ctx) {
            Ok(Outcome::Continue) => self.post_call(ctx, Some(live.as_ref())).await,
            Ok(Outcome::Replace(next)) => self.post_call(ctx, Some(next.as_ref())).await,
            Err(e) => Err(e),
        }
    }

    /// Render an artifact to a byte sink.
    pub async fn out<W: Write + Send>(&self, id: &str, sink: &mut W) -> Result<()> {
        let (live, handle) = self.load_live(id).await?;
        let mut ctx = CallContext::new(CallTarget::Artifact(handle), PostCallAction::Touch);
        match live.out(&mut ctx, sink) {
            Ok(()) => self.post_call(ctx, Some(live.as_ref())).await,
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Backgrounding
    // ------------------------------------------------------------------

    /// Complete a backgrounded call with a final action.
    ///
    /// Only legal while the target's id is in the locked set; otherwise
    /// this is a protocol violation and no store mutation happens. On
    /// success the id is unlocked and the drained background messages
    /// are returned.
    pub async fn complete_background(
        &self,
        handle: &ArtifactHandle,
        final_action: PostCallAction,
        live: &dyn Artifact,
    ) -> Result<Vec<String>> {
        if final_action == PostCallAction::Background {
            let violation = EngineError::ProtocolViolation {
                message: "background completion requires a final action of NOTHING, TOUCH, or STORE"
                    .to_string(),
            };
            error!(uuid = %handle.uuid, "{}", violation);
            return Err(violation);
        }
        if !self.locked.contains(handle.id) {
            let violation = EngineError::ProtocolViolation {
                message: format!("artifact '{}' is not in background", handle.uuid),
            };
            error!(uuid = %handle.uuid, "{}", violation);
            return Err(violation);
        }

        match final_action {
            PostCallAction::Nothing => {}
            PostCallAction::Touch => self.store.touch(handle).await?,
            PostCallAction::Store => self.write_back(handle, live).await?,
            PostCallAction::Background => unreachable!("rejected above"),
        }

        self.locked.release(handle.id);
        Ok(self.background_log.take(handle.id))
    }

    /// Append a diagnostic message to a backgrounded target's queue.
    pub fn add_background_message(&self, id: i64, message: impl Into<String>) {
        self.background_log.push(id, message);
    }

    // ------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------

    /// Export an artifact as a signed transfer document.
    pub async fn export(&self, id: &str) -> Result<TransferDocument> {
        let (mut live, handle) = self.load_live(id).await?;
        // Strip transient resources before the payload leaves the engine.
        live.sanitize();
        let factory = self.factories.get(&handle.factory)?;
        let bytes = factory.serializer().to_bytes(live.as_ref())?;
        Ok(transfer::seal(
            &bytes,
            &handle.factory,
            self.options.digest_algorithm,
            &self.options.transfer_secret,
        ))
    }

    /// Import a signed transfer document under a fresh identity.
    ///
    /// No artifact row is created until the checksum verifies.
    pub async fn import(&self, document: &TransferDocument) -> Result<ArtifactHandle> {
        let factory = self.factories.get(&document.factory)?;
        let bytes = transfer::verify(
            document,
            self.options.digest_algorithm,
            &self.options.transfer_secret,
        )?;

        // Deserialization validates the payload; the verified bytes are
        // what gets stored.
        factory.serializer().from_bytes(&bytes)?;

        let uuid = new_identifier();
        self.store
            .store_or_replace(uuid, &bytes, &document.factory, factory.default_ttl())
            .await
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Create a collection. `owner` is a user external id.
    pub async fn create_collection(
        &self,
        name: &str,
        owner: Option<&str>,
        ttl: Ttl,
        attributes: &[u8],
    ) -> Result<CollectionRecord> {
        let ttl = ttl.resolve(self.options.default_ttl);
        self.store
            .create_collection(name, owner, ttl, attributes)
            .await
    }

    /// Look up a collection.
    pub async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>> {
        self.store.get_collection(id).await
    }

    /// All collections.
    pub async fn list_collections(&self) -> Result<Vec<CollectionRecord>> {
        self.store.list_collections().await
    }

    /// Render a description of a collection and its membership.
    pub async fn describe_collection(&self, id: &str) -> Result<Value> {
        let record = self
            .store
            .get_collection(id)
            .await?
            .ok_or_else(|| EngineError::NoSuchCollection { id: id.to_string() })?;
        let members = self.store.list_collection_artifacts(id).await?;

        Ok(json!({
            "id": record.uuid,
            "name": record.name,
            "created": record.created_at.to_rfc3339(),
            "ttl": record.ttl,
            "members": members
                .iter()
                .map(|m| json!({ "id": m.uuid, "factory": m.factory }))
                .collect::<Vec<_>>(),
        }))
    }

    /// Delete a collection (items first, then the row, one unit of work).
    pub async fn delete_collection(&self, id: &str) -> Result<()> {
        if !self.store.delete_collection(id).await? {
            return Err(EngineError::NoSuchCollection { id: id.to_string() });
        }
        Ok(())
    }

    /// Update a collection's TTL from its wire form.
    pub async fn set_collection_ttl(&self, id: &str, ttl: Ttl) -> Result<()> {
        let ttl = ttl.resolve(self.options.default_ttl);
        if !self.store.set_collection_ttl(id, ttl).await? {
            return Err(EngineError::NoSuchCollection { id: id.to_string() });
        }
        Ok(())
    }

    /// Rename a collection.
    pub async fn set_collection_name(&self, id: &str, name: &str) -> Result<()> {
        if !self.store.set_collection_name(id, name).await? {
            return Err(EngineError::NoSuchCollection { id: id.to_string() });
        }
        Ok(())
    }

    /// Read collection-level attributes.
    pub async fn collection_attributes(&self, id: &str) -> Result<Vec<u8>> {
        self.store
            .get_collection_attributes(id)
            .await?
            .ok_or_else(|| EngineError::NoSuchCollection { id: id.to_string() })
    }

    /// Write collection-level attributes.
    pub async fn set_collection_attributes(&self, id: &str, attributes: &[u8]) -> Result<()> {
        if !self.store.set_collection_attributes(id, attributes).await? {
            return Err(EngineError::NoSuchCollection { id: id.to_string() });
        }
        Ok(())
    }

    /// Add an artifact to a collection. False if already a member.
    pub async fn add_member(
        &self,
        collection: &str,
        artifact: &str,
        attributes: &[u8],
    ) -> Result<bool> {
        self.store
            .add_collection_artifact(collection, artifact, attributes)
            .await
    }

    /// Remove an artifact from a collection. False if it was not a
    /// member.
    pub async fn remove_member(&self, collection: &str, artifact: &str) -> Result<bool> {
        self.store
            .remove_collection_artifact(collection, artifact)
            .await
    }

    /// Members of a collection.
    pub async fn list_members(&self, collection: &str) -> Result<Vec<MemberRecord>> {
        self.store.list_collection_artifacts(collection).await
    }

    /// Read per-membership attributes.
    pub async fn item_attributes(&self, collection: &str, artifact: &str) -> Result<Vec<u8>> {
        self.store
            .get_item_attributes(collection, artifact)
            .await?
            .ok_or_else(|| EngineError::NoSuchCollection {
                id: collection.to_string(),
            })
    }

    /// Write per-membership attributes.
    pub async fn set_item_attributes(
        &self,
        collection: &str,
        artifact: &str,
        attributes: &[u8],
    ) -> Result<()> {
        if !self
            .store
            .set_item_attributes(collection, artifact, attributes)
            .await?
        {
            return Err(EngineError::NoSuchCollection {
                id: collection.to_string(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Create a user.
    pub async fn create_user(
        &self,
        display_name: &str,
        account_name: &str,
        roles: &[u8],
    ) -> Result<UserRecord> {
        self.store
            .create_user(display_name, account_name, roles)
            .await
    }

    /// Look up a user.
    pub async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        self.store.get_user(id).await
    }

    /// All users.
    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.store.list_users().await
    }

    /// Delete a user, cascading over their collections and memberships.
    pub async fn delete_user(&self, id: &str) -> Result<()> {
        if !self.store.delete_user(id).await? {
            return Err(EngineError::NoSuchUser { id: id.to_string() });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Perform a named service call.
    pub fn service(&self, name: &str, input: Value) -> Result<Value> {
        let service = self.services.get(name)?;
        let mut ctx = CallContext::new(CallTarget::System, PostCallAction::Nothing);
        service.perform(&mut ctx, input)
    }

    // ------------------------------------------------------------------
    // Warm start
    // ------------------------------------------------------------------

    /// Bulk scan over collections and their member artifacts, reviving
    /// each artifact at most once per scan through a bounded recency
    /// cache. Returns the number of memberships visited.
    pub async fn load_all_artifacts<F>(&self, mut visit: F) -> Result<usize>
    where
        F: FnMut(&CollectionRecord, &MemberRecord, &Arc<dyn Artifact>),
    {
        let mut cache = RecencyCache::new(REVIVE_CACHE_CAPACITY);
        let mut visited = 0;

        for collection in self.store.list_collections().await? {
            let members = self
                .store
                .list_collection_artifacts(&collection.uuid.to_string())
                .await?;
            for member in members {
                let live = match cache.get(&member.uuid) {
                    Some(live) => live,
                    None => {
                        let Some(record) =
                            self.store.get_artifact_by_id(member.artifact_id).await?
                        else {
                            continue;
                        };
                        let Ok(factory) = self.factories.get(&record.factory) else {
                            warn!(
                                uuid = %record.uuid,
                                factory = %record.factory,
                                "Skipping artifact with unknown factory in warm start"
                            );
                            continue;
                        };
                        let live: Arc<dyn Artifact> =
                            match factory.serializer().from_bytes(&record.payload) {
                                Ok(boxed) => Arc::from(boxed),
                                Err(e) => {
                                    warn!(
                                        uuid = %record.uuid,
                                        error = %e,
                                        "Skipping unreadable artifact in warm start"
                                    );
                                    continue;
                                }
                            };
                        cache.put(member.uuid, live.clone());
                        live
                    }
                };
                visit(&collection, &member, &live);
                visited += 1;
            }
        }

        Ok(visited)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Load and revive an artifact. Invalid identifiers, missing rows,
    /// unknown factories, and unreadable payloads all collapse to
    /// `NO_SUCH_ARTIFACT`.
    async fn load_live(&self, id: &str) -> Result<(Box<dyn Artifact>, ArtifactHandle)> {
        let not_found = || EngineError::NoSuchArtifact { id: id.to_string() };

        let Some(record) = self.store.get_artifact(id).await? else {
            return Err(not_found());
        };

        if is_expired(record.ttl, record.last_access, Utc::now()) {
            // A request thread noticed an already-expired row; nudge the
            // collector rather than waiting out its sleep.
            debug!(uuid = %record.uuid, "Read hit an expired row, waking collector");
            self.wake_collector();
        }

        let Ok(factory) = self.factories.get(&record.factory) else {
            warn!(
                uuid = %record.uuid,
                factory = %record.factory,
                "Stored artifact references an unregistered factory"
            );
            return Err(not_found());
        };

        let live = match factory.serializer().from_bytes(&record.payload) {
            Ok(live) => live,
            Err(e) => {
                warn!(uuid = %record.uuid, error = %e, "Failed to revive artifact");
                return Err(not_found());
            }
        };

        let handle = ArtifactHandle {
            id: record.id,
            uuid: record.uuid,
            factory: record.factory,
            ttl: record.ttl,
        };
        Ok((live, handle))
    }

    async fn write_back(&self, handle: &ArtifactHandle, live: &dyn Artifact) -> Result<()> {
        let factory = self.factories.get(&handle.factory)?;
        let bytes = factory.serializer().to_bytes(live)?;
        self.store.store(handle, &bytes).await
    }

    /// Dispatch on the context's final action. Runs exactly once per
    /// context; the verbs above are its only callers.
    async fn post_call(&self, ctx: CallContext, live: Option<&dyn Artifact>) -> Result<()> {
        let action = ctx.action();
        match ctx.target() {
            CallTarget::Artifact(handle) => match action {
                PostCallAction::Nothing => Ok(()),
                PostCallAction::Touch => self.store.touch(handle).await,
                PostCallAction::Store => {
                    let live = live.ok_or_else(|| EngineError::ProtocolViolation {
                        message: "Store finalization without a live object".to_string(),
                    })?;
                    self.write_back(handle, live).await
                }
                PostCallAction::Background => {
                    let live = live.ok_or_else(|| EngineError::ProtocolViolation {
                        message: "Background finalization without a live object".to_string(),
                    })?;
                    // Lock before the write so the collector can never
                    // observe the row eligible but unprotected.
                    self.locked.lock_id(handle.id);
                    self.write_back(handle, live).await
                }
            },
            CallTarget::Collection { id, .. } => match action {
                PostCallAction::Nothing => Ok(()),
                // Collections age from creation time; nothing to bump.
                PostCallAction::Touch => Ok(()),
                PostCallAction::Background => {
                    self.locked.lock_id(*id);
                    Ok(())
                }
                PostCallAction::Store => {
                    let violation = EngineError::ProtocolViolation {
                        message: "Store is not a valid post-call action for a collection target"
                            .to_string(),
                    };
                    error!("{}", violation);
                    Err(violation)
                }
            },
            CallTarget::System => match action {
                PostCallAction::Nothing => Ok(()),
                other => {
                    let violation = EngineError::ProtocolViolation {
                        message: format!(
                            "{:?} is not a valid post-call action for a system target",
                            other
                        ),
                    };
                    error!("{}", violation);
                    Err(violation)
                }
            },
        }
    }
}

/// Small bounded recency cache keyed by artifact UUID, used by the
/// warm-start scan to avoid re-deserializing a payload that appears
/// under multiple membership rows.
struct RecencyCache {
    capacity: usize,
    entries: HashMap<Uuid, Arc<dyn Artifact>>,
    order: VecDeque<Uuid>,
}

impl RecencyCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &Uuid) -> Option<Arc<dyn Artifact>> {
        let value = self.entries.get(key)?.clone();
        self.bump(key);
        Some(value)
    }

    fn put(&mut self, key: Uuid, value: Arc<dyn Artifact>) {
        if !self.entries.contains_key(&key)
            && self.entries.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        if self.entries.insert(key, value).is_none() {
            self.order.push_back(key);
        } else {
            self.bump(&key);
        }
    }

    fn bump(&mut self, key: &Uuid) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
            self.order.push_back(*key);
        }
    }
}
