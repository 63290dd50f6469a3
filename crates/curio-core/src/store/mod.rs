// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage interfaces and backends for curio-core.
//!
//! All transactional interaction with the relational store goes through
//! the [`Store`] trait. Two backends exist: PostgreSQL for deployments
//! and a SQLite twin for embedded runs and tests.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::{Uuid, Version};

use crate::error::{EngineError, Result};

/// Artifact row from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArtifactRecord {
    /// Store-assigned numeric id, stable for the row's lifetime.
    pub id: i64,
    /// Client-facing external identifier (v4 UUID).
    pub uuid: Uuid,
    /// Owning factory name.
    pub factory: String,
    /// TTL in seconds; NULL means the artifact never expires.
    pub ttl: Option<i64>,
    /// When the artifact was last accessed.
    pub last_access: DateTime<Utc>,
    /// Opaque serialized payload.
    pub payload: Vec<u8>,
}

/// User row from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRecord {
    /// Store-assigned numeric id.
    pub id: i64,
    /// Client-facing external identifier.
    pub uuid: Uuid,
    /// Display name.
    pub display_name: String,
    /// Account name, unique per store.
    pub account_name: String,
    /// Opaque role payload.
    pub roles: Vec<u8>,
}

/// Collection row from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CollectionRecord {
    /// Store-assigned numeric id.
    pub id: i64,
    /// Client-facing external identifier.
    pub uuid: Uuid,
    /// Collection name.
    pub name: String,
    /// Numeric id of the owning user, if any.
    pub owner_id: Option<i64>,
    /// When the collection was created; TTL is measured from here.
    pub created_at: DateTime<Utc>,
    /// TTL in seconds; NULL means the collection never expires.
    pub ttl: Option<i64>,
    /// Opaque attribute payload.
    pub attributes: Vec<u8>,
}

/// Collection membership row joined with the member artifact's identity.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemberRecord {
    /// Numeric id of the collection.
    pub collection_id: i64,
    /// Numeric id of the member artifact.
    pub artifact_id: i64,
    /// Opaque per-membership attribute payload.
    pub attributes: Vec<u8>,
    /// External identifier of the member artifact.
    pub uuid: Uuid,
    /// Owning factory of the member artifact.
    pub factory: String,
}

/// Handle bundling what post-call persistence needs to find a row again.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    /// Store-assigned numeric id.
    pub id: i64,
    /// Client-facing external identifier.
    pub uuid: Uuid,
    /// Owning factory name, used to resolve the serializer.
    pub factory: String,
    /// TTL in seconds the row carries.
    pub ttl: Option<i64>,
}

/// A caller-supplied TTL request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Never expire.
    Infinite,
    /// Use the configured or factory default.
    Default,
    /// Expire this many seconds after last access (artifacts) or
    /// creation (collections).
    Seconds(i64),
}

impl Ttl {
    /// Parse the wire form: `INF`, `DEFAULT`, or a non-negative integer.
    pub fn parse(input: &str) -> Result<Self> {
        match input.trim() {
            "INF" => Ok(Self::Infinite),
            "DEFAULT" => Ok(Self::Default),
            other => {
                let seconds: i64 = other.parse().map_err(|_| EngineError::InvalidPayload {
                    reason: format!("TTL must be INF, DEFAULT, or a non-negative integer, got '{}'", other),
                })?;
                if seconds < 0 {
                    return Err(EngineError::InvalidPayload {
                        reason: format!("TTL must be non-negative, got {}", seconds),
                    });
                }
                Ok(Self::Seconds(seconds))
            }
        }
    }

    /// Resolve to a stored TTL column value against a default policy.
    pub fn resolve(self, default: Option<i64>) -> Option<i64> {
        match self {
            Self::Infinite => None,
            Self::Default => default,
            Self::Seconds(seconds) => Some(seconds),
        }
    }
}

/// Transaction policy for a unit of work against the store.
///
/// Replaces the subclass-and-override transaction wrapper of older
/// engines: each multi-statement store operation documents the policy it
/// runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPolicy {
    /// Plain reads; no explicit transaction boundary.
    Read,
    /// Writes that roll back as a whole if any statement fails.
    WriteRollbackOnError,
    /// Writes committed piecewise; earlier commits stand even if a later
    /// statement fails. Used by the collector's per-item deletion loop.
    WriteNoRollback,
}

/// Generate a fresh external identifier (random v4 UUID). Uniqueness
/// beyond the store's unique constraint is not checked here.
pub fn new_identifier() -> Uuid {
    Uuid::new_v4()
}

/// Syntactic v4 UUID check, used as a cheap pre-filter before every
/// store operation keyed by external id. Malformed client input
/// short-circuits to "not found" instead of reaching the store.
pub fn is_valid_identifier(id: &str) -> bool {
    match Uuid::parse_str(id) {
        Ok(parsed) => parsed.get_version() == Some(Version::Random),
        Err(_) => false,
    }
}

/// Whether a row with the given TTL and reference instant has expired.
pub fn is_expired(ttl: Option<i64>, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match ttl {
        None => false,
        Some(seconds) => since + chrono::Duration::seconds(seconds) <= now,
    }
}

/// Transactional CRUD against the relational store.
///
/// Every operation keyed by an external id validates the id first; all
/// writes commit explicitly; implementations fire the matching
/// [`StoreEvent`](crate::events::StoreEvent) after a successful commit,
/// never before.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Insert a new artifact row under a fresh identity and fire
    /// `ArtifactCreated`.
    async fn store_initially(
        &self,
        payload: &[u8],
        factory: &str,
        ttl: Option<i64>,
    ) -> Result<ArtifactHandle>;

    /// Upsert by external id: overwrite payload/ttl/factory if the row
    /// exists (fires `ArtifactStored`), insert otherwise (fires
    /// `ArtifactCreated`). Used by import.
    async fn store_or_replace(
        &self,
        uuid: Uuid,
        payload: &[u8],
        factory: &str,
        ttl: Option<i64>,
    ) -> Result<ArtifactHandle>;

    /// Look up an artifact by external id. Invalid identifiers and
    /// missing rows both yield `None`.
    async fn get_artifact(&self, id: &str) -> Result<Option<ArtifactRecord>>;

    /// Look up an artifact by numeric id.
    async fn get_artifact_by_id(&self, id: i64) -> Result<Option<ArtifactRecord>>;

    /// Update last-access only, leaving the payload untouched.
    async fn touch(&self, handle: &ArtifactHandle) -> Result<()>;

    /// Write back the payload (and bump last-access); fires
    /// `ArtifactStored`.
    async fn store(&self, handle: &ArtifactHandle, payload: &[u8]) -> Result<()>;

    /// Delete a single artifact row, committed immediately. Returns the
    /// deleted row's external id, or `None` if the row was already gone.
    /// Fires no event; callers decide between `ArtifactDeleted` and the
    /// collector's batched kill notification.
    async fn delete_artifact(&self, id: i64) -> Result<Option<Uuid>>;

    /// Mark an artifact eligible for expiry (TTL forced to zero).
    async fn outdate_artifact(&self, id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Insert a user row; fires `UserCreated`.
    async fn create_user(
        &self,
        display_name: &str,
        account_name: &str,
        roles: &[u8],
    ) -> Result<UserRecord>;

    /// Look up a user by external id.
    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>>;

    /// All users, in insertion order.
    async fn list_users(&self) -> Result<Vec<UserRecord>>;

    /// Delete a user and cascade in one unit of work: outdate the user's
    /// exclusively-owned artifacts, delete the user's collection items,
    /// delete the user's collections, delete the user row. Fires
    /// `UserDeleted`. Returns false if the user did not exist.
    async fn delete_user(&self, id: &str) -> Result<bool>;

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Insert a collection row; fires `CollectionCreated`. `owner` is a
    /// user external id.
    async fn create_collection(
        &self,
        name: &str,
        owner: Option<&str>,
        ttl: Option<i64>,
        attributes: &[u8],
    ) -> Result<CollectionRecord>;

    /// Look up a collection by external id.
    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>>;

    /// All collections, in insertion order.
    async fn list_collections(&self) -> Result<Vec<CollectionRecord>>;

    /// Delete a collection in one unit of work: outdate artifacts
    /// exclusive to it, delete its items, delete the row. Fires
    /// `CollectionDeleted`. Returns false if the collection did not
    /// exist.
    async fn delete_collection(&self, id: &str) -> Result<bool>;

    /// Update a collection's TTL; fires `AttributesChanged`.
    async fn set_collection_ttl(&self, id: &str, ttl: Option<i64>) -> Result<bool>;

    /// Rename a collection; fires `AttributesChanged`.
    async fn set_collection_name(&self, id: &str, name: &str) -> Result<bool>;

    /// Read collection-level attributes.
    async fn get_collection_attributes(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Write collection-level attributes; fires `AttributesChanged`.
    async fn set_collection_attributes(&self, id: &str, attributes: &[u8]) -> Result<bool>;

    /// Add an artifact to a collection. Membership is a set: returns
    /// false (and fires nothing) if the artifact is already a member.
    /// Fires `MemberAdded` on success.
    async fn add_collection_artifact(
        &self,
        collection: &str,
        artifact: &str,
        attributes: &[u8],
    ) -> Result<bool>;

    /// Remove an artifact from a collection, outdating the artifact if
    /// it now belongs to no collection. Fires `MemberRemoved`. Returns
    /// false if it was not a member.
    async fn remove_collection_artifact(&self, collection: &str, artifact: &str) -> Result<bool>;

    /// Members of a collection with their artifact identities.
    async fn list_collection_artifacts(&self, collection: &str) -> Result<Vec<MemberRecord>>;

    /// Read per-membership attributes.
    async fn get_item_attributes(
        &self,
        collection: &str,
        artifact: &str,
    ) -> Result<Option<Vec<u8>>>;

    /// Write per-membership attributes; fires `AttributesChanged`.
    async fn set_item_attributes(
        &self,
        collection: &str,
        artifact: &str,
        attributes: &[u8],
    ) -> Result<bool>;

    // ------------------------------------------------------------------
    // Collector support
    // ------------------------------------------------------------------

    /// Delete all expired, unlocked collections (items first, then rows)
    /// as one unit of work and return their external ids.
    async fn collect_expired_collections(
        &self,
        now: DateTime<Utc>,
        locked: &[i64],
    ) -> Result<Vec<Uuid>>;

    /// Fetch a bounded batch of expired artifacts that are neither
    /// locked nor referenced by any collection item.
    async fn expired_artifacts(
        &self,
        now: DateTime<Utc>,
        locked: &[i64],
        limit: i64,
    ) -> Result<Vec<ArtifactRecord>>;

    /// Numeric ids of artifacts currently referenced by any collection
    /// item.
    async fn referenced_artifact_ids(&self) -> Result<Vec<i64>>;

    /// Cheap connectivity probe.
    async fn health_check(&self) -> Result<bool>;
}
