// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store implementation.
//!
//! Provides all durable storage access for artifacts, users, collections,
//! and collection items. Multi-statement operations run in a single
//! transaction ([`TxPolicy::WriteRollbackOnError`](super::TxPolicy));
//! single-statement deletes used by the collector commit immediately
//! ([`TxPolicy::WriteNoRollback`](super::TxPolicy)).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::{Listeners, StoreEvent};

use super::{
    ArtifactHandle, ArtifactRecord, CollectionRecord, MemberRecord, Store, UserRecord,
    is_valid_identifier, new_identifier,
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    listeners: Listeners,
}

impl PostgresStore {
    /// Create a new Postgres-backed store over an existing pool.
    pub fn new(pool: PgPool, listeners: Listeners) -> Self {
        Self { pool, listeners }
    }

    /// The underlying pool, exposed for maintenance tooling and tests.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn parse_id(id: &str) -> Option<Uuid> {
        if is_valid_identifier(id) {
            Uuid::parse_str(id).ok()
        } else {
            None
        }
    }
}

// ============================================================================
// Artifact Operations
// ============================================================================

/// Insert a new artifact row, returning its numeric id.
pub async fn insert_artifact(
    pool: &PgPool,
    uuid: Uuid,
    factory: &str,
    ttl: Option<i64>,
    payload: &[u8],
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO artifacts (uuid, factory, ttl, last_access, payload)
        VALUES ($1, $2, $3, NOW(), $4)
        RETURNING id
        "#,
    )
    .bind(uuid)
    .bind(factory)
    .bind(ttl)
    .bind(payload)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Get an artifact by external id.
pub async fn get_artifact_by_uuid(
    pool: &PgPool,
    uuid: Uuid,
) -> Result<Option<ArtifactRecord>> {
    let record = sqlx::query_as::<_, ArtifactRecord>(
        r#"
        SELECT id, uuid, factory, ttl, last_access, payload
        FROM artifacts
        WHERE uuid = $1
        "#,
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get an artifact by numeric id.
pub async fn get_artifact_by_id(pool: &PgPool, id: i64) -> Result<Option<ArtifactRecord>> {
    let record = sqlx::query_as::<_, ArtifactRecord>(
        r#"
        SELECT id, uuid, factory, ttl, last_access, payload
        FROM artifacts
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Update last-access only.
pub async fn touch_artifact(pool: &PgPool, id: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE artifacts
        SET last_access = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Write back an artifact payload and bump last-access.
pub async fn update_artifact_payload(pool: &PgPool, id: i64, payload: &[u8]) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE artifacts
        SET payload = $2, last_access = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(payload)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Delete one artifact row, committed immediately.
pub async fn delete_artifact_row(pool: &PgPool, id: i64) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        DELETE FROM artifacts
        WHERE id = $1
        RETURNING uuid
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.0))
}

/// Force an artifact's TTL to zero so the next collector pass picks it up.
pub async fn outdate_artifact_row(pool: &PgPool, id: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE artifacts
        SET ttl = 0
        WHERE id = $1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Collection Item Helpers
// ============================================================================

async fn collection_id_by_uuid(pool: &PgPool, uuid: Uuid) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM collections WHERE uuid = $1")
        .bind(uuid)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0))
}

async fn artifact_id_by_uuid(pool: &PgPool, uuid: Uuid) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM artifacts WHERE uuid = $1")
        .bind(uuid)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0))
}

async fn user_by_uuid(pool: &PgPool, uuid: Uuid) -> Result<Option<UserRecord>> {
    let record = sqlx::query_as::<_, UserRecord>(
        r#"
        SELECT id, uuid, display_name, account_name, roles
        FROM users
        WHERE uuid = $1
        "#,
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await?;
    Ok(record)
}

#[async_trait]
impl Store for PostgresStore {
    async fn store_initially(
        &self,
        payload: &[u8],
        factory: &str,
        ttl: Option<i64>,
    ) -> Result<ArtifactHandle> {
        let uuid = new_identifier();
        let id = insert_artifact(&self.pool, uuid, factory, ttl, payload).await?;

        self.listeners.emit(&StoreEvent::ArtifactCreated {
            uuid,
            factory: factory.to_string(),
        });

        Ok(ArtifactHandle {
            id,
            uuid,
            factory: factory.to_string(),
            ttl,
        })
    }

    async fn store_or_replace(
        &self,
        uuid: Uuid,
        payload: &[u8],
        factory: &str,
        ttl: Option<i64>,
    ) -> Result<ArtifactHandle> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM artifacts WHERE uuid = $1")
                .bind(uuid)
                .fetch_optional(&mut *tx)
                .await?;

        let (id, created) = match existing {
            Some((id,)) => {
                sqlx::query(
                    r#"
                    UPDATE artifacts
                    SET factory = $2, ttl = $3, payload = $4, last_access = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(factory)
                .bind(ttl)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
                (id, false)
            }
            None => {
                let row: (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO artifacts (uuid, factory, ttl, last_access, payload)
                    VALUES ($1, $2, $3, NOW(), $4)
                    RETURNING id
                    "#,
                )
                .bind(uuid)
                .bind(factory)
                .bind(ttl)
                .bind(payload)
                .fetch_one(&mut *tx)
                .await?;
                (row.0, true)
            }
        };

        tx.commit().await?;

        if created {
            self.listeners.emit(&StoreEvent::ArtifactCreated {
                uuid,
                factory: factory.to_string(),
            });
        } else {
            self.listeners.emit(&StoreEvent::ArtifactStored { uuid });
        }

        Ok(ArtifactHandle {
            id,
            uuid,
            factory: factory.to_string(),
            ttl,
        })
    }

    async fn get_artifact(&self, id: &str) -> Result<Option<ArtifactRecord>> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(None);
        };
        get_artifact_by_uuid(&self.pool, uuid).await
    }

    async fn get_artifact_by_id(&self, id: i64) -> Result<Option<ArtifactRecord>> {
        get_artifact_by_id(&self.pool, id).await
    }

    async fn touch(&self, handle: &ArtifactHandle) -> Result<()> {
        if touch_artifact(&self.pool, handle.id).await? == 0 {
            return Err(EngineError::NoSuchArtifact {
                id: handle.uuid.to_string(),
            });
        }
        Ok(())
    }

    async fn store(&self, handle: &ArtifactHandle, payload: &[u8]) -> Result<()> {
        if update_artifact_payload(&self.pool, handle.id, payload).await? == 0 {
            return Err(EngineError::NoSuchArtifact {
                id: handle.uuid.to_string(),
            });
        }
        self.listeners
            .emit(&StoreEvent::ArtifactStored { uuid: handle.uuid });
        Ok(())
    }

    async fn delete_artifact(&self, id: i64) -> Result<Option<Uuid>> {
        delete_artifact_row(&self.pool, id).await
    }

    async fn outdate_artifact(&self, id: i64) -> Result<()> {
        outdate_artifact_row(&self.pool, id).await
    }

    async fn create_user(
        &self,
        display_name: &str,
        account_name: &str,
        roles: &[u8],
    ) -> Result<UserRecord> {
        if display_name.is_empty() {
            return Err(EngineError::MissingUsername);
        }
        if account_name.is_empty() {
            return Err(EngineError::MissingAccount);
        }

        let uuid = new_identifier();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO users (uuid, display_name, account_name, roles)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(display_name)
        .bind(account_name)
        .bind(roles)
        .fetch_one(&self.pool)
        .await?;

        self.listeners.emit(&StoreEvent::UserCreated { uuid });

        Ok(UserRecord {
            id: row.0,
            uuid,
            display_name: display_name.to_string(),
            account_name: account_name.to_string(),
            roles: roles.to_vec(),
        })
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(None);
        };
        user_by_uuid(&self.pool, uuid).await
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let records = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, uuid, display_name, account_name, roles
            FROM users
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete_user(&self, id: &str) -> Result<bool> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(false);
        };
        let Some(user) = user_by_uuid(&self.pool, uuid).await? else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;

        // Outdate artifacts referenced only through this user's collections.
        sqlx::query(
            r#"
            UPDATE artifacts
            SET ttl = 0
            WHERE id IN (
                SELECT ci.artifact_id
                FROM collection_items ci
                JOIN collections c ON c.id = ci.collection_id
                WHERE c.owner_id = $1
            )
            AND NOT EXISTS (
                SELECT 1
                FROM collection_items ci2
                JOIN collections c2 ON c2.id = ci2.collection_id
                WHERE ci2.artifact_id = artifacts.id
                  AND (c2.owner_id IS NULL OR c2.owner_id <> $1)
            )
            "#,
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM collection_items
            WHERE collection_id IN (SELECT id FROM collections WHERE owner_id = $1)
            "#,
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM collections WHERE owner_id = $1")
            .bind(user.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(user.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.listeners.emit(&StoreEvent::UserDeleted { uuid });
        Ok(true)
    }

    async fn create_collection(
        &self,
        name: &str,
        owner: Option<&str>,
        ttl: Option<i64>,
        attributes: &[u8],
    ) -> Result<CollectionRecord> {
        let owner_id = match owner {
            None => None,
            Some(owner) => {
                let Some(uuid) = Self::parse_id(owner) else {
                    return Err(EngineError::NoSuchUser {
                        id: owner.to_string(),
                    });
                };
                match user_by_uuid(&self.pool, uuid).await? {
                    Some(user) => Some(user.id),
                    None => {
                        return Err(EngineError::NoSuchUser {
                            id: owner.to_string(),
                        });
                    }
                }
            }
        };

        let uuid = new_identifier();
        let row: (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO collections (uuid, name, owner_id, created_at, ttl, attributes)
            VALUES ($1, $2, $3, NOW(), $4, $5)
            RETURNING id, created_at
            "#,
        )
        .bind(uuid)
        .bind(name)
        .bind(owner_id)
        .bind(ttl)
        .bind(attributes)
        .fetch_one(&self.pool)
        .await?;

        self.listeners.emit(&StoreEvent::CollectionCreated {
            uuid,
            name: name.to_string(),
        });

        Ok(CollectionRecord {
            id: row.0,
            uuid,
            name: name.to_string(),
            owner_id,
            created_at: row.1,
            ttl,
            attributes: attributes.to_vec(),
        })
    }

    async fn get_collection(&self, id: &str) -> Result<Option<CollectionRecord>> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(None);
        };
        let record = sqlx::query_as::<_, CollectionRecord>(
            r#"
            SELECT id, uuid, name, owner_id, created_at, ttl, attributes
            FROM collections
            WHERE uuid = $1
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_collections(&self) -> Result<Vec<CollectionRecord>> {
        let records = sqlx::query_as::<_, CollectionRecord>(
            r#"
            SELECT id, uuid, name, owner_id, created_at, ttl, attributes
            FROM collections
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete_collection(&self, id: &str) -> Result<bool> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(false);
        };
        let Some(collection_id) = collection_id_by_uuid(&self.pool, uuid).await? else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;

        // Items first, in the same unit of work, so no artifact is seen
        // as unreferenced before the collection row itself is gone.
        sqlx::query(
            r#"
            UPDATE artifacts
            SET ttl = 0
            WHERE id IN (
                SELECT artifact_id FROM collection_items WHERE collection_id = $1
            )
            AND NOT EXISTS (
                SELECT 1 FROM collection_items ci
                WHERE ci.artifact_id = artifacts.id AND ci.collection_id <> $1
            )
            "#,
        )
        .bind(collection_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM collection_items WHERE collection_id = $1")
            .bind(collection_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM collections WHERE id = $1")
            .bind(collection_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.listeners.emit(&StoreEvent::CollectionDeleted { uuid });
        Ok(true)
    }

    async fn set_collection_ttl(&self, id: &str, ttl: Option<i64>) -> Result<bool> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(false);
        };
        let result = sqlx::query("UPDATE collections SET ttl = $2 WHERE uuid = $1")
            .bind(uuid)
            .bind(ttl)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.listeners.emit(&StoreEvent::AttributesChanged {
            collection: uuid,
            artifact: None,
        });
        Ok(true)
    }

    async fn set_collection_name(&self, id: &str, name: &str) -> Result<bool> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(false);
        };
        let result = sqlx::query("UPDATE collections SET name = $2 WHERE uuid = $1")
            .bind(uuid)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.listeners.emit(&StoreEvent::AttributesChanged {
            collection: uuid,
            artifact: None,
        });
        Ok(true)
    }

    async fn get_collection_attributes(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(None);
        };
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT attributes FROM collections WHERE uuid = $1")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set_collection_attributes(&self, id: &str, attributes: &[u8]) -> Result<bool> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(false);
        };
        let result = sqlx::query("UPDATE collections SET attributes = $2 WHERE uuid = $1")
            .bind(uuid)
            .bind(attributes)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        self.listeners.emit(&StoreEvent::AttributesChanged {
            collection: uuid,
            artifact: None,
        });
        Ok(true)
    }

    async fn add_collection_artifact(
        &self,
        collection: &str,
        artifact: &str,
        attributes: &[u8],
    ) -> Result<bool> {
        let Some(collection_uuid) = Self::parse_id(collection) else {
            return Err(EngineError::NoSuchCollection {
                id: collection.to_string(),
            });
        };
        let Some(artifact_uuid) = Self::parse_id(artifact) else {
            return Err(EngineError::NoSuchArtifact {
                id: artifact.to_string(),
            });
        };

        let Some(collection_id) = collection_id_by_uuid(&self.pool, collection_uuid).await?
        else {
            return Err(EngineError::NoSuchCollection {
                id: collection.to_string(),
            });
        };
        let Some(artifact_id) = artifact_id_by_uuid(&self.pool, artifact_uuid).await? else {
            return Err(EngineError::NoSuchArtifact {
                id: artifact.to_string(),
            });
        };

        let result = sqlx::query(
            r#"
            INSERT INTO collection_items (collection_id, artifact_id, attributes)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection_id, artifact_id) DO NOTHING
            "#,
        )
        .bind(collection_id)
        .bind(artifact_id)
        .bind(attributes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Already a member: membership is a set, not a multiset.
            return Ok(false);
        }

        self.listeners.emit(&StoreEvent::MemberAdded {
            collection: collection_uuid,
            artifact: artifact_uuid,
        });
        Ok(true)
    }

    async fn remove_collection_artifact(&self, collection: &str, artifact: &str) -> Result<bool> {
        let (Some(collection_uuid), Some(artifact_uuid)) =
            (Self::parse_id(collection), Self::parse_id(artifact))
        else {
            return Ok(false);
        };

        let Some(collection_id) = collection_id_by_uuid(&self.pool, collection_uuid).await?
        else {
            return Ok(false);
        };
        let Some(artifact_id) = artifact_id_by_uuid(&self.pool, artifact_uuid).await? else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "DELETE FROM collection_items WHERE collection_id = $1 AND artifact_id = $2",
        )
        .bind(collection_id)
        .bind(artifact_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        // Only the last membership exposes the artifact to expiry.
        sqlx::query(
            r#"
            UPDATE artifacts
            SET ttl = 0
            WHERE id = $1
              AND NOT EXISTS (SELECT 1 FROM collection_items WHERE artifact_id = $1)
            "#,
        )
        .bind(artifact_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.listeners.emit(&StoreEvent::MemberRemoved {
            collection: collection_uuid,
            artifact: artifact_uuid,
        });
        Ok(true)
    }

    async fn list_collection_artifacts(&self, collection: &str) -> Result<Vec<MemberRecord>> {
        let Some(uuid) = Self::parse_id(collection) else {
            return Ok(Vec::new());
        };
        let Some(collection_id) = collection_id_by_uuid(&self.pool, uuid).await? else {
            return Ok(Vec::new());
        };

        let records = sqlx::query_as::<_, MemberRecord>(
            r#"
            SELECT ci.collection_id, ci.artifact_id, ci.attributes, a.uuid, a.factory
            FROM collection_items ci
            JOIN artifacts a ON a.id = ci.artifact_id
            WHERE ci.collection_id = $1
            ORDER BY ci.artifact_id
            "#,
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_item_attributes(
        &self,
        collection: &str,
        artifact: &str,
    ) -> Result<Option<Vec<u8>>> {
        let (Some(collection_uuid), Some(artifact_uuid)) =
            (Self::parse_id(collection), Self::parse_id(artifact))
        else {
            return Ok(None);
        };

        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            r#"
            SELECT ci.attributes
            FROM collection_items ci
            JOIN collections c ON c.id = ci.collection_id
            JOIN artifacts a ON a.id = ci.artifact_id
            WHERE c.uuid = $1 AND a.uuid = $2
            "#,
        )
        .bind(collection_uuid)
        .bind(artifact_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set_item_attributes(
        &self,
        collection: &str,
        artifact: &str,
        attributes: &[u8],
    ) -> Result<bool> {
        let (Some(collection_uuid), Some(artifact_uuid)) =
            (Self::parse_id(collection), Self::parse_id(artifact))
        else {
            return Ok(false);
        };

        let result = sqlx::query(
            r#"
            UPDATE collection_items ci
            SET attributes = $3
            FROM collections c, artifacts a
            WHERE c.id = ci.collection_id
              AND a.id = ci.artifact_id
              AND c.uuid = $1
              AND a.uuid = $2
            "#,
        )
        .bind(collection_uuid)
        .bind(artifact_uuid)
        .bind(attributes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.listeners.emit(&StoreEvent::AttributesChanged {
            collection: collection_uuid,
            artifact: Some(artifact_uuid),
        });
        Ok(true)
    }

    async fn collect_expired_collections(
        &self,
        now: DateTime<Utc>,
        locked: &[i64],
    ) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(i64, Uuid)> = sqlx::query_as(
            r#"
            SELECT id, uuid
            FROM collections
            WHERE ttl IS NOT NULL
              AND created_at + ttl * INTERVAL '1 second' <= $1
              AND NOT (id = ANY($2))
            "#,
        )
        .bind(now)
        .bind(locked)
        .fetch_all(&mut *tx)
        .await?;

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = expired.iter().map(|(id, _)| *id).collect();

        sqlx::query("DELETE FROM collection_items WHERE collection_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM collections WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(expired.into_iter().map(|(_, uuid)| uuid).collect())
    }

    async fn expired_artifacts(
        &self,
        now: DateTime<Utc>,
        locked: &[i64],
        limit: i64,
    ) -> Result<Vec<ArtifactRecord>> {
        let records = sqlx::query_as::<_, ArtifactRecord>(
            r#"
            SELECT id, uuid, factory, ttl, last_access, payload
            FROM artifacts
            WHERE ttl IS NOT NULL
              AND last_access + ttl * INTERVAL '1 second' <= $1
              AND NOT (id = ANY($2))
              AND NOT EXISTS (
                  SELECT 1 FROM collection_items ci WHERE ci.artifact_id = artifacts.id
              )
            ORDER BY last_access
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(locked)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn referenced_artifact_ids(&self) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT DISTINCT artifact_id FROM collection_items")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn health_check(&self) -> Result<bool> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
