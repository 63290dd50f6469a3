//! SQLite-backed store implementation.
//!
//! Mirrors the PostgreSQL backend for embedded runs and tests. Expiry
//! arithmetic uses `unixepoch()`; dynamic `IN` lists stand in for
//! Postgres `ANY` binds.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::{Listeners, StoreEvent};

use super::{
    ArtifactHandle, ArtifactRecord, CollectionRecord, MemberRecord, Store, UserRecord,
    is_valid_identifier, new_identifier,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    listeners: Listeners,
}

impl SqliteStore {
    /// Create a new SQLite store over an existing pool.
    pub fn new(pool: SqlitePool, listeners: Listeners) -> Self {
        Self { pool, listeners }
    }

    /// Create and migrate a store backed by a database file.
    ///
    /// Creates parent directories and the database file as needed.
    pub async fn from_path(path: impl AsRef<Path>, listeners: Listeners) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::StoreFailed {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| EngineError::StoreFailed {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate_and_wrap(pool, listeners).await
    }

    /// Create and migrate an in-memory store. A single pooled connection
    /// keeps the database alive for the store's lifetime.
    pub async fn in_memory(listeners: Listeners) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| EngineError::StoreFailed {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrate_and_wrap(pool, listeners).await
    }

    async fn migrate_and_wrap(pool: SqlitePool, listeners: Listeners) -> Result<Self> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| EngineError::StoreFailed {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;
        Ok(Self { pool, listeners })
    }

    /// The underlying pool, exposed for maintenance tooling and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_id(id: &str) -> Option<Uuid> {
        if is_valid_identifier(id) {
            Uuid::parse_str(id).ok()
        } else {
            None
        }
    }

    async fn collection_id_by_uuid(&self, uuid: Uuid) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM collections WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn artifact_id_by_uuid(&self, uuid: Uuid) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM artifacts WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    async fn user_by_uuid(&self, uuid: Uuid) -> Result<Option<UserRecord>> {
        let record = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, uuid, display_name, account_name, roles
            FROM users
            WHERE uuid = ?
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn store_initially(
        &self,
        payload: &[u8],
        factory: &str,
        ttl: Option<i64>,
    ) -> Result<ArtifactHandle> {
        let uuid = new_identifier();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO artifacts (uuid, factory, ttl, last_access, payload)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(factory)
        .bind(ttl)
        .bind(Utc::now())
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        self.listeners.emit(&StoreEvent::ArtifactCreated {
            uuid,
            factory: factory.to_string(),
        });

        Ok(ArtifactHandle {
            id: row.0,
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

        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM artifacts WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&mut *tx)
            .await?;

        let (id, created) = match existing {
            Some((id,)) => {
                sqlx::query(
                    r#"
                    UPDATE artifacts
                    SET factory = ?, ttl = ?, payload = ?, last_access = ?
                    WHERE id = ?
                    "#,
                )
                .bind(factory)
                .bind(ttl)
                .bind(payload)
                .bind(Utc::now())
                .bind(id)
                .execute(&mut *tx)
                .await?;
                (id, false)
            }
            None => {
                let row: (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO artifacts (uuid, factory, ttl, last_access, payload)
                    VALUES (?, ?, ?, ?, ?)
                    RETURNING id
                    "#,
                )
                .bind(uuid)
                .bind(factory)
                .bind(ttl)
                .bind(Utc::now())
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
        let record = sqlx::query_as::<_, ArtifactRecord>(
            r#"
            SELECT id, uuid, factory, ttl, last_access, payload
            FROM artifacts
            WHERE uuid = ?
            "#,
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_artifact_by_id(&self, id: i64) -> Result<Option<ArtifactRecord>> {
        let record = sqlx::query_as::<_, ArtifactRecord>(
            r#"
            SELECT id, uuid, factory, ttl, last_access, payload
            FROM artifacts
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn touch(&self, handle: &ArtifactHandle) -> Result<()> {
        let result = sqlx::query("UPDATE artifacts SET last_access = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(handle.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NoSuchArtifact {
                id: handle.uuid.to_string(),
            });
        }
        Ok(())
    }

    async fn store(&self, handle: &ArtifactHandle, payload: &[u8]) -> Result<()> {
        let result =
            sqlx::query("UPDATE artifacts SET payload = ?, last_access = ? WHERE id = ?")
                .bind(payload)
                .bind(Utc::now())
                .bind(handle.id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NoSuchArtifact {
                id: handle.uuid.to_string(),
            });
        }
        self.listeners
            .emit(&StoreEvent::ArtifactStored { uuid: handle.uuid });
        Ok(())
    }

    async fn delete_artifact(&self, id: i64) -> Result<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("DELETE FROM artifacts WHERE id = ? RETURNING uuid")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn outdate_artifact(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE artifacts SET ttl = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
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
            VALUES (?, ?, ?, ?)
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
        self.user_by_uuid(uuid).await
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
        let Some(user) = self.user_by_uuid(uuid).await? else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE artifacts
            SET ttl = 0
            WHERE id IN (
                SELECT ci.artifact_id
                FROM collection_items ci
                JOIN collections c ON c.id = ci.collection_id
                WHERE c.owner_id = ?1
            )
            AND NOT EXISTS (
                SELECT 1
                FROM collection_items ci2
                JOIN collections c2 ON c2.id = ci2.collection_id
                WHERE ci2.artifact_id = artifacts.id
                  AND (c2.owner_id IS NULL OR c2.owner_id <> ?1)
            )
            "#,
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM collection_items
            WHERE collection_id IN (SELECT id FROM collections WHERE owner_id = ?)
            "#,
        )
        .bind(user.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM collections WHERE owner_id = ?")
            .bind(user.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM users WHERE id = ?")
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
                match self.user_by_uuid(uuid).await? {
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
        let created_at = Utc::now();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO collections (uuid, name, owner_id, created_at, ttl, attributes)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(uuid)
        .bind(name)
        .bind(owner_id)
        .bind(created_at)
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
            created_at,
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
            WHERE uuid = ?
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
        let Some(collection_id) = self.collection_id_by_uuid(uuid).await? else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE artifacts
            SET ttl = 0
            WHERE id IN (
                SELECT artifact_id FROM collection_items WHERE collection_id = ?1
            )
            AND NOT EXISTS (
                SELECT 1 FROM collection_items ci
                WHERE ci.artifact_id = artifacts.id AND ci.collection_id <> ?1
            )
            "#,
        )
        .bind(collection_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM collection_items WHERE collection_id = ?")
            .bind(collection_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM collections WHERE id = ?")
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
        let result = sqlx::query("UPDATE collections SET ttl = ? WHERE uuid = ?")
            .bind(ttl)
            .bind(uuid)
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
        let result = sqlx::query("UPDATE collections SET name = ? WHERE uuid = ?")
            .bind(name)
            .bind(uuid)
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
            sqlx::query_as("SELECT attributes FROM collections WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set_collection_attributes(&self, id: &str, attributes: &[u8]) -> Result<bool> {
        let Some(uuid) = Self::parse_id(id) else {
            return Ok(false);
        };
        let result = sqlx::query("UPDATE collections SET attributes = ? WHERE uuid = ?")
            .bind(attributes)
            .bind(uuid)
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

        let Some(collection_id) = self.collection_id_by_uuid(collection_uuid).await? else {
            return Err(EngineError::NoSuchCollection {
                id: collection.to_string(),
            });
        };
        let Some(artifact_id) = self.artifact_id_by_uuid(artifact_uuid).await? else {
            return Err(EngineError::NoSuchArtifact {
                id: artifact.to_string(),
            });
        };

        let result = sqlx::query(
            r#"
            INSERT INTO collection_items (collection_id, artifact_id, attributes)
            VALUES (?, ?, ?)
            ON CONFLICT (collection_id, artifact_id) DO NOTHING
            "#,
        )
        .bind(collection_id)
        .bind(artifact_id)
        .bind(attributes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
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

        let Some(collection_id) = self.collection_id_by_uuid(collection_uuid).await? else {
            return Ok(false);
        };
        let Some(artifact_id) = self.artifact_id_by_uuid(artifact_uuid).await? else {
            return Ok(false);
        };

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "DELETE FROM collection_items WHERE collection_id = ? AND artifact_id = ?",
        )
        .bind(collection_id)
        .bind(artifact_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE artifacts
            SET ttl = 0
            WHERE id = ?1
              AND NOT EXISTS (SELECT 1 FROM collection_items WHERE artifact_id = ?1)
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
        let Some(collection_id) = self.collection_id_by_uuid(uuid).await? else {
            return Ok(Vec::new());
        };

        let records = sqlx::query_as::<_, MemberRecord>(
            r#"
            SELECT ci.collection_id, ci.artifact_id, ci.attributes, a.uuid, a.factory
            FROM collection_items ci
            JOIN artifacts a ON a.id = ci.artifact_id
            WHERE ci.collection_id = ?
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
            WHERE c.uuid = ? AND a.uuid = ?
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
            UPDATE collection_items
            SET attributes = ?3
            WHERE collection_id = (SELECT id FROM collections WHERE uuid = ?1)
              AND artifact_id = (SELECT id FROM artifacts WHERE uuid = ?2)
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

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, uuid FROM collections \
             WHERE ttl IS NOT NULL AND unixepoch(created_at) + ttl <= unixepoch(",
        );
        qb.push_bind(now);
        qb.push(")");
        if !locked.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut ids = qb.separated(", ");
            for id in locked {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
        }

        let expired: Vec<(i64, Uuid)> = qb
            .build_query_as()
            .fetch_all(&mut *tx)
            .await?;

        if expired.is_empty() {
            return Ok(Vec::new());
        }

        let mut delete_items =
            QueryBuilder::<Sqlite>::new("DELETE FROM collection_items WHERE collection_id IN (");
        let mut ids = delete_items.separated(", ");
        for (id, _) in &expired {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        delete_items.build().execute(&mut *tx).await?;

        let mut delete_rows = QueryBuilder::<Sqlite>::new("DELETE FROM collections WHERE id IN (");
        let mut ids = delete_rows.separated(", ");
        for (id, _) in &expired {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        delete_rows.build().execute(&mut *tx).await?;

        tx.commit().await?;

        Ok(expired.into_iter().map(|(_, uuid)| uuid).collect())
    }

    async fn expired_artifacts(
        &self,
        now: DateTime<Utc>,
        locked: &[i64],
        limit: i64,
    ) -> Result<Vec<ArtifactRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, uuid, factory, ttl, last_access, payload FROM artifacts \
             WHERE ttl IS NOT NULL AND unixepoch(last_access) + ttl <= unixepoch(",
        );
        qb.push_bind(now);
        qb.push(
            ") AND NOT EXISTS (SELECT 1 FROM collection_items ci \
             WHERE ci.artifact_id = artifacts.id)",
        );
        if !locked.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut ids = qb.separated(", ");
            for id in locked {
                ids.push_bind(*id);
            }
            ids.push_unseparated(")");
        }
        qb.push(" ORDER BY last_access LIMIT ");
        qb.push_bind(limit);

        let records = qb
            .build_query_as::<ArtifactRecord>()
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
