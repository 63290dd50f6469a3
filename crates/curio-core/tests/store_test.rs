// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage backend behavior: round trips, membership semantics, cascade
//! deletes, attributes, and event emission.

mod common;

use serde_json::json;

use curio_core::error::EngineError;
use curio_core::events::StoreEvent;
use curio_core::store::{Store as _, Ttl};

#[tokio::test]
async fn test_store_load_round_trip() {
    let h = common::harness().await;

    let handle = h
        .engine
        .create("note", json!({ "title": "first", "body": "hello" }), Ttl::Infinite)
        .await
        .unwrap();

    // The stored payload revives to an identical business object.
    let record = h
        .store
        .get_artifact(&handle.uuid.to_string())
        .await
        .unwrap()
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(parsed["title"], "first");
    assert_eq!(parsed["body"], "hello");
    assert_eq!(parsed["revision"], 0);
    assert_eq!(record.ttl, None);

    // A mutation persists through the store cycle.
    h.engine
        .feed(&handle.uuid.to_string(), json!({ "body": "changed" }))
        .await
        .unwrap();
    let described = h.engine.describe(&handle.uuid.to_string()).await.unwrap();
    assert_eq!(described["revision"], 1);
}

#[tokio::test]
async fn test_invalid_identifier_is_not_found() {
    let h = common::harness().await;

    assert!(h.store.get_artifact("").await.unwrap().is_none());
    assert!(h.store.get_artifact("not-a-uuid").await.unwrap().is_none());
    // Well-formed but wrong version is equally invisible.
    assert!(
        h.store
            .get_artifact("f81d4fae-7dec-11d0-a765-00a0c91e6bf6")
            .await
            .unwrap()
            .is_none()
    );

    let err = h.engine.describe("not-a-uuid").await.unwrap_err();
    assert_eq!(err.error_code(), "NO_SUCH_ARTIFACT");
}

#[tokio::test]
async fn test_membership_is_a_set() {
    let h = common::harness().await;

    let artifact = h
        .engine
        .create("note", json!({ "title": "member" }), Ttl::Infinite)
        .await
        .unwrap();
    let collection = h
        .engine
        .create_collection("box", None, Ttl::Infinite, b"")
        .await
        .unwrap();

    let collection_id = collection.uuid.to_string();
    let artifact_id = artifact.uuid.to_string();

    assert!(h.engine.add_member(&collection_id, &artifact_id, b"").await.unwrap());
    assert!(
        !h.engine.add_member(&collection_id, &artifact_id, b"").await.unwrap(),
        "second add must be rejected"
    );
    assert_eq!(h.item_count().await, 1);

    // Exactly one MemberAdded despite two calls.
    let added = h
        .recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, StoreEvent::MemberAdded { .. }))
        .count();
    assert_eq!(added, 1);
}

#[tokio::test]
async fn test_remove_last_membership_outdates_artifact() {
    let h = common::harness().await;

    let artifact = h
        .engine
        .create("note", json!({ "title": "loner" }), Ttl::Infinite)
        .await
        .unwrap();
    let first = h
        .engine
        .create_collection("one", None, Ttl::Infinite, b"")
        .await
        .unwrap();
    let second = h
        .engine
        .create_collection("two", None, Ttl::Infinite, b"")
        .await
        .unwrap();

    let artifact_id = artifact.uuid.to_string();
    h.engine
        .add_member(&first.uuid.to_string(), &artifact_id, b"")
        .await
        .unwrap();
    h.engine
        .add_member(&second.uuid.to_string(), &artifact_id, b"")
        .await
        .unwrap();

    assert_eq!(
        h.store.referenced_artifact_ids().await.unwrap(),
        vec![artifact.id]
    );

    // Still referenced elsewhere: no outdating.
    assert!(
        h.engine
            .remove_member(&first.uuid.to_string(), &artifact_id)
            .await
            .unwrap()
    );
    assert_eq!(h.artifact_ttl(artifact.id).await, None);

    // Last membership gone: eligible for expiry.
    assert!(
        h.engine
            .remove_member(&second.uuid.to_string(), &artifact_id)
            .await
            .unwrap()
    );
    assert_eq!(h.artifact_ttl(artifact.id).await, Some(0));

    // Removing again reports non-membership.
    assert!(
        !h.engine
            .remove_member(&second.uuid.to_string(), &artifact_id)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_delete_collection_cascades_and_outdates_exclusive_members() {
    let h = common::harness().await;

    let shared = h
        .engine
        .create("note", json!({ "title": "shared" }), Ttl::Infinite)
        .await
        .unwrap();
    let exclusive = h
        .engine
        .create("note", json!({ "title": "exclusive" }), Ttl::Infinite)
        .await
        .unwrap();

    let doomed = h
        .engine
        .create_collection("doomed", None, Ttl::Infinite, b"")
        .await
        .unwrap();
    let survivor = h
        .engine
        .create_collection("survivor", None, Ttl::Infinite, b"")
        .await
        .unwrap();

    h.engine
        .add_member(&doomed.uuid.to_string(), &shared.uuid.to_string(), b"")
        .await
        .unwrap();
    h.engine
        .add_member(&doomed.uuid.to_string(), &exclusive.uuid.to_string(), b"")
        .await
        .unwrap();
    h.engine
        .add_member(&survivor.uuid.to_string(), &shared.uuid.to_string(), b"")
        .await
        .unwrap();

    h.engine.delete_collection(&doomed.uuid.to_string()).await.unwrap();

    assert_eq!(h.collection_count().await, 1);
    assert_eq!(h.item_count().await, 1, "only the survivor's membership remains");
    // Both artifact rows still exist; only the exclusive one is outdated.
    assert_eq!(h.artifact_count().await, 2);
    assert_eq!(h.artifact_ttl(shared.id).await, None);
    assert_eq!(h.artifact_ttl(exclusive.id).await, Some(0));

    let err = h
        .engine
        .delete_collection(&doomed.uuid.to_string())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "NO_SUCH_COLLECTION");
}

#[tokio::test]
async fn test_delete_user_cascades() {
    let h = common::harness().await;

    let user = h.engine.create_user("Ada", "ada", b"admin").await.unwrap();
    let other_user = h.engine.create_user("Grace", "grace", b"").await.unwrap();

    let owned = h
        .engine
        .create_collection("ada-things", Some(&user.uuid.to_string()), Ttl::Infinite, b"")
        .await
        .unwrap();
    let foreign = h
        .engine
        .create_collection(
            "grace-things",
            Some(&other_user.uuid.to_string()),
            Ttl::Infinite,
            b"",
        )
        .await
        .unwrap();

    let exclusive = h
        .engine
        .create("note", json!({ "title": "ada-only" }), Ttl::Infinite)
        .await
        .unwrap();
    let shared = h
        .engine
        .create("note", json!({ "title": "shared" }), Ttl::Infinite)
        .await
        .unwrap();

    h.engine
        .add_member(&owned.uuid.to_string(), &exclusive.uuid.to_string(), b"")
        .await
        .unwrap();
    h.engine
        .add_member(&owned.uuid.to_string(), &shared.uuid.to_string(), b"")
        .await
        .unwrap();
    h.engine
        .add_member(&foreign.uuid.to_string(), &shared.uuid.to_string(), b"")
        .await
        .unwrap();

    h.engine.delete_user(&user.uuid.to_string()).await.unwrap();

    // Ada's collection and memberships are gone; Grace's remain.
    assert_eq!(h.collection_count().await, 1);
    assert_eq!(h.item_count().await, 1);
    assert!(h.engine.get_user(&user.uuid.to_string()).await.unwrap().is_none());
    assert!(
        h.engine
            .get_user(&other_user.uuid.to_string())
            .await
            .unwrap()
            .is_some()
    );

    // Only the exclusively-owned artifact was outdated.
    assert_eq!(h.artifact_ttl(exclusive.id).await, Some(0));
    assert_eq!(h.artifact_ttl(shared.id).await, None);

    let events = h.recorder.events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, StoreEvent::UserDeleted { uuid } if *uuid == user.uuid))
    );
}

#[tokio::test]
async fn test_create_user_validation() {
    let h = common::harness().await;

    let err = h.engine.create_user("", "account", b"").await.unwrap_err();
    assert_eq!(err.error_code(), "MISSING_USERNAME");

    let err = h.engine.create_user("Display", "", b"").await.unwrap_err();
    assert_eq!(err.error_code(), "MISSING_ACCOUNT");
}

#[tokio::test]
async fn test_collection_attributes_and_item_attributes() {
    let h = common::harness().await;

    let artifact = h
        .engine
        .create("note", json!({ "title": "attributed" }), Ttl::Infinite)
        .await
        .unwrap();
    let collection = h
        .engine
        .create_collection("attrs", None, Ttl::Infinite, b"initial")
        .await
        .unwrap();

    let collection_id = collection.uuid.to_string();
    let artifact_id = artifact.uuid.to_string();

    assert_eq!(
        h.engine.collection_attributes(&collection_id).await.unwrap(),
        b"initial"
    );
    h.engine
        .set_collection_attributes(&collection_id, b"updated")
        .await
        .unwrap();
    assert_eq!(
        h.engine.collection_attributes(&collection_id).await.unwrap(),
        b"updated"
    );

    h.engine
        .add_member(&collection_id, &artifact_id, b"per-item")
        .await
        .unwrap();
    assert_eq!(
        h.engine.item_attributes(&collection_id, &artifact_id).await.unwrap(),
        b"per-item"
    );
    h.engine
        .set_item_attributes(&collection_id, &artifact_id, b"rewritten")
        .await
        .unwrap();
    assert_eq!(
        h.engine.item_attributes(&collection_id, &artifact_id).await.unwrap(),
        b"rewritten"
    );
}

#[tokio::test]
async fn test_collection_rename_and_ttl_update() {
    let h = common::harness().await;

    let collection = h
        .engine
        .create_collection("old-name", None, Ttl::Infinite, b"")
        .await
        .unwrap();
    let id = collection.uuid.to_string();

    h.engine.set_collection_name(&id, "new-name").await.unwrap();
    h.engine.set_collection_ttl(&id, Ttl::Seconds(120)).await.unwrap();

    let reloaded = h.engine.get_collection(&id).await.unwrap().unwrap();
    assert_eq!(reloaded.name, "new-name");
    assert_eq!(reloaded.ttl, Some(120));

    // DEFAULT resolves against the engine-wide default.
    h.engine.set_collection_ttl(&id, Ttl::Default).await.unwrap();
    let reloaded = h.engine.get_collection(&id).await.unwrap().unwrap();
    assert_eq!(reloaded.ttl, Some(86400));

    let missing = curio_core::store::new_identifier().to_string();
    let err = h
        .engine
        .set_collection_name(&missing, "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSuchCollection { .. }));
}

#[tokio::test]
async fn test_store_or_replace_upsert_events() {
    let h = common::harness().await;

    let uuid = curio_core::store::new_identifier();
    let first = serde_json::to_vec(&json!({ "title": "v1", "body": "", "revision": 0 })).unwrap();
    let second = serde_json::to_vec(&json!({ "title": "v2", "body": "", "revision": 1 })).unwrap();

    let handle = h
        .store
        .store_or_replace(uuid, &first, "note", Some(60))
        .await
        .unwrap();
    let replaced = h
        .store
        .store_or_replace(uuid, &second, "note", Some(60))
        .await
        .unwrap();
    assert_eq!(handle.id, replaced.id, "upsert keeps the numeric id");
    assert_eq!(h.artifact_count().await, 1);

    let events = h.recorder.events();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, StoreEvent::ArtifactCreated { uuid: u, .. } if *u == uuid))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, StoreEvent::ArtifactStored { uuid: u } if *u == uuid))
    );
}

#[tokio::test]
async fn test_sqlite_store_from_path_creates_and_migrates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("curio.db");

    let listeners = curio_core::events::Listeners::new();
    let store = curio_core::store::SqliteStore::from_path(&path, listeners)
        .await
        .unwrap();

    assert!(store.health_check().await.unwrap());
    assert!(path.exists());

    // The schema is in place: a plain insert works.
    let handle = store
        .store_initially(b"{}", "note", Some(60))
        .await
        .unwrap();
    assert!(handle.id > 0);
}

#[tokio::test]
async fn test_warm_start_scan_visits_every_membership() {
    let h = common::harness().await;

    let shared = h
        .engine
        .create("note", json!({ "title": "shared" }), Ttl::Infinite)
        .await
        .unwrap();
    let single = h
        .engine
        .create("note", json!({ "title": "single" }), Ttl::Infinite)
        .await
        .unwrap();

    let first = h
        .engine
        .create_collection("first", None, Ttl::Infinite, b"")
        .await
        .unwrap();
    let second = h
        .engine
        .create_collection("second", None, Ttl::Infinite, b"")
        .await
        .unwrap();

    for collection in [&first, &second] {
        h.engine
            .add_member(&collection.uuid.to_string(), &shared.uuid.to_string(), b"")
            .await
            .unwrap();
    }
    h.engine
        .add_member(&first.uuid.to_string(), &single.uuid.to_string(), b"")
        .await
        .unwrap();

    let mut seen = Vec::new();
    let visited = h
        .engine
        .load_all_artifacts(|collection, member, _live| {
            seen.push((collection.uuid, member.uuid));
        })
        .await
        .unwrap();

    assert_eq!(visited, 3);
    assert_eq!(seen.len(), 3);
    assert!(seen.contains(&(first.uuid, shared.uuid)));
    assert!(seen.contains(&(second.uuid, shared.uuid)));
    assert!(seen.contains(&(first.uuid, single.uuid)));
}
