// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Curio Core - Artifact Persistence and Lifecycle Engine
//!
//! This crate gives stateful, long-lived business objects ("artifacts")
//! a uniform lifecycle: create, describe, mutate (feed/advance), render
//! (out), persist, expire, and delete. All state lives in a relational
//! store (PostgreSQL, with a SQLite twin for embedded runs and tests).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    API binding (external)                    │
//! │          maps URLs onto the engine's verb surface            │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   one CallContext per request ──► post-call action:          │
//! │   NOTHING │ TOUCH │ STORE │ BACKGROUND (locked-id set)       │
//! └─────────────┬───────────────────────────────┬───────────────┘
//!               │                               │
//!               ▼                               ▼
//! ┌───────────────────────────┐   ┌─────────────────────────────┐
//! │         Store             │◄──│     Lifecycle Collector      │
//! │ artifacts / users /       │   │  TTL scan: collections then  │
//! │ collections / items       │   │  artifacts, per-item commits │
//! └─────────────┬─────────────┘   └─────────────────────────────┘
//!               │
//!               ▼
//! ┌───────────────────────────┐
//! │   PostgreSQL / SQLite     │
//! └───────────────────────────┘
//! ```
//!
//! # Post-Call Actions
//!
//! Every request owns one [`context::CallContext`]. After the business
//! operation returns, the engine dispatches on the context's final
//! action:
//!
//! | Action | Effect |
//! |--------|--------|
//! | `Nothing` | no persistence effect |
//! | `Touch` | bump last-access, payload untouched |
//! | `Store` | re-serialize and write back the live object |
//! | `Background` | add the id to the locked set, then store |
//!
//! A backgrounded target is exempt from collection until the separate
//! background-completion path runs with a final `Nothing`/`Touch`/`Store`.
//!
//! # Lifecycle Collection
//!
//! A dedicated task reclaims TTL-expired rows: expired collections go
//! first (items, then the row, one transaction), then expired artifacts
//! in bounded batches. Each artifact's delete commits before its
//! end-of-life hook runs, so a crash never re-processes a deleted row.
//! Artifacts referenced by a collection item or present in the locked-id
//! set are never candidates.
//!
//! # Transfer
//!
//! [`transfer`] signs serialized artifact bytes for movement between
//! engines: `{factory, checksum(hex), payload(base64)}` with
//! `checksum = digest(payload || shared-secret)`.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CURIO_DATABASE_URL` | Yes | - | PostgreSQL or SQLite connection string |
//! | `CURIO_CLEANUP_INTERVAL_SECS` | No | `300` | Collector sleep (min 1) |
//! | `CURIO_CLEANUP_BATCH_SIZE` | No | `100` | Expired artifacts per fetch |
//! | `CURIO_DIGEST_ALGORITHM` | No | `sha-256` | Transfer checksum algorithm |
//! | `CURIO_TRANSFER_SECRET` | No | insecure | Shared transfer secret |
//! | `CURIO_DEFAULT_TTL_SECS` | No | `86400` | TTL for `DEFAULT` requests |

#![deny(missing_docs)]

/// Live-object traits: artifacts, serializers, factories, services.
pub mod artifact;

/// Locked-id set and background message queues.
pub mod background;

/// Background collector for TTL-expired collections and artifacts.
pub mod collector;

/// Configuration loading from environment variables.
pub mod config;

/// Per-invocation call contexts and post-call actions.
pub mod context;

/// The dependency-injected engine facade.
pub mod engine;

/// Error types with machine-readable reason strings.
pub mod error;

/// Listener fan-out for storage and lifecycle events.
pub mod events;

/// Embedded database migrations.
pub mod migrations;

/// Factory and service registries.
pub mod registry;

/// Storage interfaces and backends.
pub mod store;

/// Signed import/export documents.
pub mod transfer;
