// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Curio Core - Artifact Persistence and Lifecycle Engine
//!
//! The entry point owns the engine's lifecycle: it builds the store and
//! registries, opens the engine (which starts the collector), and closes
//! everything on ctrl-c. Factories and services are registered here by
//! the embedding product; a bare curio-core process runs storage and
//! collection only.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use curio_core::config::Config;
use curio_core::engine::{Engine, EngineOptions};
use curio_core::events::Listeners;
use curio_core::migrations;
use curio_core::registry::{FactoryRegistry, ServiceRegistry};
use curio_core::store::PostgresStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("curio_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Curio Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        cleanup_interval_secs = config.cleanup_interval.as_secs(),
        cleanup_batch_size = config.cleanup_batch_size,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Database connection established");

    info!("Running database migrations...");
    migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    // Wire the engine: one listener list shared by store and collector.
    let listeners = Listeners::new();
    let store = Arc::new(PostgresStore::new(pool.clone(), listeners.clone()));

    // Factories and services come from the embedding product; a bare
    // process registers none.
    let factories = Arc::new(FactoryRegistry::new());
    let services = Arc::new(ServiceRegistry::new());

    let engine = Engine::new(
        store,
        factories,
        services,
        listeners,
        EngineOptions::from(&config),
    );

    engine.open().await?;
    info!("Curio Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    engine.close().await;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
