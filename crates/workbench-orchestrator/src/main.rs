// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workbench Orchestrator - Research Workspace Control Plane
//!
//! Service responsible for:
//! - Instance records (create, edit, delete, lifecycle status)
//! - Host-port and per-user quota arbitration
//! - Job dispatch to the external LXD workers
//! - Lifespan expiry enforcement (reconciler)

use std::sync::Arc;
use tracing::{info, warn};

use workbench_orchestrator::config::Config;
use workbench_orchestrator::dispatch::PgJobQueue;
use workbench_orchestrator::migrations;
use workbench_orchestrator::reconciler::{Reconciler, ReconcilerConfig};
use workbench_orchestrator::registry::PgInstanceRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workbench_orchestrator=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        port_min = config.port_range.min,
        port_max = config.port_range.max,
        project = %config.project,
        "Starting Workbench Orchestrator"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database migrations applied");

    let registry = Arc::new(PgInstanceRegistry::new(pool.clone()));
    let dispatcher = Arc::new(PgJobQueue::new(pool));

    let reconciler = Reconciler::new(
        registry,
        dispatcher,
        ReconcilerConfig {
            poll_interval: config.poll_interval,
            ..ReconcilerConfig::default()
        },
    );
    let shutdown = reconciler.shutdown_handle();
    let reconciler_task = tokio::spawn(async move { reconciler.run().await });

    info!("Orchestrator ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.notify_one();
    reconciler_task.await?;

    info!("Workbench Orchestrator shut down");

    Ok(())
}
