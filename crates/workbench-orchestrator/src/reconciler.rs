// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker enforcing lifespan expiry and monitor coverage.
//!
//! Listing instances is a pure read; this worker is where the side effects
//! live. Each pass it:
//! - stops live instances whose lifespan budget ran out, and
//! - makes sure every user with live instances has one pending STATE and
//!   one pending SYNC_DELETION monitor job queued.
//!
//! Both actions are idempotent, so overlapping deployments or a crashed
//! pass cannot double-stop an instance or pile up monitor jobs.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::dispatch::{JobDispatcher, JobFilter, JobKind, JobRequest, JobStatus};
use crate::error::Result;
use crate::lifespan;
use crate::model::InstanceStatus;
use crate::registry::InstanceRegistry;

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to run a reconciliation pass.
    pub poll_interval: Duration,
    /// Re-run period handed to the monitor jobs, in milliseconds.
    pub monitor_period_ms: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            monitor_period_ms: 120_000, // monitors re-run every 2 minutes
        }
    }
}

/// Background worker that reconciles registry state with wall-clock time.
pub struct Reconciler {
    registry: Arc<dyn InstanceRegistry>,
    dispatcher: Arc<dyn JobDispatcher>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        dispatcher: Arc<dyn JobDispatcher>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            monitor_period_ms = self.config.monitor_period_ms,
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Run a single reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<()> {
        let now = Utc::now();
        let instances = self.registry.list_live().await?;

        let mut users = BTreeSet::new();
        let mut stopped = 0usize;
        for instance in &instances {
            users.insert(instance.user_id.clone());

            if !lifespan::is_expired(instance, now) {
                continue;
            }

            if lifespan::needs_expiry_stop(instance.status) {
                // The transition is conditional on the status still being
                // active, so a concurrent user-initiated stop wins cleanly.
                let transitioned = self
                    .registry
                    .transition_status(
                        None,
                        &instance.id,
                        &[
                            InstanceStatus::Pending,
                            InstanceStatus::Starting,
                            InstanceStatus::Running,
                        ],
                        InstanceStatus::Stopping,
                    )
                    .await?;
                if transitioned.is_some() {
                    self.dispatcher
                        .create_job(JobRequest::for_instance(
                            &instance.user_id,
                            JobKind::Stop,
                            &instance.id,
                        ))
                        .await?;
                    self.registry.set_life_span(&instance.id, 0).await?;
                    stopped += 1;
                    info!(
                        instance_id = %instance.id,
                        user_id = %instance.user_id,
                        "Stopped expired instance"
                    );
                }
            } else if instance.life_span_ms != 0 {
                // Already stopped or failing; just pin the exhausted budget.
                self.registry.set_life_span(&instance.id, 0).await?;
            }
        }

        for user_id in &users {
            self.ensure_monitor(user_id, JobKind::State).await?;
            self.ensure_monitor(user_id, JobKind::SyncDeletion).await?;
        }

        debug!(
            live = instances.len(),
            stopped, users = users.len(),
            "Reconciliation pass complete"
        );
        Ok(())
    }

    /// Queue a periodic monitor job for the user unless one is pending.
    async fn ensure_monitor(&self, user_id: &str, kind: JobKind) -> Result<()> {
        let pending = self
            .dispatcher
            .get_jobs(&JobFilter {
                owner_id: Some(user_id.to_string()),
                kind: Some(kind),
                status: Some(JobStatus::Pending),
                ..JobFilter::default()
            })
            .await?;
        if pending.is_empty() {
            self.dispatcher
                .create_job(JobRequest::periodic_monitor(
                    user_id,
                    kind,
                    self.config.monitor_period_ms,
                ))
                .await?;
            debug!(user_id = %user_id, kind = kind.as_str(), "Queued monitor job");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.monitor_period_ms, 120_000);
    }
}
