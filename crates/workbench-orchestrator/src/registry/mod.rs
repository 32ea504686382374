// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted source of truth for instance records.
//!
//! The registry owns the atomic pieces of the orchestration model: port
//! reservation and quota arbitration both happen inside
//! [`InstanceRegistry::insert`], so two concurrent creates can neither
//! claim the same host port nor jointly overrun a ceiling. Status changes
//! go through conditional updates carrying the set of allowed current
//! statuses, never blind read-then-write.
//!
//! Instances are soft-deleted only: DELETED records keep their audit stamp
//! and stay queryable, but release their host port and stop counting
//! against quotas.

mod memory;
mod postgres;

pub use memory::MemoryRegistry;
pub use postgres::PgInstanceRegistry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Instance, InstanceStatus, LxdState, QuotaCeilings};

/// Partial update applied by `edit_instance`. Unset fields keep their
/// current value; a present `config` replaces the whole map.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    /// New display name.
    pub name: Option<String>,
    /// Replacement config map.
    pub config: Option<BTreeMap<String, String>>,
}

impl InstanceUpdate {
    /// Whether the update changes anything at all.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.config.is_none()
    }
}

/// Storage interface for instance records.
///
/// All listing operations exclude DELETED records unless stated otherwise.
/// Conditional updates return `None` when no record matched, letting the
/// orchestrator distinguish NotFound from Upstream.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Atomically insert a new instance, reserving its host port and
    /// re-validating the owner's quota under a per-user lock.
    ///
    /// Fails with `Error::PortConflict` when the port is already held by a
    /// live instance, and with `Error::QuotaExceeded` when the insert would
    /// overrun a ceiling.
    async fn insert(&self, instance: Instance, ceilings: &QuotaCeilings) -> Result<Instance>;

    /// Fetch any record (including DELETED) by id.
    async fn get(&self, id: &str) -> Result<Option<Instance>>;

    /// Fetch a live record by id, scoped to its owner.
    async fn get_owned(&self, user_id: &str, id: &str) -> Result<Option<Instance>>;

    /// Find a live record by name. `owner` narrows the search to one user;
    /// `None` searches across users (admin path).
    async fn find_by_name(&self, owner: Option<&str>, name: &str) -> Result<Option<Instance>>;

    /// Live instances owned by the user.
    async fn list_live_for_user(&self, user_id: &str) -> Result<Vec<Instance>>;

    /// All live instances (reconciler path).
    async fn list_live(&self) -> Result<Vec<Instance>>;

    /// Host ports of all live instances.
    async fn live_ports(&self) -> Result<Vec<u16>>;

    /// Conditionally set the status.
    ///
    /// The update applies only when the record is live, currently in one of
    /// `allowed_from` (an empty slice allows any live status), and, when
    /// `user_id` is given, owned by that user. Returns the updated record,
    /// or `None` when nothing matched.
    async fn transition_status(
        &self,
        user_id: Option<&str>,
        id: &str,
        allowed_from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<Instance>>;

    /// Reset for restart: `create_at = now`, a fresh lifespan budget, and
    /// status STARTING, scoped to the owner. Returns `None` when no live
    /// record matched.
    async fn reset_for_restart(
        &self,
        user_id: &str,
        id: &str,
        life_span_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Instance>>;

    /// Apply a partial update to a live record.
    async fn apply_update(&self, id: &str, update: InstanceUpdate) -> Result<Option<Instance>>;

    /// Overwrite the persisted lifespan budget of a live record.
    async fn set_life_span(&self, id: &str, life_span_ms: i64) -> Result<Option<Instance>>;

    /// Soft-delete: status DELETED plus the audit stamp, scoped to the
    /// owner. Returns `None` when no live record matched.
    async fn mark_deleted(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Instance>>;

    /// Write-through for the dispatcher side: replace the runtime snapshot.
    /// This core only ever reads `lxd_state`.
    async fn record_runtime_state(&self, id: &str, state: LxdState) -> Result<()>;
}
