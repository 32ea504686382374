// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory instance registry.
//!
//! Mirrors the PostgreSQL backend's semantics behind a single mutex, which
//! makes the insert-time port reservation and quota re-check trivially
//! atomic. Used by the orchestrator and reconciler tests, and usable as an
//! embedded backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{InstanceRegistry, InstanceUpdate};
use crate::error::{Error, Result};
use crate::model::{Instance, InstanceStatus, LxdState, QuotaCeilings};
use crate::quota;

/// Mutex-guarded map of instance records keyed by id.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    inner: Mutex<HashMap<String, Instance>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRegistry for MemoryRegistry {
    async fn insert(&self, instance: Instance, ceilings: &QuotaCeilings) -> Result<Instance> {
        let mut inner = self.inner.lock().await;

        if inner
            .values()
            .any(|i| i.status.is_live() && i.host_map_port == instance.host_map_port)
        {
            return Err(Error::PortConflict(instance.host_map_port));
        }

        let existing: Vec<Instance> = inner
            .values()
            .filter(|i| i.user_id == instance.user_id && i.status.is_live())
            .cloned()
            .collect();
        quota::check_quota(
            &existing,
            instance.cpu_limit_cores(),
            instance
                .config
                .get(crate::model::config_keys::MEMORY_LIMIT)
                .map(String::as_str)
                .unwrap_or(""),
            instance
                .config
                .get(crate::model::config_keys::USER_DISK)
                .map(String::as_str)
                .unwrap_or(""),
            1,
            ceilings,
        )?;

        inner.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get(&self, id: &str) -> Result<Option<Instance>> {
        Ok(self.inner.lock().await.get(id).cloned())
    }

    async fn get_owned(&self, user_id: &str, id: &str) -> Result<Option<Instance>> {
        Ok(self
            .inner
            .lock()
            .await
            .get(id)
            .filter(|i| i.user_id == user_id && i.status.is_live())
            .cloned())
    }

    async fn find_by_name(&self, owner: Option<&str>, name: &str) -> Result<Option<Instance>> {
        Ok(self
            .inner
            .lock()
            .await
            .values()
            .find(|i| {
                i.status.is_live()
                    && i.name == name
                    && owner.is_none_or(|o| i.user_id == o)
            })
            .cloned())
    }

    async fn list_live_for_user(&self, user_id: &str) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .inner
            .lock()
            .await
            .values()
            .filter(|i| i.user_id == user_id && i.status.is_live())
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.create_at.cmp(&b.create_at));
        Ok(instances)
    }

    async fn list_live(&self) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .inner
            .lock()
            .await
            .values()
            .filter(|i| i.status.is_live())
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.create_at.cmp(&b.create_at));
        Ok(instances)
    }

    async fn live_ports(&self) -> Result<Vec<u16>> {
        Ok(self
            .inner
            .lock()
            .await
            .values()
            .filter(|i| i.status.is_live())
            .map(|i| i.host_map_port)
            .collect())
    }

    async fn transition_status(
        &self,
        user_id: Option<&str>,
        id: &str,
        allowed_from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<Instance>> {
        let mut inner = self.inner.lock().await;
        let Some(instance) = inner.get_mut(id) else {
            return Ok(None);
        };
        if !instance.status.is_live()
            || user_id.is_some_and(|u| instance.user_id != u)
            || (!allowed_from.is_empty() && !allowed_from.contains(&instance.status))
        {
            return Ok(None);
        }
        instance.status = to;
        Ok(Some(instance.clone()))
    }

    async fn reset_for_restart(
        &self,
        user_id: &str,
        id: &str,
        life_span_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Instance>> {
        let mut inner = self.inner.lock().await;
        let Some(instance) = inner.get_mut(id) else {
            return Ok(None);
        };
        if !instance.status.is_live() || instance.user_id != user_id {
            return Ok(None);
        }
        instance.create_at = now;
        instance.life_span_ms = life_span_ms;
        instance.status = InstanceStatus::Starting;
        Ok(Some(instance.clone()))
    }

    async fn apply_update(&self, id: &str, update: InstanceUpdate) -> Result<Option<Instance>> {
        let mut inner = self.inner.lock().await;
        let Some(instance) = inner.get_mut(id) else {
            return Ok(None);
        };
        if !instance.status.is_live() {
            return Ok(None);
        }
        if let Some(name) = update.name {
            instance.name = name;
        }
        if let Some(config) = update.config {
            instance.config = config;
        }
        Ok(Some(instance.clone()))
    }

    async fn set_life_span(&self, id: &str, life_span_ms: i64) -> Result<Option<Instance>> {
        let mut inner = self.inner.lock().await;
        let Some(instance) = inner.get_mut(id) else {
            return Ok(None);
        };
        if !instance.status.is_live() {
            return Ok(None);
        }
        instance.life_span_ms = life_span_ms;
        Ok(Some(instance.clone()))
    }

    async fn mark_deleted(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Instance>> {
        let mut inner = self.inner.lock().await;
        let Some(instance) = inner.get_mut(id) else {
            return Ok(None);
        };
        if !instance.status.is_live() || instance.user_id != user_id {
            return Ok(None);
        }
        instance.status = InstanceStatus::Deleted;
        instance.life.deleted_time = Some(now);
        instance.life.deleted_user = Some(user_id.to_string());
        Ok(Some(instance.clone()))
    }

    async fn record_runtime_state(&self, id: &str, state: LxdState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.get_mut(id) {
            instance.lxd_state = Some(state);
        }
        Ok(())
    }
}
