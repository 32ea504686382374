// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL instance registry.
//!
//! Port reservation rides on a partial unique index over live instances
//! (`instances_host_map_port_live_idx`); a conflicting insert surfaces as
//! `Error::PortConflict` and the orchestrator retries with the next
//! candidate. The quota re-check runs inside the insert transaction under a
//! per-user advisory lock, so concurrent creates for the same user
//! serialize at the ceiling check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{InstanceRegistry, InstanceUpdate};
use crate::error::{Error, Result};
use crate::model::{
    AppType, Instance, InstanceKind, InstanceStatus, LifeAudit, LxdState, QuotaCeilings,
    UsageGauges,
};
use crate::quota;

/// Column list shared by every SELECT/RETURNING in this module.
const COLUMNS: &str = "id, name, user_id, username, status, kind, app_type, create_at, \
     life_span_ms, instance_token, web_dav_token, project, config, host_map_port, \
     lxd_state, created_time, created_user, deleted_time, deleted_user";

/// Name of the partial unique index enforcing port reservation.
const PORT_INDEX: &str = "instances_host_map_port_live_idx";

/// Instance registry client for PostgreSQL.
pub struct PgInstanceRegistry {
    pool: PgPool,
}

impl PgInstanceRegistry {
    /// Create a new registry client.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    id: String,
    name: String,
    user_id: String,
    username: String,
    status: String,
    kind: String,
    app_type: String,
    create_at: DateTime<Utc>,
    life_span_ms: i64,
    instance_token: String,
    web_dav_token: String,
    project: String,
    config: serde_json::Value,
    host_map_port: i32,
    lxd_state: Option<serde_json::Value>,
    created_time: DateTime<Utc>,
    created_user: String,
    deleted_time: Option<DateTime<Utc>>,
    deleted_user: Option<String>,
}

impl InstanceRow {
    fn into_instance(self) -> Result<Instance> {
        let status = InstanceStatus::parse(&self.status)
            .ok_or_else(|| Error::Upstream(format!("unknown instance status: {}", self.status)))?;
        let kind: InstanceKind =
            serde_json::from_value(serde_json::Value::String(self.kind.clone()))
                .map_err(|_| Error::Upstream(format!("unknown instance kind: {}", self.kind)))?;
        let app_type: AppType =
            serde_json::from_value(serde_json::Value::String(self.app_type.clone()))
                .map_err(|_| Error::Upstream(format!("unknown app type: {}", self.app_type)))?;
        Ok(Instance {
            id: self.id,
            name: self.name,
            user_id: self.user_id,
            username: self.username,
            status,
            kind,
            app_type,
            create_at: self.create_at,
            life_span_ms: self.life_span_ms,
            instance_token: self.instance_token,
            web_dav_token: self.web_dav_token,
            project: self.project,
            config: serde_json::from_value(self.config)?,
            host_map_port: self.host_map_port.clamp(0, u16::MAX as i32) as u16,
            metadata: UsageGauges::default(),
            lxd_state: self.lxd_state.map(serde_json::from_value).transpose()?,
            life: LifeAudit {
                created_time: self.created_time,
                created_user: self.created_user,
                deleted_time: self.deleted_time,
                deleted_user: self.deleted_user,
            },
        })
    }
}

fn rows_to_instances(rows: Vec<InstanceRow>) -> Result<Vec<Instance>> {
    rows.into_iter().map(InstanceRow::into_instance).collect()
}

fn kind_str(kind: InstanceKind) -> &'static str {
    match kind {
        InstanceKind::Container => "container",
        InstanceKind::VirtualMachine => "virtual-machine",
    }
}

fn app_type_str(app_type: AppType) -> &'static str {
    match app_type {
        AppType::Jupyter => "JUPYTER",
        AppType::Matlab => "MATLAB",
    }
}

#[async_trait]
impl InstanceRegistry for PgInstanceRegistry {
    async fn insert(&self, instance: Instance, ceilings: &QuotaCeilings) -> Result<Instance> {
        let mut tx = self.pool.begin().await?;

        // Serialize quota arbitration per user for the duration of the
        // transaction. Port reservation needs no lock; the unique index is
        // the authority there.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&instance.user_id)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {COLUMNS} FROM instances WHERE user_id = $1 AND status <> 'DELETED'"
        ))
        .bind(&instance.user_id)
        .fetch_all(&mut *tx)
        .await?;
        let existing = rows_to_instances(existing)?;

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

        let insert = sqlx::query(
            r#"
            INSERT INTO instances (
                id, name, user_id, username, status, kind, app_type, create_at,
                life_span_ms, instance_token, web_dav_token, project, config,
                host_map_port, lxd_state, created_time, created_user
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.user_id)
        .bind(&instance.username)
        .bind(instance.status.as_str())
        .bind(kind_str(instance.kind))
        .bind(app_type_str(instance.app_type))
        .bind(instance.create_at)
        .bind(instance.life_span_ms)
        .bind(&instance.instance_token)
        .bind(&instance.web_dav_token)
        .bind(&instance.project)
        .bind(serde_json::to_value(&instance.config)?)
        .bind(instance.host_map_port as i32)
        .bind(
            instance
                .lxd_state
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(instance.life.created_time)
        .bind(&instance.life.created_user)
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.constraint() == Some(PORT_INDEX) => {
                return Err(Error::PortConflict(instance.host_map_port));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;

        tracing::info!(
            instance_id = %instance.id,
            user_id = %instance.user_id,
            host_map_port = instance.host_map_port,
            "Registered instance"
        );

        Ok(instance)
    }

    async fn get(&self, id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {COLUMNS} FROM instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn get_owned(&self, user_id: &str, id: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {COLUMNS} FROM instances WHERE id = $1 AND user_id = $2 AND status <> 'DELETED'"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn find_by_name(&self, owner: Option<&str>, name: &str) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {COLUMNS} FROM instances \
             WHERE name = $1 AND status <> 'DELETED' AND ($2::TEXT IS NULL OR user_id = $2) \
             LIMIT 1"
        ))
        .bind(name)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn list_live_for_user(&self, user_id: &str) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {COLUMNS} FROM instances \
             WHERE user_id = $1 AND status <> 'DELETED' ORDER BY create_at"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows_to_instances(rows)
    }

    async fn list_live(&self) -> Result<Vec<Instance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            "SELECT {COLUMNS} FROM instances WHERE status <> 'DELETED' ORDER BY create_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows_to_instances(rows)
    }

    async fn live_ports(&self) -> Result<Vec<u16>> {
        let ports: Vec<(i32,)> = sqlx::query_as(
            "SELECT host_map_port FROM instances WHERE status <> 'DELETED'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ports
            .into_iter()
            .map(|(p,)| p.clamp(0, u16::MAX as i32) as u16)
            .collect())
    }

    async fn transition_status(
        &self,
        user_id: Option<&str>,
        id: &str,
        allowed_from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> Result<Option<Instance>> {
        let allowed: Vec<String> = allowed_from
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "UPDATE instances SET status = $1 \
             WHERE id = $2 AND status <> 'DELETED' \
               AND ($3::TEXT IS NULL OR user_id = $3) \
               AND (cardinality($4::TEXT[]) = 0 OR status = ANY($4)) \
             RETURNING {COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(id)
        .bind(user_id)
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn reset_for_restart(
        &self,
        user_id: &str,
        id: &str,
        life_span_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "UPDATE instances SET create_at = $3, life_span_ms = $4, status = 'STARTING' \
             WHERE id = $1 AND user_id = $2 AND status <> 'DELETED' \
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(user_id)
        .bind(now)
        .bind(life_span_ms)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn apply_update(&self, id: &str, update: InstanceUpdate) -> Result<Option<Instance>> {
        let config = update
            .config
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "UPDATE instances SET \
                 name = COALESCE($2, name), \
                 config = COALESCE($3, config) \
             WHERE id = $1 AND status <> 'DELETED' \
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(update.name.as_deref())
        .bind(config)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn set_life_span(&self, id: &str, life_span_ms: i64) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "UPDATE instances SET life_span_ms = $2 \
             WHERE id = $1 AND status <> 'DELETED' \
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(life_span_ms)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InstanceRow::into_instance).transpose()
    }

    async fn mark_deleted(
        &self,
        user_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            "UPDATE instances SET status = 'DELETED', deleted_time = $3, deleted_user = $2 \
             WHERE id = $1 AND user_id = $2 AND status <> 'DELETED' \
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_some() {
            tracing::info!(instance_id = %id, user_id = %user_id, "Soft-deleted instance");
        }

        row.map(InstanceRow::into_instance).transpose()
    }

    async fn record_runtime_state(&self, id: &str, state: LxdState) -> Result<()> {
        sqlx::query("UPDATE instances SET lxd_state = $2 WHERE id = $1")
            .bind(id)
            .bind(serde_json::to_value(&state)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
