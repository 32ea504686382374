// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed job queue.
//!
//! The producer side of the dispatcher contract: jobs are inserted into the
//! shared `jobs` table and the out-of-process dispatcher workers consume
//! them by priority. This core never executes jobs itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Job, JobDispatcher, JobExecutor, JobFilter, JobKind, JobRequest, JobStatus};
use crate::error::{Error, Result};

/// Job queue client for PostgreSQL.
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    /// Create a new queue client.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    owner_id: String,
    name: String,
    kind: String,
    status: String,
    schedule_at: Option<DateTime<Utc>>,
    period_ms: Option<i64>,
    executor: serde_json::Value,
    priority: i32,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    deleted_time: Option<DateTime<Utc>>,
    deleted_user: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let kind: JobKind = serde_json::from_value(serde_json::Value::String(self.kind.clone()))
            .map_err(|_| Error::Upstream(format!("unknown job kind: {}", self.kind)))?;
        let status: JobStatus =
            serde_json::from_value(serde_json::Value::String(self.status.clone()))
                .map_err(|_| Error::Upstream(format!("unknown job status: {}", self.status)))?;
        let executor: JobExecutor = serde_json::from_value(self.executor)?;
        Ok(Job {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            kind,
            status,
            schedule_at: self.schedule_at,
            period_ms: self.period_ms,
            executor,
            priority: self.priority.clamp(0, 10) as u8,
            metadata: self.metadata,
            created_at: self.created_at,
            deleted_time: self.deleted_time,
            deleted_user: self.deleted_user,
        })
    }
}

#[async_trait]
impl JobDispatcher for PgJobQueue {
    async fn create_job(&self, request: JobRequest) -> Result<Job> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            owner_id: request.owner_id,
            name: request.name,
            kind: request.kind,
            status: JobStatus::Pending,
            schedule_at: request.schedule_at,
            period_ms: request.period_ms,
            executor: request.executor,
            priority: request.priority.min(10),
            metadata: request.metadata,
            created_at: Utc::now(),
            deleted_time: None,
            deleted_user: None,
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, owner_id, name, kind, status, schedule_at, period_ms,
                executor, priority, metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&job.id)
        .bind(&job.owner_id)
        .bind(&job.name)
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.schedule_at)
        .bind(job.period_ms)
        .bind(serde_json::to_value(&job.executor)?)
        .bind(job.priority as i32)
        .bind(&job.metadata)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            job_id = %job.id,
            kind = job.kind.as_str(),
            priority = job.priority,
            owner_id = %job.owner_id,
            "Enqueued job"
        );

        Ok(job)
    }

    async fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, owner_id, name, kind, status, schedule_at, period_ms,
                   executor, priority, metadata, created_at, deleted_time, deleted_user
            FROM jobs
            WHERE ($1::TEXT IS NULL OR owner_id = $1)
              AND ($2::TEXT IS NULL OR name = $2)
              AND ($3::TEXT IS NULL OR kind = $3)
              AND ($4::TEXT IS NULL OR status = $4)
            ORDER BY created_at
            "#,
        )
        .bind(filter.owner_id.as_deref())
        .bind(filter.name.as_deref())
        .bind(filter.kind.map(JobKind::as_str))
        .bind(filter.status.map(JobStatus::as_str))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn cancel_job(&self, job_id: &str, cancelled_by: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'CANCELLED', deleted_time = NOW(), deleted_user = $2
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(job_id)
        .bind(cancelled_by)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::debug!(job_id = %job_id, cancelled_by = %cancelled_by, "Cancelled job");
        }

        Ok(())
    }
}
