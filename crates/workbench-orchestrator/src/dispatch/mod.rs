// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job dispatcher collaborator interface.
//!
//! The actual infrastructure mutations (create/start/stop/delete a
//! container, read its live state) happen out-of-band in an external
//! dispatcher/worker. This core only enqueues work through the narrow
//! [`JobDispatcher`] trait and never waits for job completion; enqueueing
//! is the single suspension point of every orchestrator operation.

mod mock;
mod postgres;

pub use mock::MockDispatcher;
pub use postgres::PgJobQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata key carrying the target instance id.
pub const METADATA_INSTANCE_ID: &str = "instanceId";

/// Kind of work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Provision a new instance.
    Create,
    /// Start a stopped instance.
    Start,
    /// Stop a running instance.
    Stop,
    /// Tear down an instance.
    Delete,
    /// Apply configuration changes to an instance.
    Update,
    /// Periodic runtime-state refresh for a user's instances.
    State,
    /// Periodic deletion sync for a user's instances.
    SyncDeletion,
}

impl JobKind {
    /// Dispatch priority, 0-10; DELETE outranks everything.
    pub fn priority(self) -> u8 {
        match self {
            JobKind::Create => 8,
            JobKind::Start | JobKind::Stop => 5,
            JobKind::Delete => 10,
            JobKind::Update => 2,
            JobKind::State | JobKind::SyncDeletion => 1,
        }
    }

    /// Wire string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Create => "CREATE",
            JobKind::Start => "START",
            JobKind::Stop => "STOP",
            JobKind::Delete => "DELETE",
            JobKind::Update => "UPDATE",
            JobKind::State => "STATE",
            JobKind::SyncDeletion => "SYNC_DELETION",
        }
    }
}

/// Status of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Picked up by a worker.
    Running,
    /// Completed successfully.
    Finished,
    /// Completed with an error.
    Failed,
    /// Withdrawn before a worker picked it up.
    Cancelled,
}

impl JobStatus {
    /// Wire string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

/// What the job acts on, as understood by the dispatcher workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutor {
    /// Target entity id (instance id for instance jobs, user id for monitors).
    pub id: String,
    /// Target entity type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Worker operation path (e.g. `instance/create`).
    pub path: String,
}

/// A job accepted by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Dispatcher-assigned job id.
    pub id: String,
    /// User on whose behalf the job runs.
    pub owner_id: String,
    /// Human-readable job name.
    pub name: String,
    /// Kind of work.
    pub kind: JobKind,
    /// Current status.
    pub status: JobStatus,
    /// Earliest execution time for scheduled jobs.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub schedule_at: Option<DateTime<Utc>>,
    /// Re-run period for periodic jobs, in milliseconds.
    #[serde(default)]
    pub period_ms: Option<i64>,
    /// Execution target.
    pub executor: JobExecutor,
    /// Dispatch priority, 0-10.
    pub priority: u8,
    /// Job payload; instance jobs carry [`METADATA_INSTANCE_ID`].
    pub metadata: serde_json::Value,
    /// When the job was accepted.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// When the job was cancelled, if it was.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub deleted_time: Option<DateTime<Utc>>,
    /// Who cancelled the job, if anyone.
    #[serde(default)]
    pub deleted_user: Option<String>,
}

impl Job {
    /// Whether this job targets the given instance, either through its
    /// metadata or its executor reference.
    pub fn references_instance(&self, instance_id: &str) -> bool {
        self.executor.id == instance_id
            || self
                .metadata
                .get(METADATA_INSTANCE_ID)
                .and_then(|v| v.as_str())
                == Some(instance_id)
    }
}

/// Request to enqueue a new job.
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// User on whose behalf the job runs.
    pub owner_id: String,
    /// Human-readable job name.
    pub name: String,
    /// Kind of work.
    pub kind: JobKind,
    /// Earliest execution time for scheduled jobs.
    pub schedule_at: Option<DateTime<Utc>>,
    /// Re-run period for periodic jobs, in milliseconds.
    pub period_ms: Option<i64>,
    /// Execution target.
    pub executor: JobExecutor,
    /// Dispatch priority, 0-10.
    pub priority: u8,
    /// Job payload.
    pub metadata: serde_json::Value,
}

impl JobRequest {
    /// One-shot job targeting a single instance, at the kind's priority.
    pub fn for_instance(owner_id: &str, kind: JobKind, instance_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            name: format!("{}-instance-{instance_id}", kind.as_str().to_lowercase()),
            kind,
            schedule_at: None,
            period_ms: None,
            executor: JobExecutor {
                id: instance_id.to_string(),
                kind: "INSTANCE".to_string(),
                path: format!("instance/{}", kind.as_str().to_lowercase()),
            },
            priority: kind.priority(),
            metadata: serde_json::json!({ METADATA_INSTANCE_ID: instance_id }),
        }
    }

    /// Periodic monitor job for a user, at priority 1.
    pub fn periodic_monitor(owner_id: &str, kind: JobKind, period_ms: i64) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            name: format!("{}-monitor-{owner_id}", kind.as_str().to_lowercase()),
            kind,
            schedule_at: None,
            period_ms: Some(period_ms),
            executor: JobExecutor {
                id: owner_id.to_string(),
                kind: "USER".to_string(),
                path: format!("monitor/{}", kind.as_str().to_lowercase()),
            },
            priority: kind.priority(),
            metadata: serde_json::json!({ "userId": owner_id }),
        }
    }

    /// Attach or replace the metadata payload.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for [`JobDispatcher::get_jobs`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Match the owning user.
    pub owner_id: Option<String>,
    /// Match the job name exactly.
    pub name: Option<String>,
    /// Match the job kind.
    pub kind: Option<JobKind>,
    /// Match the job status.
    pub status: Option<JobStatus>,
}

/// Narrow interface to the external asynchronous job dispatcher.
///
/// Implementations must make `create_job` fire-and-forget: accepting the job
/// is synchronous, executing it is not. There is no cancellation mechanism
/// other than flipping a PENDING job to CANCELLED.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Enqueue a job; returns the accepted job with its assigned id.
    async fn create_job(&self, request: JobRequest) -> Result<Job>;

    /// List jobs matching the filter.
    async fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Cancel a PENDING job, stamping who withdrew it. Cancelling a job
    /// that is no longer PENDING is a no-op.
    async fn cancel_job(&self, job_id: &str, cancelled_by: &str) -> Result<()>;
}
