// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock job dispatcher for testing.
//!
//! Records every accepted job in memory and supports the same filtering and
//! cancellation semantics as the real dispatcher, without executing
//! anything.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Job, JobDispatcher, JobFilter, JobRequest, JobStatus};
use crate::error::Result;

/// In-memory dispatcher fake.
#[derive(Debug, Default)]
pub struct MockDispatcher {
    jobs: Mutex<Vec<Job>>,
}

impl MockDispatcher {
    /// Create an empty mock dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job ever accepted, in acceptance order.
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.jobs.lock().await.clone()
    }

    /// Flip a job's status directly (simulates a worker picking it up).
    pub async fn set_status(&self, job_id: &str, status: JobStatus) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) {
            job.status = status;
        }
    }
}

#[async_trait]
impl JobDispatcher for MockDispatcher {
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
            priority: request.priority,
            metadata: request.metadata,
            created_at: Utc::now(),
            deleted_time: None,
            deleted_user: None,
        };
        self.jobs.lock().await.push(job.clone());
        Ok(job)
    }

    async fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .iter()
            .filter(|j| {
                filter.owner_id.as_deref().is_none_or(|o| j.owner_id == o)
                    && filter.name.as_deref().is_none_or(|n| j.name == n)
                    && filter.kind.is_none_or(|k| j.kind == k)
                    && filter.status.is_none_or(|s| j.status == s)
            })
            .cloned()
            .collect())
    }

    async fn cancel_job(&self, job_id: &str, cancelled_by: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Pending)
        {
            job.status = JobStatus::Cancelled;
            job.deleted_time = Some(Utc::now());
            job.deleted_user = Some(cancelled_by.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JobKind;

    #[tokio::test]
    async fn test_create_assigns_id_and_pending() {
        let dispatcher = MockDispatcher::new();
        let job = dispatcher
            .create_job(JobRequest::for_instance("u1", JobKind::Create, "i-1"))
            .await
            .unwrap();
        assert!(!job.id.is_empty());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 8);
    }

    #[tokio::test]
    async fn test_filtering() {
        let dispatcher = MockDispatcher::new();
        dispatcher
            .create_job(JobRequest::for_instance("u1", JobKind::Start, "i-1"))
            .await
            .unwrap();
        dispatcher
            .create_job(JobRequest::for_instance("u2", JobKind::Stop, "i-2"))
            .await
            .unwrap();

        let filter = JobFilter {
            owner_id: Some("u1".into()),
            ..JobFilter::default()
        };
        let jobs = dispatcher.get_jobs(&filter).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, JobKind::Start);
    }

    #[tokio::test]
    async fn test_cancel_only_touches_pending() {
        let dispatcher = MockDispatcher::new();
        let job = dispatcher
            .create_job(JobRequest::for_instance("u1", JobKind::Stop, "i-1"))
            .await
            .unwrap();

        dispatcher.set_status(&job.id, JobStatus::Running).await;
        dispatcher.cancel_job(&job.id, "u1").await.unwrap();
        let jobs = dispatcher.all_jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Running);
        assert!(jobs[0].deleted_time.is_none());

        dispatcher.set_status(&job.id, JobStatus::Pending).await;
        dispatcher.cancel_job(&job.id, "u1").await.unwrap();
        let jobs = dispatcher.all_jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Cancelled);
        assert_eq!(jobs[0].deleted_user.as_deref(), Some("u1"));
        assert!(jobs[0].deleted_time.is_some());
    }
}
