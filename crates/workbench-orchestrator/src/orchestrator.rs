// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle orchestration.
//!
//! [`InstanceOrchestrator`] is the single entry point for everything the
//! portal does to an instance: create, start/stop, restart, edit, extend,
//! delete, list, and endpoint lookup. Every operation follows the same
//! shape: validate, write the authoritative record through the registry,
//! then enqueue the matching job for the external dispatcher. Reads never
//! mutate; expiry enforcement lives in the [`crate::reconciler`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config_store::ConfigStore;
use crate::dispatch::{JobDispatcher, JobExecutor, JobFilter, JobKind, JobRequest, JobStatus};
use crate::error::{Error, Result};
use crate::lifespan;
use crate::model::{
    Actor, AppType, Endpoint, Flavor, FlavorView, Instance, InstanceKind, InstanceStatus,
    LifeAudit, StartStopAction, UsageGauges, UserQuota, config_keys,
};
use crate::ports::{self, PortRange};
use crate::quota;
use crate::registry::{InstanceRegistry, InstanceUpdate};
use crate::tokens::TokenIssuer;
use crate::units;
use crate::usage::UsageSampler;

/// Default CPU core limit for new instances.
const DEFAULT_CPU_LIMIT: u64 = 4;
/// Default memory limit for new instances.
const DEFAULT_MEMORY_LIMIT: &str = "16GB";
/// Default disk allocation for new instances.
const DEFAULT_DISK_LIMIT: &str = "20GB";

/// Request to provision a new instance.
#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    /// Owning user id.
    pub user_id: String,
    /// Login name provisioned inside the instance.
    pub username: String,
    /// Display name.
    pub name: String,
    /// Container or virtual machine.
    pub kind: InstanceKind,
    /// Workspace application.
    pub app_type: AppType,
    /// Lifespan budget in milliseconds.
    pub life_span_ms: i64,
    /// CPU core limit; defaults to 4.
    pub cpu_limit: Option<u64>,
    /// Memory limit such as `16GB`; defaults to 16GB.
    pub memory_limit: Option<String>,
    /// Disk allocation such as `20GB`; defaults to 20GB.
    pub disk_limit: Option<String>,
}

/// Partial edit applied to an existing instance.
#[derive(Debug, Clone, Default)]
pub struct EditInstanceRequest {
    /// New display name.
    pub new_name: Option<String>,
    /// New CPU core limit.
    pub cpu_limit: Option<u64>,
    /// New memory limit such as `8GB`.
    pub memory_limit: Option<String>,
}

/// A user's quota alongside the flavors they may request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaAndFlavors {
    /// Quota ceilings and allow-list.
    pub quota: UserQuota,
    /// Flavors visible to the caller, display-formatted.
    pub flavors: Vec<FlavorView>,
}

/// Coordinates the registry, dispatcher, token issuer and config store.
pub struct InstanceOrchestrator {
    registry: Arc<dyn InstanceRegistry>,
    dispatcher: Arc<dyn JobDispatcher>,
    tokens: Arc<dyn TokenIssuer>,
    config_store: Arc<dyn ConfigStore>,
    sampler: UsageSampler,
    port_range: PortRange,
    project: String,
}

impl InstanceOrchestrator {
    /// Wire up an orchestrator over its four collaborators.
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        dispatcher: Arc<dyn JobDispatcher>,
        tokens: Arc<dyn TokenIssuer>,
        config_store: Arc<dyn ConfigStore>,
        port_range: PortRange,
        project: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            tokens,
            config_store,
            sampler: UsageSampler::new(),
            port_range: port_range.normalized(),
            project: project.into(),
        }
    }

    /// Provision a new instance: mint tokens, reserve a host port, persist
    /// the record and enqueue the CREATE job.
    ///
    /// Port reservation is optimistic: the registry enforces uniqueness on
    /// insert, and on a collision the next candidate in the range is tried,
    /// at most once per port in the range.
    pub async fn create_instance(&self, request: CreateInstanceRequest) -> Result<Instance> {
        let cpu_limit = request.cpu_limit.unwrap_or(DEFAULT_CPU_LIMIT);
        let memory_limit = request
            .memory_limit
            .clone()
            .unwrap_or_else(|| DEFAULT_MEMORY_LIMIT.to_string());
        let disk_limit = request
            .disk_limit
            .clone()
            .unwrap_or_else(|| DEFAULT_DISK_LIMIT.to_string());

        // Reject malformed sizes before anything is persisted.
        units::parse_memory(&memory_limit)?;
        units::parse_memory(&disk_limit)?;
        if request.life_span_ms <= 0 {
            return Err(Error::MalformedInput(
                "lifeSpan must be positive".to_string(),
            ));
        }

        let quota = self.config_store.user_quota(&request.user_id).await?;

        let instance_token = self
            .tokens
            .issue_system_token(&request.user_id, None)
            .await?;
        let web_dav_token = self
            .tokens
            .issue_system_token(&request.user_id, Some(request.life_span_ms))
            .await?;

        let mut config = BTreeMap::new();
        config.insert(config_keys::CPU_LIMIT.to_string(), cpu_limit.to_string());
        config.insert(config_keys::MEMORY_LIMIT.to_string(), memory_limit);
        config.insert(config_keys::USER_DISK.to_string(), disk_limit);
        config.insert(
            config_keys::USER_USERNAME.to_string(),
            request.username.clone(),
        );
        config.insert(
            config_keys::USER_DATA.to_string(),
            cloud_init_user_data(&request.username, &instance_token.access_token),
        );

        let now = Utc::now();
        let mut port = ports::next_port(&self.registry.live_ports().await?, self.port_range);

        let mut instance = Instance {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            user_id: request.user_id.clone(),
            username: request.username,
            status: InstanceStatus::Pending,
            kind: request.kind,
            app_type: request.app_type,
            create_at: now,
            life_span_ms: request.life_span_ms,
            instance_token: instance_token.access_token,
            web_dav_token: web_dav_token.access_token,
            project: self.project.clone(),
            config,
            host_map_port: port,
            metadata: UsageGauges::default(),
            lxd_state: None,
            life: LifeAudit {
                created_time: now,
                created_user: request.user_id.clone(),
                deleted_time: None,
                deleted_user: None,
            },
        };

        let mut attempts = self.port_range.span();
        let inserted = loop {
            instance.host_map_port = port;
            match self.registry.insert(instance.clone(), &quota.ceilings).await {
                Ok(inserted) => break inserted,
                Err(Error::PortConflict(conflicting)) => {
                    attempts = attempts.saturating_sub(1);
                    if attempts == 0 {
                        return Err(Error::PortConflict(conflicting));
                    }
                    port = self.port_range.next_after(port);
                }
                Err(e) => return Err(e),
            }
        };

        let job = JobRequest::for_instance(&inserted.user_id, JobKind::Create, &inserted.id)
            .with_metadata(serde_json::json!({
                crate::dispatch::METADATA_INSTANCE_ID: inserted.id,
                "imageAlias": inserted.app_type.image_alias(),
                "internalPort": inserted.app_type.internal_port(),
                "hostMapPort": inserted.host_map_port,
            }));
        self.dispatcher.create_job(job).await?;

        tracing::info!(
            instance_id = %inserted.id,
            user_id = %inserted.user_id,
            host_map_port = inserted.host_map_port,
            "Created instance"
        );
        Ok(inserted)
    }

    /// Start or stop an instance, moving it into the matching transitional
    /// status before the job is enqueued.
    pub async fn start_stop_instance(
        &self,
        user_id: &str,
        id: &str,
        action: StartStopAction,
    ) -> Result<Instance> {
        let (target, job_kind) = match action {
            StartStopAction::Start => (InstanceStatus::Starting, JobKind::Start),
            StartStopAction::Stop => (InstanceStatus::Stopping, JobKind::Stop),
        };

        let updated = self
            .registry
            .transition_status(Some(user_id), id, &[], target)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;

        self.dispatcher
            .create_job(JobRequest::for_instance(user_id, job_kind, id))
            .await?;

        tracing::info!(instance_id = %id, status = target.as_str(), "Requested status change");
        Ok(updated)
    }

    /// Restart an instance with a fresh lifespan budget. The creation clock
    /// resets to now, so the new budget counts from this moment.
    pub async fn restart_instance(
        &self,
        user_id: &str,
        id: &str,
        life_span_ms: i64,
    ) -> Result<Instance> {
        if life_span_ms <= 0 {
            return Err(Error::MalformedInput(
                "lifeSpan must be positive".to_string(),
            ));
        }
        let updated = self
            .registry
            .reset_for_restart(user_id, id, life_span_ms, Utc::now())
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;

        self.dispatcher
            .create_job(JobRequest::for_instance(user_id, JobKind::Start, id))
            .await?;
        Ok(updated)
    }

    /// Delete an instance: soft-delete the record, enqueue a DELETE job and
    /// withdraw every still-pending job that targets the instance.
    pub async fn delete_instance(&self, user_id: &str, id: &str) -> Result<Instance> {
        let deleted = self
            .registry
            .mark_deleted(user_id, id, Utc::now())
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;

        let delete_job = self
            .dispatcher
            .create_job(JobRequest::for_instance(user_id, JobKind::Delete, id))
            .await?;

        let pending = self
            .dispatcher
            .get_jobs(&JobFilter {
                owner_id: Some(user_id.to_string()),
                status: Some(JobStatus::Pending),
                ..JobFilter::default()
            })
            .await?;
        for job in pending {
            if job.id != delete_job.id && job.references_instance(id) {
                self.dispatcher.cancel_job(&job.id, user_id).await?;
            }
        }

        self.sampler.forget(id);
        tracing::info!(instance_id = %id, user_id = %user_id, "Deleted instance");
        Ok(deleted)
    }

    /// Edit an instance selected by id or by name.
    ///
    /// Admins may edit any instance; regular users only their own. At least
    /// one selector must be given.
    pub async fn edit_instance(
        &self,
        actor: &Actor,
        id: Option<&str>,
        name: Option<&str>,
        edit: EditInstanceRequest,
    ) -> Result<Instance> {
        let instance = match (id, name) {
            (Some(id), _) => self.registry.get(id).await?.filter(|i| i.status.is_live()),
            (None, Some(name)) => {
                let scope = (!actor.is_admin).then_some(actor.user_id.as_str());
                self.registry.find_by_name(scope, name).await?
            }
            (None, None) => {
                return Err(Error::MalformedInput(
                    "either an instance id or a name is required".to_string(),
                ));
            }
        }
        .ok_or_else(|| Error::NotFound("instance".to_string()))?;

        if !actor.is_admin && instance.user_id != actor.user_id {
            return Err(Error::PermissionDenied(format!(
                "instance {} is not owned by {}",
                instance.id, actor.user_id
            )));
        }

        let mut update = InstanceUpdate {
            name: edit.new_name,
            config: None,
        };
        if edit.cpu_limit.is_some() || edit.memory_limit.is_some() {
            let mut config = instance.config.clone();
            if let Some(cpu) = edit.cpu_limit {
                config.insert(config_keys::CPU_LIMIT.to_string(), cpu.to_string());
            }
            if let Some(memory) = edit.memory_limit {
                units::parse_memory(&memory)?;
                config.insert(config_keys::MEMORY_LIMIT.to_string(), memory);
            }
            update.config = Some(config);
        }

        if update.is_empty() {
            return Ok(instance);
        }

        let updated = self
            .registry
            .apply_update(&instance.id, update)
            .await?
            .ok_or_else(|| Error::Upstream(format!("instance {} vanished mid-edit", instance.id)))?;

        self.dispatcher
            .create_job(JobRequest::for_instance(
                &updated.user_id,
                JobKind::Update,
                &updated.id,
            ))
            .await?;
        Ok(updated)
    }

    /// Extend the lifespan of an owned instance by `additional_ms`.
    ///
    /// Refused when more than the runway cap already remains.
    pub async fn extend_lifespan(
        &self,
        user_id: &str,
        id: &str,
        additional_ms: i64,
    ) -> Result<Instance> {
        if additional_ms <= 0 {
            return Err(Error::MalformedInput(
                "extension must be positive".to_string(),
            ));
        }
        let instance = self
            .registry
            .get(id)
            .await?
            .filter(|i| i.status.is_live())
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;

        lifespan::validate_extension(&instance, user_id, Utc::now())?;

        let extended = instance
            .life_span_ms
            .checked_add(additional_ms)
            .ok_or_else(|| {
                Error::MalformedInput("extension overflows the lifespan".to_string())
            })?;
        self.registry
            .set_life_span(id, extended)
            .await?
            .ok_or_else(|| Error::Upstream(format!("instance {id} vanished mid-extension")))
    }

    /// List a user's live instances with computed usage gauges and the
    /// remaining (not the configured) lifespan. Pure read.
    pub async fn get_instances(&self, user_id: &str) -> Result<Vec<Instance>> {
        let now = Utc::now();
        let mut instances = self.registry.list_live_for_user(user_id).await?;
        for instance in &mut instances {
            instance.metadata = self.sampler.sample(instance, now);
            instance.life_span_ms = lifespan::remaining_ms(instance, now);
        }
        Ok(instances)
    }

    /// Resolve the connection endpoint of a running instance.
    ///
    /// Returns `None` when the address is not known yet; in that case a
    /// state-refresh job is ensured for the owner so a later call can
    /// succeed.
    pub async fn get_container_ip(&self, user_id: &str, id: &str) -> Result<Option<Endpoint>> {
        let instance = self
            .registry
            .get_owned(user_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;

        if instance.status == InstanceStatus::Running
            && let Some(ip) = instance.lxd_state.as_ref().and_then(|s| s.primary_ip())
        {
            return Ok(Some(Endpoint {
                ip: ip.to_string(),
                port: instance.host_map_port,
            }));
        }

        // Address unknown: make sure one state refresh is queued for the
        // owner, without piling up duplicates.
        let pending = self
            .dispatcher
            .get_jobs(&JobFilter {
                owner_id: Some(user_id.to_string()),
                kind: Some(JobKind::State),
                status: Some(JobStatus::Pending),
                ..JobFilter::default()
            })
            .await?;
        if pending.is_empty() {
            self.dispatcher
                .create_job(JobRequest {
                    owner_id: user_id.to_string(),
                    name: format!("state-refresh-{user_id}"),
                    kind: JobKind::State,
                    schedule_at: None,
                    period_ms: None,
                    executor: JobExecutor {
                        id: user_id.to_string(),
                        kind: "USER".to_string(),
                        path: "monitor/state".to_string(),
                    },
                    priority: JobKind::State.priority(),
                    metadata: serde_json::json!({ "userId": user_id }),
                })
                .await?;
        }
        Ok(None)
    }

    /// Check whether a prospective instance would fit within the user's
    /// quota, without reserving anything.
    pub async fn check_quota_before_creation(
        &self,
        user_id: &str,
        cpu_limit: Option<u64>,
        memory_limit: Option<&str>,
        disk_limit: Option<&str>,
    ) -> Result<()> {
        let quota = self.config_store.user_quota(user_id).await?;
        let existing = self.registry.list_live_for_user(user_id).await?;
        quota::check_quota(
            &existing,
            cpu_limit.unwrap_or(DEFAULT_CPU_LIMIT),
            memory_limit.unwrap_or(DEFAULT_MEMORY_LIMIT),
            disk_limit.unwrap_or(DEFAULT_DISK_LIMIT),
            1,
            &quota.ceilings,
        )
    }

    /// The caller's quota plus the flavors they are allowed to request.
    /// Admins see the full catalog.
    pub async fn get_quota_and_flavors(&self, actor: &Actor) -> Result<QuotaAndFlavors> {
        let quota = self.config_store.user_quota(&actor.user_id).await?;
        let catalog = self.config_store.flavor_catalog().await?;
        let flavors = catalog
            .iter()
            .filter(|f| actor.is_admin || quota.flavor_allow_list.contains(&f.name))
            .map(Flavor::to_view)
            .collect();
        Ok(QuotaAndFlavors { quota, flavors })
    }
}

/// Cloud-init document provisioning the login user and the agent token.
fn cloud_init_user_data(username: &str, instance_token: &str) -> String {
    format!(
        r#"#cloud-config
users:
  - name: {username}
    shell: /bin/bash
write_files:
  - path: /etc/workbench/agent.token
    permissions: '0600'
    content: {instance_token}
"#
    )
}
