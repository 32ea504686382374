// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance data model and wire contract.
//!
//! The serialized shape of [`Instance`] is the contract between this core,
//! the registry, and the job dispatcher: camelCase field names, SCREAMING
//! status values, millisecond-epoch timestamps, and the dotted keys inside
//! the `config` map must not change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dotted keys used inside an instance's `config` map.
pub mod config_keys {
    /// CPU core limit, stored as a decimal string (e.g. `"4"`).
    pub const CPU_LIMIT: &str = "limits.cpu";
    /// Memory limit as a human memory string (e.g. `"16GB"`).
    pub const MEMORY_LIMIT: &str = "limits.memory";
    /// Root disk size as a human memory string (e.g. `"20GB"`).
    pub const USER_DISK: &str = "user.disk";
    /// Username provisioned inside the instance.
    pub const USER_USERNAME: &str = "user.username";
    /// Opaque cloud-init payload handed to the provisioner.
    pub const USER_DATA: &str = "user.user-data";
}

/// Lifecycle status of an instance.
///
/// DELETED is terminal; records are never physically removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Persisted, CREATE job not yet acknowledged by the provisioner.
    Pending,
    /// Start requested, not yet confirmed running.
    Starting,
    /// Confirmed running by the provisioner.
    Running,
    /// Stop requested, not yet confirmed stopped.
    Stopping,
    /// Confirmed stopped.
    Stopped,
    /// Provisioning or a later transition failed.
    Failed,
    /// Soft-deleted with an audit stamp. Terminal.
    Deleted,
}

impl InstanceStatus {
    /// Wire string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "PENDING",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Running => "RUNNING",
            InstanceStatus::Stopping => "STOPPING",
            InstanceStatus::Stopped => "STOPPED",
            InstanceStatus::Failed => "FAILED",
            InstanceStatus::Deleted => "DELETED",
        }
    }

    /// Parse a wire status string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(InstanceStatus::Pending),
            "STARTING" => Some(InstanceStatus::Starting),
            "RUNNING" => Some(InstanceStatus::Running),
            "STOPPING" => Some(InstanceStatus::Stopping),
            "STOPPED" => Some(InstanceStatus::Stopped),
            "FAILED" => Some(InstanceStatus::Failed),
            "DELETED" => Some(InstanceStatus::Deleted),
            _ => None,
        }
    }

    /// Whether the instance still counts against ports and quotas.
    pub fn is_live(&self) -> bool {
        !matches!(self, InstanceStatus::Deleted)
    }
}

/// Virtualization flavor of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceKind {
    /// LXD system container.
    Container,
    /// Full virtual machine.
    VirtualMachine,
}

/// Application preinstalled in the workspace image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppType {
    /// JupyterLab workspace.
    Jupyter,
    /// MATLAB workspace.
    Matlab,
}

impl AppType {
    /// Image alias the provisioner resolves for this application.
    pub fn image_alias(&self) -> &'static str {
        match self {
            AppType::Jupyter => "workbench-jupyter",
            AppType::Matlab => "workbench-matlab",
        }
    }

    /// Internal service port the host port is proxied to.
    pub fn internal_port(&self) -> u16 {
        match self {
            AppType::Jupyter => 8888,
            AppType::Matlab => 9988,
        }
    }
}

/// Computed usage gauges, 0-100. Transient: recomputed on every read,
/// never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageGauges {
    /// CPU usage percentage over the last sampling interval.
    pub cpu_usage: f64,
    /// Memory usage percentage of the configured limit.
    pub memory_usage: f64,
}

/// Cumulative CPU counter reported by the container engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CpuState {
    /// Cumulative CPU time in nanoseconds.
    pub usage: u64,
}

/// Memory counter reported by the container engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryState {
    /// Current memory usage in bytes.
    pub usage: u64,
}

/// One address on an instance's network interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceAddress {
    /// Address family (`inet`, `inet6`).
    pub family: String,
    /// The address itself.
    pub address: String,
}

/// Runtime state snapshot written by the job dispatcher side.
///
/// Read-only inside this core; the STATE monitor job refreshes it
/// out-of-band.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LxdState {
    /// Cumulative CPU counter.
    pub cpu: CpuState,
    /// Memory counter.
    pub memory: MemoryState,
    /// Known addresses, first usable one wins.
    #[serde(default)]
    pub network: Vec<InstanceAddress>,
}

impl LxdState {
    /// First IPv4 address, if any.
    pub fn primary_ip(&self) -> Option<&str> {
        self.network
            .iter()
            .find(|a| a.family == "inet")
            .map(|a| a.address.as_str())
    }
}

/// Audit block stamped at creation and soft-deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifeAudit {
    /// When the record was created.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_time: DateTime<Utc>,
    /// Who created the record.
    pub created_user: String,
    /// When the record was soft-deleted.
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub deleted_time: Option<DateTime<Utc>>,
    /// Who soft-deleted the record.
    #[serde(default)]
    pub deleted_user: Option<String>,
}

/// A provisioned ephemeral compute workspace bound to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Opaque unique identifier (uuid v4).
    pub id: String,
    /// Human-readable name, unique per owner.
    pub name: String,
    /// Owning user id.
    pub user_id: String,
    /// Owning username, also provisioned inside the workspace.
    pub username: String,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Container or virtual machine.
    #[serde(rename = "type")]
    pub kind: InstanceKind,
    /// Workspace application.
    pub app_type: AppType,
    /// Creation/reset timestamp the lifespan budget is measured from.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub create_at: DateTime<Utc>,
    /// Remaining time budget in milliseconds, measured from `create_at`.
    #[serde(rename = "lifeSpan")]
    pub life_span_ms: i64,
    /// Opaque credential minted by the token issuer, passed through.
    pub instance_token: String,
    /// Opaque WebDAV credential, passed through.
    pub web_dav_token: String,
    /// Infrastructure project/namespace name.
    pub project: String,
    /// String-keyed configuration map; see [`config_keys`].
    pub config: BTreeMap<String, String>,
    /// Externally reachable port mapped to the workspace's service port.
    /// Unique among live instances, reserved atomically at insert.
    pub host_map_port: u16,
    /// Computed usage gauges, transient.
    #[serde(default)]
    pub metadata: UsageGauges,
    /// Runtime snapshot from the dispatcher side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lxd_state: Option<LxdState>,
    /// Creation/deletion audit block.
    pub life: LifeAudit,
}

impl Instance {
    /// CPU core limit from the config map. Falls back to 1 core when the
    /// key is absent or unparseable, matching the sampler's default.
    pub fn cpu_limit_cores(&self) -> u64 {
        self.config
            .get(config_keys::CPU_LIMIT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    /// Memory limit in bytes from the config map, if parseable.
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.config
            .get(config_keys::MEMORY_LIMIT)
            .and_then(|v| crate::units::parse_memory(v).ok())
    }

    /// Disk size in bytes from the config map, if parseable.
    pub fn disk_bytes(&self) -> Option<u64> {
        self.config
            .get(config_keys::USER_DISK)
            .and_then(|v| crate::units::parse_memory(v).ok())
    }
}

/// Per-user ceilings across all of that user's live instances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCeilings {
    /// Maximum aggregate CPU cores.
    pub max_cpu_cores: u64,
    /// Maximum aggregate memory in bytes.
    pub max_memory_bytes: u64,
    /// Maximum aggregate disk in bytes.
    pub max_disk_bytes: u64,
    /// Maximum number of live instances.
    pub max_instances: usize,
}

/// A user's quota: ceilings plus the flavor allow-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuota {
    /// Resource ceilings.
    pub ceilings: QuotaCeilings,
    /// Flavor names this user may request.
    pub flavor_allow_list: Vec<String>,
}

/// A named preset bundling CPU/memory/disk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flavor {
    /// Preset name (e.g. `small`).
    pub name: String,
    /// CPU core limit.
    pub cpu_limit: u64,
    /// Memory limit in bytes.
    pub memory_limit_bytes: u64,
    /// Disk size in bytes.
    pub disk_limit_bytes: u64,
}

/// A flavor annotated with human-readable memory/disk strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavorView {
    /// Preset name.
    pub name: String,
    /// CPU core limit.
    pub cpu_limit: u64,
    /// Memory limit as a human string (e.g. `"16GB"`).
    pub memory: String,
    /// Disk size as a human string.
    pub disk: String,
}

impl Flavor {
    /// Annotate with human-readable strings.
    pub fn to_view(&self) -> FlavorView {
        FlavorView {
            name: self.name.clone(),
            cpu_limit: self.cpu_limit,
            memory: crate::units::format_memory(self.memory_limit_bytes),
            disk: crate::units::format_memory(self.disk_limit_bytes),
        }
    }
}

/// An authenticated caller of the orchestrator.
#[derive(Debug, Clone)]
pub struct Actor {
    /// User id of the caller.
    pub user_id: String,
    /// Whether the caller holds the admin role.
    pub is_admin: bool,
}

/// Start or stop request for `start_stop_instance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartStopAction {
    /// Request the instance to start.
    Start,
    /// Request the instance to stop.
    Stop,
}

/// Externally reachable address of a running workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Instance IP from the runtime snapshot.
    pub ip: String,
    /// Host-mapped port.
    pub port: u16,
}
