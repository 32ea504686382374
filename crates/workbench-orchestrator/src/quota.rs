// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quota arbitration across CPU, memory, disk, and instance count.
//!
//! [`check_quota`] is a pure check over a snapshot of the user's live
//! instances. On its own it is advisory (`check_quota_before_creation`);
//! the registry re-runs the same check inside its insert transaction, under
//! a per-user lock, so two concurrent creates cannot both pass and overrun
//! a ceiling.

use crate::error::{Error, ResourceKind, Result};
use crate::model::{Instance, QuotaCeilings, config_keys};
use crate::units;

/// Aggregate resource consumption of a set of instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Summed CPU core limits.
    pub cpu_cores: u64,
    /// Summed memory limits in bytes.
    pub memory_bytes: u64,
    /// Summed disk sizes in bytes.
    pub disk_bytes: u64,
    /// Number of instances.
    pub count: usize,
}

/// Sum the configured limits of the given instances.
///
/// Missing config keys contribute nothing; a present but unparseable
/// memory/disk string is an error rather than a silent zero.
pub fn sum_usage(instances: &[Instance]) -> Result<ResourceUsage> {
    let mut usage = ResourceUsage {
        count: instances.len(),
        ..ResourceUsage::default()
    };
    for instance in instances {
        if let Some(cpu) = instance.config.get(config_keys::CPU_LIMIT) {
            usage.cpu_cores += cpu.parse::<u64>().map_err(|_| {
                Error::MalformedInput(format!(
                    "instance {} has non-numeric {}: {cpu:?}",
                    instance.id,
                    config_keys::CPU_LIMIT
                ))
            })?;
        }
        if let Some(mem) = instance.config.get(config_keys::MEMORY_LIMIT) {
            usage.memory_bytes += units::parse_memory(mem)?;
        }
        if let Some(disk) = instance.config.get(config_keys::USER_DISK) {
            usage.disk_bytes += units::parse_memory(disk)?;
        }
    }
    Ok(usage)
}

/// Validate a requested instance against the user's quota ceilings.
///
/// `existing` must be the user's live (non-DELETED) instances. Equality to
/// a ceiling is allowed; only strictly-greater fails, tagged with the first
/// exceeded dimension in CPU, MEMORY, DISK, COUNT order.
pub fn check_quota(
    existing: &[Instance],
    requested_cpu: u64,
    requested_memory: &str,
    requested_disk: &str,
    requested_count: usize,
    ceilings: &QuotaCeilings,
) -> Result<()> {
    let usage = sum_usage(existing)?;
    let requested_memory_bytes = units::parse_memory(requested_memory)?;
    let requested_disk_bytes = units::parse_memory(requested_disk)?;

    if usage.cpu_cores + requested_cpu > ceilings.max_cpu_cores {
        return Err(Error::QuotaExceeded(ResourceKind::Cpu));
    }
    if usage.memory_bytes + requested_memory_bytes > ceilings.max_memory_bytes {
        return Err(Error::QuotaExceeded(ResourceKind::Memory));
    }
    if usage.disk_bytes + requested_disk_bytes > ceilings.max_disk_bytes {
        return Err(Error::QuotaExceeded(ResourceKind::Disk));
    }
    if usage.count + requested_count > ceilings.max_instances {
        return Err(Error::QuotaExceeded(ResourceKind::InstanceCount));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AppType, InstanceKind, InstanceStatus, LifeAudit, UsageGauges,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn instance_with(cpu: &str, memory: &str, disk: &str) -> Instance {
        let mut config = BTreeMap::new();
        config.insert(config_keys::CPU_LIMIT.to_string(), cpu.to_string());
        config.insert(config_keys::MEMORY_LIMIT.to_string(), memory.to_string());
        config.insert(config_keys::USER_DISK.to_string(), disk.to_string());
        Instance {
            id: uuid::Uuid::new_v4().to_string(),
            name: "nb".into(),
            user_id: "u1".into(),
            username: "alice".into(),
            status: InstanceStatus::Running,
            kind: InstanceKind::Container,
            app_type: AppType::Jupyter,
            create_at: Utc::now(),
            life_span_ms: 3_600_000,
            instance_token: String::new(),
            web_dav_token: String::new(),
            project: "workbench".into(),
            config,
            host_map_port: 30000,
            metadata: UsageGauges::default(),
            lxd_state: None,
            life: LifeAudit {
                created_time: Utc::now(),
                created_user: "u1".into(),
                deleted_time: None,
                deleted_user: None,
            },
        }
    }

    fn ceilings() -> QuotaCeilings {
        QuotaCeilings {
            max_cpu_cores: 4,
            max_memory_bytes: units::parse_memory("32GB").unwrap(),
            max_disk_bytes: units::parse_memory("100GB").unwrap(),
            max_instances: 3,
        }
    }

    #[test]
    fn test_equality_to_ceiling_passes() {
        let existing = vec![instance_with("2", "8GB", "20GB")];
        // 2 + 2 == 4 cores: allowed.
        assert!(check_quota(&existing, 2, "8GB", "20GB", 1, &ceilings()).is_ok());
    }

    #[test]
    fn test_cpu_over_ceiling_fails() {
        let existing = vec![instance_with("2", "8GB", "20GB")];
        let err = check_quota(&existing, 3, "8GB", "20GB", 1, &ceilings()).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(ResourceKind::Cpu)));
    }

    #[test]
    fn test_memory_over_ceiling_fails() {
        let existing = vec![instance_with("1", "16GB", "20GB")];
        let err = check_quota(&existing, 1, "17GB", "20GB", 1, &ceilings()).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(ResourceKind::Memory)));
    }

    #[test]
    fn test_disk_over_ceiling_fails() {
        let existing = vec![instance_with("1", "8GB", "90GB")];
        let err = check_quota(&existing, 1, "8GB", "11GB", 1, &ceilings()).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(ResourceKind::Disk)));
    }

    #[test]
    fn test_count_over_ceiling_fails() {
        let existing = vec![
            instance_with("1", "1GB", "10GB"),
            instance_with("1", "1GB", "10GB"),
            instance_with("1", "1GB", "10GB"),
        ];
        let err = check_quota(&existing, 1, "1GB", "10GB", 1, &ceilings()).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(ResourceKind::InstanceCount)));
    }

    #[test]
    fn test_missing_config_keys_count_as_zero() {
        let mut bare = instance_with("1", "1GB", "10GB");
        bare.config.clear();
        assert_eq!(sum_usage(&[bare]).unwrap().cpu_cores, 0);
    }

    #[test]
    fn test_unparseable_stored_limit_is_an_error() {
        let broken = instance_with("1", "lots", "10GB");
        assert!(matches!(
            sum_usage(&[broken]),
            Err(Error::MalformedInput(_))
        ));
    }
}
