// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-user quota ceilings and the flavor catalog.
//!
//! Quotas and flavors live in an external configuration service. The portal
//! consumes them read-only through [`ConfigStore`]; the static
//! implementation here backs single-node deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Flavor, QuotaCeilings, UserQuota};

/// Read-only source of quota ceilings and flavors.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Quota assigned to `user_id`, falling back to the deployment default.
    async fn user_quota(&self, user_id: &str) -> Result<UserQuota>;

    /// Full flavor catalog, before any per-user allow-list filtering.
    async fn flavor_catalog(&self) -> Result<Vec<Flavor>>;
}

/// In-process config store with a default quota and per-user overrides.
pub struct StaticConfigStore {
    default_quota: UserQuota,
    overrides: HashMap<String, UserQuota>,
    catalog: Vec<Flavor>,
}

impl StaticConfigStore {
    /// Create a store with the given default quota and catalog.
    pub fn new(default_quota: UserQuota, catalog: Vec<Flavor>) -> Self {
        Self {
            default_quota,
            overrides: HashMap::new(),
            catalog,
        }
    }

    /// Store with deployment defaults: 8 cores, 32 GB memory, 100 GB disk,
    /// 3 instances, and a small/large flavor pair open to everyone.
    pub fn with_defaults() -> Self {
        const GB: u64 = 1024 * 1024 * 1024;
        let flavors = vec![
            Flavor {
                name: "small".to_string(),
                cpu_limit: 2,
                memory_limit_bytes: 8 * GB,
                disk_limit_bytes: 20 * GB,
            },
            Flavor {
                name: "large".to_string(),
                cpu_limit: 8,
                memory_limit_bytes: 32 * GB,
                disk_limit_bytes: 100 * GB,
            },
        ];
        Self::new(
            UserQuota {
                ceilings: QuotaCeilings {
                    max_cpu_cores: 8,
                    max_memory_bytes: 32 * GB,
                    max_disk_bytes: 100 * GB,
                    max_instances: 3,
                },
                flavor_allow_list: vec!["small".to_string(), "large".to_string()],
            },
            flavors,
        )
    }

    /// Override the quota for a single user.
    pub fn set_user_quota(&mut self, user_id: impl Into<String>, quota: UserQuota) {
        self.overrides.insert(user_id.into(), quota);
    }
}

#[async_trait]
impl ConfigStore for StaticConfigStore {
    async fn user_quota(&self, user_id: &str) -> Result<UserQuota> {
        Ok(self
            .overrides
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| self.default_quota.clone()))
    }

    async fn flavor_catalog(&self) -> Result<Vec<Flavor>> {
        Ok(self.catalog.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overrides_take_precedence_over_the_default() {
        let mut store = StaticConfigStore::with_defaults();
        let mut tight = store.user_quota("anyone").await.unwrap();
        tight.ceilings.max_instances = 1;
        store.set_user_quota("restricted", tight);

        assert_eq!(
            store.user_quota("restricted").await.unwrap().ceilings.max_instances,
            1
        );
        assert_eq!(store.user_quota("other").await.unwrap().ceilings.max_instances, 3);
    }
}
