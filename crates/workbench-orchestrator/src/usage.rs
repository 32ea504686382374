// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cumulative-counter-to-gauge conversion for usage metering.
//!
//! The container engine reports a cumulative CPU counter (nanoseconds) and a
//! current memory counter (bytes). The sampler turns consecutive CPU samples
//! into a percentage of the configured core limit over the sampling
//! interval, and the memory counter into a percentage of the configured
//! memory limit. Both gauges are clamped to 0-100 for arbitrary inputs,
//! including counters that go backwards after an instance restart.
//!
//! Previous-sample state is a keyed store owned by the sampler, with the
//! lifecycle of the owning process. Running more than one orchestrator
//! process against the same registry will produce inconsistent gauges until
//! this state is externalized.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::model::{Instance, InstanceStatus, UsageGauges};
use crate::units;

/// Core limit assumed when `limits.cpu` is absent or unparseable.
const DEFAULT_CPU_LIMIT_CORES: u64 = 1;

/// Memory limit assumed when `limits.memory` is absent or unparseable: 16GiB.
const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 16 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct PreviousSample {
    cpu_usage_ns: u64,
    taken_at: DateTime<Utc>,
}

/// Converts cumulative counters into clamped percentage gauges.
#[derive(Debug, Default)]
pub struct UsageSampler {
    previous: Mutex<HashMap<String, PreviousSample>>,
}

impl UsageSampler {
    /// Create a sampler with no previous-sample state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute usage gauges for one instance at time `now`.
    ///
    /// Returns zeros unless the instance is RUNNING and has a runtime
    /// snapshot. The first sample for an instance also reads as zero CPU
    /// (there is no interval to rate over yet). Updates the stored
    /// previous sample as a side effect.
    pub fn sample(&self, instance: &Instance, now: DateTime<Utc>) -> UsageGauges {
        if instance.status != InstanceStatus::Running {
            return UsageGauges::default();
        }
        let Some(state) = &instance.lxd_state else {
            return UsageGauges::default();
        };

        let cpu_limit_cores = instance.cpu_limit_cores().max(DEFAULT_CPU_LIMIT_CORES);
        let memory_limit_bytes = instance
            .memory_limit_bytes()
            .filter(|b| *b > 0)
            .unwrap_or(DEFAULT_MEMORY_LIMIT_BYTES);

        let mut previous = self.previous.lock().unwrap_or_else(|p| p.into_inner());
        let prev = previous.get(&instance.id).copied();

        let interval_sec = prev
            .map(|p| (now - p.taken_at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);
        let delta_cpu_sec = state
            .cpu
            .usage
            .saturating_sub(prev.map(|p| p.cpu_usage_ns).unwrap_or(0))
            as f64
            / 1e9;

        let cpu_usage = if interval_sec > 0.0 {
            (delta_cpu_sec / (cpu_limit_cores as f64 * interval_sec)) * 100.0
        } else {
            0.0
        };
        let memory_usage = (state.memory.usage as f64 / memory_limit_bytes as f64) * 100.0;

        previous.insert(
            instance.id.clone(),
            PreviousSample {
                cpu_usage_ns: state.cpu.usage,
                taken_at: now,
            },
        );

        UsageGauges {
            cpu_usage: cpu_usage.clamp(0.0, 100.0),
            memory_usage: memory_usage.clamp(0.0, 100.0),
        }
    }

    /// Drop the previous-sample state for an instance (on deletion).
    pub fn forget(&self, instance_id: &str) {
        let mut previous = self.previous.lock().unwrap_or_else(|p| p.into_inner());
        previous.remove(instance_id);
    }
}
