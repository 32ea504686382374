// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Time-budget (lifespan) accounting.
//!
//! An instance carries a millisecond budget measured from `create_at`. The
//! persisted budget is left untouched while the instance runs; callers see
//! the computed remainder instead. Expiry processing (the stop transition
//! plus zeroing the persisted budget) lives in the reconciler; lifespan
//! extension is surfaced through the orchestrator. Both use the checks here.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{Instance, InstanceStatus};

/// Extensions are refused while more than this much runway remains: 7 days.
pub const EXTENSION_RUNWAY_CAP_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Raw remaining budget in ms; negative once expired.
fn remaining_raw_ms(instance: &Instance, now: DateTime<Utc>) -> i64 {
    let elapsed = (now - instance.create_at).num_milliseconds();
    instance.life_span_ms - elapsed
}

/// Remaining budget in ms as exposed to callers, clamped to >= 0.
pub fn remaining_ms(instance: &Instance, now: DateTime<Utc>) -> i64 {
    remaining_raw_ms(instance, now).max(0)
}

/// Whether the budget is used up.
pub fn is_expired(instance: &Instance, now: DateTime<Utc>) -> bool {
    remaining_raw_ms(instance, now) <= 0
}

/// Whether expiry should trigger a stop transition for this status.
///
/// Instances already stopped, stopping, or failed need no further action;
/// the persisted budget is still zeroed for them.
pub fn needs_expiry_stop(status: InstanceStatus) -> bool {
    !matches!(
        status,
        InstanceStatus::Stopped | InstanceStatus::Stopping | InstanceStatus::Failed
    )
}

/// Validate a lifespan-extension request.
///
/// Owner-only: there is deliberately no admin override. Fails with
/// [`Error::EnoughRunway`] while more than [`EXTENSION_RUNWAY_CAP_MS`] of
/// budget remains.
pub fn validate_extension(
    instance: &Instance,
    requester_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    if instance.user_id != requester_id {
        return Err(Error::PermissionDenied(format!(
            "only the owner may extend instance {}",
            instance.id
        )));
    }
    let remaining = remaining_raw_ms(instance, now);
    if remaining > EXTENSION_RUNWAY_CAP_MS {
        return Err(Error::EnoughRunway(remaining));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppType, InstanceKind, LifeAudit, UsageGauges};
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn instance(life_span_ms: i64, created_ago: Duration, now: DateTime<Utc>) -> Instance {
        let create_at = now - created_ago;
        Instance {
            id: "i-life".into(),
            name: "nb".into(),
            user_id: "u1".into(),
            username: "alice".into(),
            status: InstanceStatus::Running,
            kind: InstanceKind::Container,
            app_type: AppType::Jupyter,
            create_at,
            life_span_ms,
            instance_token: String::new(),
            web_dav_token: String::new(),
            project: "workbench".into(),
            config: BTreeMap::new(),
            host_map_port: 30000,
            metadata: UsageGauges::default(),
            lxd_state: None,
            life: LifeAudit {
                created_time: create_at,
                created_user: "u1".into(),
                deleted_time: None,
                deleted_user: None,
            },
        }
    }

    #[test]
    fn test_remaining_counts_down() {
        let now = Utc::now();
        let i = instance(3_600_000, Duration::minutes(30), now);
        assert_eq!(remaining_ms(&i, now), 1_800_000);
        assert!(!is_expired(&i, now));
    }

    #[test]
    fn test_remaining_clamps_to_zero() {
        let now = Utc::now();
        let i = instance(3_600_000, Duration::hours(2), now);
        assert_eq!(remaining_ms(&i, now), 0);
        assert!(is_expired(&i, now));
    }

    #[test]
    fn test_expiry_stop_skips_terminalish_statuses() {
        assert!(needs_expiry_stop(InstanceStatus::Pending));
        assert!(needs_expiry_stop(InstanceStatus::Starting));
        assert!(needs_expiry_stop(InstanceStatus::Running));
        assert!(!needs_expiry_stop(InstanceStatus::Stopped));
        assert!(!needs_expiry_stop(InstanceStatus::Stopping));
        assert!(!needs_expiry_stop(InstanceStatus::Failed));
    }

    #[test]
    fn test_extension_owner_with_low_runway_succeeds() {
        let now = Utc::now();
        let i = instance(3_600_000, Duration::minutes(30), now);
        assert!(validate_extension(&i, "u1", now).is_ok());
    }

    #[test]
    fn test_extension_rejected_with_enough_runway() {
        let now = Utc::now();
        let i = instance(EXTENSION_RUNWAY_CAP_MS + 3_600_000, Duration::zero(), now);
        assert!(matches!(
            validate_extension(&i, "u1", now),
            Err(Error::EnoughRunway(_))
        ));
    }

    #[test]
    fn test_extension_rejected_for_non_owner() {
        let now = Utc::now();
        // Non-owner fails regardless of remaining time.
        let i = instance(60_000, Duration::minutes(30), now);
        assert!(matches!(
            validate_extension(&i, "u2", now),
            Err(Error::PermissionDenied(_))
        ));
    }
}
