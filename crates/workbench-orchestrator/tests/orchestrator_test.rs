// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for the lifecycle operations, on the in-memory
//! registry and the mock dispatcher.

use std::sync::Arc;

use workbench_orchestrator::config_store::StaticConfigStore;
use workbench_orchestrator::dispatch::{JobKind, JobStatus, MockDispatcher};
use workbench_orchestrator::error::{Error, ResourceKind};
use workbench_orchestrator::model::{
    Actor, AppType, CpuState, InstanceAddress, InstanceKind, InstanceStatus, LxdState,
    MemoryState, QuotaCeilings, StartStopAction, UserQuota, config_keys,
};
use workbench_orchestrator::orchestrator::{
    CreateInstanceRequest, EditInstanceRequest, InstanceOrchestrator,
};
use workbench_orchestrator::ports::PortRange;
use workbench_orchestrator::reconciler::{Reconciler, ReconcilerConfig};
use workbench_orchestrator::registry::{InstanceRegistry, MemoryRegistry};
use workbench_orchestrator::tokens::MockTokenIssuer;

struct Harness {
    registry: Arc<MemoryRegistry>,
    dispatcher: Arc<MockDispatcher>,
    orchestrator: InstanceOrchestrator,
}

fn harness() -> Harness {
    harness_with_store(StaticConfigStore::with_defaults())
}

fn harness_with_store(store: StaticConfigStore) -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    let dispatcher = Arc::new(MockDispatcher::new());
    let orchestrator = InstanceOrchestrator::new(
        registry.clone(),
        dispatcher.clone(),
        Arc::new(MockTokenIssuer),
        Arc::new(store),
        PortRange::default(),
        "workbench",
    );
    Harness {
        registry,
        dispatcher,
        orchestrator,
    }
}

fn create_request(user_id: &str, name: &str) -> CreateInstanceRequest {
    CreateInstanceRequest {
        user_id: user_id.to_string(),
        username: user_id.to_string(),
        name: name.to_string(),
        kind: InstanceKind::Container,
        app_type: AppType::Jupyter,
        life_span_ms: 3_600_000,
        cpu_limit: None,
        memory_limit: None,
        disk_limit: None,
    }
}

fn running_state(ip: &str) -> LxdState {
    LxdState {
        cpu: CpuState { usage: 0 },
        memory: MemoryState { usage: 0 },
        network: vec![InstanceAddress {
            family: "inet".to_string(),
            address: ip.to_string(),
        }],
    }
}

#[tokio::test]
async fn create_persists_record_and_enqueues_create_job() {
    let h = harness();

    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    assert_eq!(instance.status, InstanceStatus::Pending);
    assert_eq!(instance.host_map_port, 30000);
    assert_eq!(
        instance.config.get(config_keys::CPU_LIMIT).map(String::as_str),
        Some("4")
    );
    assert_eq!(
        instance.config.get(config_keys::MEMORY_LIMIT).map(String::as_str),
        Some("16GB")
    );
    assert!(!instance.instance_token.is_empty());
    assert!(
        instance
            .config
            .get(config_keys::USER_DATA)
            .unwrap()
            .contains(&instance.instance_token)
    );

    let jobs = h.dispatcher.all_jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Create);
    assert_eq!(jobs[0].priority, 8);
    assert!(jobs[0].references_instance(&instance.id));
}

#[tokio::test]
async fn create_assigns_sequential_ports() {
    let h = harness();

    let first = h
        .orchestrator
        .create_instance(create_request("alice", "one"))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .create_instance(create_request("bob", "two"))
        .await
        .unwrap();

    assert_eq!(first.host_map_port, 30000);
    assert_eq!(second.host_map_port, 30001);
}

#[tokio::test]
async fn create_rejects_over_quota() {
    let mut store = StaticConfigStore::with_defaults();
    store.set_user_quota(
        "alice",
        UserQuota {
            ceilings: QuotaCeilings {
                max_cpu_cores: 100,
                max_memory_bytes: u64::MAX,
                max_disk_bytes: u64::MAX,
                max_instances: 1,
            },
            flavor_allow_list: vec![],
        },
    );
    let h = harness_with_store(store);

    h.orchestrator
        .create_instance(create_request("alice", "one"))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .create_instance(create_request("alice", "two"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::QuotaExceeded(ResourceKind::InstanceCount)
    ));
    // Quota is per user: another user still fits.
    h.orchestrator
        .create_instance(create_request("bob", "three"))
        .await
        .unwrap();
}

#[tokio::test]
async fn create_rejects_cpu_ceiling_breach() {
    let h = harness();

    // Default ceiling is 8 cores; two 4-core instances exhaust it exactly.
    h.orchestrator
        .create_instance(create_request("alice", "one"))
        .await
        .unwrap();
    h.orchestrator
        .create_instance(create_request("alice", "two"))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .create_instance(create_request("alice", "three"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded(ResourceKind::Cpu)));
}

#[tokio::test]
async fn create_rejects_malformed_memory_limit() {
    let h = harness();

    let mut request = create_request("alice", "broken");
    request.memory_limit = Some("sixteen gigs".to_string());

    assert!(matches!(
        h.orchestrator.create_instance(request).await.unwrap_err(),
        Error::MalformedInput(_)
    ));
}

#[tokio::test]
async fn start_stop_moves_through_transitional_status() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    let stopping = h
        .orchestrator
        .start_stop_instance("alice", &instance.id, StartStopAction::Stop)
        .await
        .unwrap();
    assert_eq!(stopping.status, InstanceStatus::Stopping);

    let starting = h
        .orchestrator
        .start_stop_instance("alice", &instance.id, StartStopAction::Start)
        .await
        .unwrap();
    assert_eq!(starting.status, InstanceStatus::Starting);

    let kinds: Vec<JobKind> = h.dispatcher.all_jobs().await.iter().map(|j| j.kind).collect();
    assert_eq!(kinds, vec![JobKind::Create, JobKind::Stop, JobKind::Start]);
}

#[tokio::test]
async fn start_stop_is_scoped_to_the_owner() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .start_stop_instance("mallory", &instance.id, StartStopAction::Stop)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn restart_resets_the_lifespan_clock() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    let restarted = h
        .orchestrator
        .restart_instance("alice", &instance.id, 7_200_000)
        .await
        .unwrap();

    assert_eq!(restarted.status, InstanceStatus::Starting);
    assert_eq!(restarted.life_span_ms, 7_200_000);
    assert!(restarted.create_at >= instance.create_at);

    let jobs = h.dispatcher.all_jobs().await;
    assert_eq!(jobs.last().unwrap().kind, JobKind::Start);
}

#[tokio::test]
async fn delete_cancels_pending_jobs_except_the_delete_job() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();
    // A pending START job that should be withdrawn by the delete.
    h.orchestrator
        .start_stop_instance("alice", &instance.id, StartStopAction::Start)
        .await
        .unwrap();

    let deleted = h
        .orchestrator
        .delete_instance("alice", &instance.id)
        .await
        .unwrap();
    assert_eq!(deleted.status, InstanceStatus::Deleted);
    assert_eq!(deleted.life.deleted_user.as_deref(), Some("alice"));

    let jobs = h.dispatcher.all_jobs().await;
    for job in &jobs {
        match job.kind {
            JobKind::Delete => {
                assert_eq!(job.status, JobStatus::Pending);
            }
            _ => {
                assert_eq!(job.status, JobStatus::Cancelled, "job {} survived", job.name);
                assert_eq!(job.deleted_user.as_deref(), Some("alice"));
            }
        }
    }

    // Gone from listings; with no live instance left the released port is
    // handed out again.
    assert!(h.orchestrator.get_instances("alice").await.unwrap().is_empty());
    let next = h
        .orchestrator
        .create_instance(create_request("alice", "fresh"))
        .await
        .unwrap();
    assert_eq!(next.host_map_port, 30000);
}

#[tokio::test]
async fn delete_of_unknown_instance_is_not_found() {
    let h = harness();
    assert!(matches!(
        h.orchestrator.delete_instance("alice", "no-such").await.unwrap_err(),
        Error::NotFound(_)
    ));
}

#[tokio::test]
async fn edit_requires_a_selector_and_ownership() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    let alice = Actor {
        user_id: "alice".to_string(),
        is_admin: false,
    };
    let mallory = Actor {
        user_id: "mallory".to_string(),
        is_admin: false,
    };
    let admin = Actor {
        user_id: "root".to_string(),
        is_admin: true,
    };

    assert!(matches!(
        h.orchestrator
            .edit_instance(&alice, None, None, EditInstanceRequest::default())
            .await
            .unwrap_err(),
        Error::MalformedInput(_)
    ));

    assert!(matches!(
        h.orchestrator
            .edit_instance(
                &mallory,
                Some(&instance.id),
                None,
                EditInstanceRequest {
                    new_name: Some("stolen".to_string()),
                    ..EditInstanceRequest::default()
                },
            )
            .await
            .unwrap_err(),
        Error::PermissionDenied(_)
    ));

    // Admins may edit any instance, selected by name.
    let renamed = h
        .orchestrator
        .edit_instance(
            &admin,
            None,
            Some("notebook"),
            EditInstanceRequest {
                new_name: Some("renamed".to_string()),
                ..EditInstanceRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "renamed");
}

#[tokio::test]
async fn edit_folds_limits_into_config_and_enqueues_update() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();
    let alice = Actor {
        user_id: "alice".to_string(),
        is_admin: false,
    };

    let updated = h
        .orchestrator
        .edit_instance(
            &alice,
            Some(&instance.id),
            None,
            EditInstanceRequest {
                new_name: None,
                cpu_limit: Some(2),
                memory_limit: Some("8GB".to_string()),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        updated.config.get(config_keys::CPU_LIMIT).map(String::as_str),
        Some("2")
    );
    assert_eq!(
        updated.config.get(config_keys::MEMORY_LIMIT).map(String::as_str),
        Some("8GB")
    );
    // Untouched keys survive a config replacement.
    assert!(updated.config.contains_key(config_keys::USER_DATA));

    let last = h.dispatcher.all_jobs().await.pop().unwrap();
    assert_eq!(last.kind, JobKind::Update);
    assert_eq!(last.priority, 2);
}

#[tokio::test]
async fn extend_adds_runway_for_the_owner_only() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    assert!(matches!(
        h.orchestrator
            .extend_lifespan("mallory", &instance.id, 1_000)
            .await
            .unwrap_err(),
        Error::PermissionDenied(_)
    ));

    let extended = h
        .orchestrator
        .extend_lifespan("alice", &instance.id, 3_600_000)
        .await
        .unwrap();
    assert_eq!(extended.life_span_ms, 7_200_000);
}

#[tokio::test]
async fn extend_refuses_instances_with_enough_runway() {
    let h = harness();
    let mut request = create_request("alice", "marathon");
    request.life_span_ms = 30 * 24 * 60 * 60 * 1000; // a month of runway
    let instance = h.orchestrator.create_instance(request).await.unwrap();

    assert!(matches!(
        h.orchestrator
            .extend_lifespan("alice", &instance.id, 1_000)
            .await
            .unwrap_err(),
        Error::EnoughRunway(_)
    ));
}

#[tokio::test]
async fn extend_rejects_an_overflowing_extension() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    assert!(matches!(
        h.orchestrator
            .extend_lifespan("alice", &instance.id, i64::MAX)
            .await
            .unwrap_err(),
        Error::MalformedInput(_)
    ));

    // The stored lifespan is untouched after the rejection.
    let kept = h.registry.get(&instance.id).await.unwrap().unwrap();
    assert_eq!(kept.life_span_ms, instance.life_span_ms);
}

#[tokio::test]
async fn get_instances_reports_remaining_lifespan_without_mutating() {
    let h = harness();
    let created = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    let listed = h.orchestrator.get_instances("alice").await.unwrap();
    assert_eq!(listed.len(), 1);
    // Remaining runway, not the configured budget.
    assert!(listed[0].life_span_ms <= 3_600_000);
    assert!(listed[0].life_span_ms > 3_500_000);
    // Not running: gauges are zero.
    assert_eq!(listed[0].metadata.cpu_usage, 0.0);
    assert_eq!(listed[0].metadata.memory_usage, 0.0);

    // The persisted budget is untouched by the read.
    let stored = h.registry.get(&created.id).await.unwrap().unwrap();
    assert_eq!(stored.life_span_ms, 3_600_000);
}

#[tokio::test]
async fn container_ip_resolves_once_running_with_an_address() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();

    // Not running yet: no endpoint, but a state refresh gets queued once.
    assert!(
        h.orchestrator
            .get_container_ip("alice", &instance.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        h.orchestrator
            .get_container_ip("alice", &instance.id)
            .await
            .unwrap()
            .is_none()
    );
    let state_jobs: Vec<_> = h
        .dispatcher
        .all_jobs()
        .await
        .into_iter()
        .filter(|j| j.kind == JobKind::State)
        .collect();
    assert_eq!(state_jobs.len(), 1);

    h.registry
        .transition_status(None, &instance.id, &[], InstanceStatus::Running)
        .await
        .unwrap()
        .unwrap();
    h.registry
        .record_runtime_state(&instance.id, running_state("10.20.0.5"))
        .await
        .unwrap();

    let endpoint = h
        .orchestrator
        .get_container_ip("alice", &instance.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(endpoint.ip, "10.20.0.5");
    assert_eq!(endpoint.port, instance.host_map_port);
}

#[tokio::test]
async fn quota_and_flavors_respect_the_allow_list() {
    let mut store = StaticConfigStore::with_defaults();
    let quota = UserQuota {
        ceilings: QuotaCeilings {
            max_cpu_cores: 8,
            max_memory_bytes: 1 << 35,
            max_disk_bytes: 1 << 37,
            max_instances: 3,
        },
        flavor_allow_list: vec!["small".to_string()],
    };
    store.set_user_quota("alice", quota);
    let h = harness_with_store(store);

    let alice = Actor {
        user_id: "alice".to_string(),
        is_admin: false,
    };
    let listed = h.orchestrator.get_quota_and_flavors(&alice).await.unwrap();
    assert_eq!(listed.flavors.len(), 1);
    assert_eq!(listed.flavors[0].name, "small");
    assert_eq!(listed.flavors[0].memory, "8GB");

    let admin = Actor {
        user_id: "root".to_string(),
        is_admin: true,
    };
    let all = h.orchestrator.get_quota_and_flavors(&admin).await.unwrap();
    assert_eq!(all.flavors.len(), 2);
}

#[tokio::test]
async fn reconciler_stops_expired_instances_and_ensures_monitors() {
    let h = harness();
    let instance = h
        .orchestrator
        .create_instance(create_request("alice", "notebook"))
        .await
        .unwrap();
    h.registry
        .transition_status(None, &instance.id, &[], InstanceStatus::Running)
        .await
        .unwrap()
        .unwrap();
    // Exhaust the budget; the reconciler treats a zero budget as expired.
    h.registry.set_life_span(&instance.id, 0).await.unwrap().unwrap();

    let reconciler = Reconciler::new(
        h.registry.clone(),
        h.dispatcher.clone(),
        ReconcilerConfig::default(),
    );
    reconciler.reconcile_once().await.unwrap();

    let stored = h.registry.get(&instance.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InstanceStatus::Stopping);
    assert_eq!(stored.life_span_ms, 0);

    let jobs = h.dispatcher.all_jobs().await;
    assert!(
        jobs.iter()
            .any(|j| j.kind == JobKind::Stop && j.references_instance(&instance.id))
    );
    assert!(jobs.iter().any(|j| j.kind == JobKind::State && j.owner_id == "alice"));
    assert!(
        jobs.iter()
            .any(|j| j.kind == JobKind::SyncDeletion && j.owner_id == "alice")
    );

    // A second pass is a no-op: the instance is already STOPPING and the
    // monitor jobs are still pending.
    reconciler.reconcile_once().await.unwrap();
    let jobs_after = h.dispatcher.all_jobs().await;
    assert_eq!(jobs.len(), jobs_after.len());
}
