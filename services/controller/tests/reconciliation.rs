//! Integration tests for the reconciliation sweep.
//!
//! Uses MockScheduler and MockPlatform to drive the sweep through its
//! failure and convergence paths.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use podpool_controller::platform::ObservedInstance;
use podpool_controller::scheduler::{AgentRecord, AgentStatus, SchedulerCall};
use podpool_controller::{
    InstancePhase, InstanceRegistry, MockPlatform, MockScheduler, Reconciler, ReconcilerConfig,
};
use podpool_id::{AgentUuid, InstanceId, PoolName};
use podpool_reconcile::{ConvergenceStatus, SagaStage};

struct Harness {
    scheduler: Arc<MockScheduler>,
    platform: Arc<MockPlatform>,
    registry: Arc<InstanceRegistry>,
    reconciler: Reconciler,
}

fn harness() -> Harness {
    let scheduler = Arc::new(MockScheduler::new());
    let platform = Arc::new(MockPlatform::new());
    let registry = Arc::new(InstanceRegistry::new());
    let reconciler = Reconciler::new(
        scheduler.clone(),
        platform.clone(),
        Arc::clone(&registry),
        ReconcilerConfig {
            reconcile_interval: Duration::from_secs(60),
            auto_register_timeout: Duration::from_secs(600),
        },
    );
    Harness {
        scheduler,
        platform,
        registry,
        reconciler,
    }
}

fn instance(s: &str) -> InstanceId {
    s.parse().unwrap()
}

fn linux() -> PoolName {
    "linux".parse().unwrap()
}

fn agent(uuid: &str, instance_id: Option<&str>) -> AgentRecord {
    AgentRecord {
        uuid: uuid.parse::<AgentUuid>().unwrap(),
        instance_id: instance_id.map(instance),
        status: AgentStatus::Idle,
    }
}

/// Put a pod on the platform and in the registry, created `age` ago.
async fn seed_pod(h: &Harness, id: &str, age: Duration, ready: bool) {
    let created_at: DateTime<Utc> = Utc::now() - chrono::Duration::from_std(age).unwrap();
    h.platform
        .insert(ObservedInstance {
            id: instance(id),
            pool: linux(),
            ready,
            terminal: false,
            created_at,
        })
        .await;
    h.registry
        .insert_pending(instance(id), linux(), created_at)
        .await;
}

#[tokio::test]
async fn test_list_failure_issues_no_corrective_calls() {
    let h = harness();
    h.scheduler.register(agent("orphan-1", Some("podpool-gone"))).await;
    seed_pod(&h, "podpool-stuck", Duration::from_secs(3600), false).await;
    h.scheduler.set_fail_list(true).await;

    assert!(h.reconciler.sweep().await.is_err());

    assert_eq!(h.scheduler.calls().await, vec![SchedulerCall::List]);
    assert_eq!(h.platform.delete_calls(), 0);
    assert!(h.registry.get(&instance("podpool-stuck")).await.is_some());
}

#[tokio::test]
async fn test_orphans_disabled_then_deleted() {
    let h = harness();
    seed_pod(&h, "podpool-live", Duration::from_secs(5), true).await;
    h.scheduler.register(agent("live", Some("podpool-live"))).await;
    h.scheduler.register(agent("orphan-1", Some("podpool-gone-1"))).await;
    h.scheduler.register(agent("orphan-2", Some("podpool-gone-2"))).await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.orphaned_agents, 2);
    assert_eq!(report.orphan_stage, SagaStage::Completed);
    let orphans: Vec<AgentUuid> = vec!["orphan-1".parse().unwrap(), "orphan-2".parse().unwrap()];
    assert_eq!(
        h.scheduler.calls().await,
        vec![
            SchedulerCall::List,
            SchedulerCall::Disable(orphans.clone()),
            SchedulerCall::Delete(orphans),
        ]
    );
    let remaining = h.scheduler.agents().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].uuid.as_str(), "live");
}

#[tokio::test]
async fn test_second_sweep_is_a_noop() {
    let h = harness();
    seed_pod(&h, "podpool-live", Duration::from_secs(5), true).await;
    h.scheduler.register(agent("live", Some("podpool-live"))).await;
    h.scheduler.register(agent("orphan-1", Some("podpool-gone"))).await;

    h.reconciler.sweep().await.unwrap();
    h.scheduler.clear_calls().await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(h.scheduler.calls().await, vec![SchedulerCall::List]);
    assert_eq!(report.orphaned_agents, 0);
    assert_eq!(report.status(), ConvergenceStatus::Converged);
}

#[tokio::test]
async fn test_disable_failure_skips_delete() {
    let h = harness();
    h.scheduler.register(agent("orphan-1", Some("podpool-gone"))).await;
    h.scheduler.set_fail_disable(true).await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.orphan_stage, SagaStage::DisableFailed);
    assert_eq!(report.status(), ConvergenceStatus::Degraded);
    let calls = h.scheduler.calls().await;
    assert!(!calls.iter().any(|c| matches!(c, SchedulerCall::Delete(_))));

    // Retried from scratch once the scheduler recovers.
    h.scheduler.set_fail_disable(false).await;
    h.scheduler.clear_calls().await;
    let report = h.reconciler.sweep().await.unwrap();
    assert_eq!(report.orphan_stage, SagaStage::Completed);
    assert!(h.scheduler.agents().await.is_empty());
}

#[tokio::test]
async fn test_unmanaged_agents_are_left_alone() {
    let h = harness();
    h.scheduler.register(agent("static-agent", None)).await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.orphaned_agents, 0);
    assert_eq!(h.scheduler.calls().await, vec![SchedulerCall::List]);
    assert_eq!(h.scheduler.agents().await.len(), 1);
}

#[tokio::test]
async fn test_stuck_instance_terminated() {
    let h = harness();
    seed_pod(&h, "podpool-stuck", Duration::from_secs(3600), false).await;
    seed_pod(&h, "podpool-young", Duration::from_secs(5), false).await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.stuck, vec![instance("podpool-stuck")]);
    assert_eq!(report.terminated, vec![instance("podpool-stuck")]);
    assert!(!h.platform.contains(&instance("podpool-stuck")).await);
    assert!(h.registry.get(&instance("podpool-stuck")).await.is_none());
    assert!(h.registry.get(&instance("podpool-young")).await.is_some());
}

#[tokio::test]
async fn test_failed_termination_retried_next_sweep() {
    let h = harness();
    seed_pod(&h, "podpool-stuck", Duration::from_secs(3600), false).await;
    h.platform.set_fail_deletes(true);

    let report = h.reconciler.sweep().await.unwrap();
    assert_eq!(report.termination_failures, 1);
    let tracked = h.registry.get(&instance("podpool-stuck")).await.unwrap();
    assert_eq!(tracked.phase, InstancePhase::Terminating);

    h.platform.set_fail_deletes(false);
    let report = h.reconciler.sweep().await.unwrap();
    assert_eq!(report.terminated, vec![instance("podpool-stuck")]);
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn test_registered_ready_instance_promoted() {
    let h = harness();
    seed_pod(&h, "podpool-a", Duration::from_secs(30), true).await;
    seed_pod(&h, "podpool-b", Duration::from_secs(30), true).await;
    h.scheduler.register(agent("a", Some("podpool-a"))).await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.promoted, vec![instance("podpool-a")]);
    let a = h.registry.get(&instance("podpool-a")).await.unwrap();
    let b = h.registry.get(&instance("podpool-b")).await.unwrap();
    assert_eq!(a.phase, InstancePhase::Running);
    assert_eq!(b.phase, InstancePhase::Pending);
    assert_eq!(h.registry.pending_count(&linux()).await, 1);
}

#[tokio::test]
async fn test_evicted_pod_removed_and_agent_retired() {
    let h = harness();
    seed_pod(&h, "podpool-a", Duration::from_secs(30), true).await;
    h.scheduler.register(agent("a", Some("podpool-a"))).await;
    h.reconciler.sweep().await.unwrap();

    h.platform.evict(&instance("podpool-a")).await;
    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.vanished, vec![instance("podpool-a")]);
    assert_eq!(report.orphaned_agents, 1);
    assert!(h.registry.is_empty().await);
    assert!(h.scheduler.agents().await.is_empty());
}

#[tokio::test]
async fn test_unknown_pod_adopted() {
    let h = harness();
    h.platform
        .insert(ObservedInstance {
            id: instance("podpool-restart"),
            pool: linux(),
            ready: true,
            terminal: false,
            created_at: Utc::now() - chrono::Duration::minutes(1),
        })
        .await;
    h.scheduler.register(agent("r", Some("podpool-restart"))).await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.adopted, vec![instance("podpool-restart")]);
    assert_eq!(report.orphaned_agents, 0);
    let adopted = h.registry.get(&instance("podpool-restart")).await.unwrap();
    assert_eq!(adopted.phase, InstancePhase::Running);
}

#[tokio::test]
async fn test_platform_list_failure_still_retires_orphans() {
    let h = harness();
    seed_pod(&h, "podpool-live", Duration::from_secs(5), true).await;
    h.scheduler.register(agent("live", Some("podpool-live"))).await;
    h.scheduler.register(agent("orphan-1", Some("podpool-gone"))).await;
    h.platform.set_fail_lists(true);

    let report = h.reconciler.sweep().await.unwrap();

    assert!(!report.platform_refreshed);
    assert_eq!(report.status(), ConvergenceStatus::Degraded);
    assert_eq!(report.orphan_stage, SagaStage::Completed);
    assert!(h.registry.get(&instance("podpool-live")).await.is_some());
}

#[tokio::test]
async fn test_failed_pod_deleted_and_lost_agent_retired() {
    let h = harness();
    seed_pod(&h, "podpool-dead", Duration::from_secs(120), true).await;
    h.scheduler
        .register(AgentRecord {
            status: AgentStatus::LostContact,
            ..agent("dead", Some("podpool-dead"))
        })
        .await;
    h.reconciler.sweep().await.unwrap();
    h.platform.set_failed(&instance("podpool-dead")).await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.failed, vec![instance("podpool-dead")]);
    assert_eq!(report.terminated, vec![instance("podpool-dead")]);
    assert_eq!(report.orphaned_agents, 1);
    assert_eq!(report.orphan_stage, SagaStage::Completed);
    assert_eq!(report.status(), ConvergenceStatus::Converging);
    assert!(!h.platform.contains(&instance("podpool-dead")).await);
    assert!(h.registry.is_empty().await);
    assert!(h.scheduler.agents().await.is_empty());

    let report = h.reconciler.sweep().await.unwrap();
    assert!(report.status().is_converged());
}

#[tokio::test]
async fn test_unknown_failed_pod_is_not_adopted_as_live() {
    let h = harness();
    h.platform
        .insert(ObservedInstance {
            id: instance("podpool-crashed"),
            pool: linux(),
            ready: false,
            terminal: true,
            created_at: Utc::now() - chrono::Duration::minutes(1),
        })
        .await;
    h.scheduler.register(agent("c", Some("podpool-crashed"))).await;

    let report = h.reconciler.sweep().await.unwrap();

    assert_eq!(report.adopted, vec![instance("podpool-crashed")]);
    assert_eq!(report.terminated, vec![instance("podpool-crashed")]);
    assert_eq!(report.orphaned_agents, 1);
    assert!(h.registry.is_empty().await);
    assert!(h.scheduler.agents().await.is_empty());
}
