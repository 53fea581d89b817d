//! Integration tests for the admission semaphore.
//!
//! The permit count of a pool must never let more pods be requested than the
//! pool's ceiling allows, no matter how acquisitions and recomputes
//! interleave.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use podpool_controller::config::PoolCeilings;
use podpool_controller::{AdmissionController, InstanceRegistry};
use podpool_id::{InstanceId, PoolName};
use podpool_reconcile::AdmissionTarget;
use rstest::rstest;

fn pool(s: &str) -> PoolName {
    s.parse().unwrap()
}

fn instance(s: &str) -> InstanceId {
    s.parse().unwrap()
}

async fn setup(ceiling: u32) -> (Arc<InstanceRegistry>, Arc<AdmissionController>) {
    let registry = Arc::new(InstanceRegistry::new());
    let admission = Arc::new(AdmissionController::new(
        Arc::clone(&registry),
        PoolCeilings::uniform(ceiling),
    ));
    admission.ensure_pool(&pool("linux")).await;
    (registry, admission)
}

async fn add_pending(registry: &InstanceRegistry, count: usize) {
    for i in 0..count {
        registry
            .insert_pending(instance(&format!("linux-{i}")), pool("linux"), Utc::now())
            .await;
    }
}

#[tokio::test]
async fn test_ceiling_caps_acquisitions() {
    let (_, admission) = setup(2).await;

    let first = admission.try_acquire(&pool("linux")).await;
    let second = admission.try_acquire(&pool("linux")).await;
    let third = admission.try_acquire(&pool("linux")).await;

    assert!(first.is_some());
    assert!(second.is_some());
    assert!(third.is_none());
}

#[tokio::test]
async fn test_zero_ceiling_admits_nothing() {
    let (_, admission) = setup(0).await;
    assert!(admission.try_acquire(&pool("linux")).await.is_none());
    assert_eq!(admission.available_permits(&pool("linux")).await, 0);
}

#[rstest]
#[case(3, 0, AdmissionTarget::Permits(3))]
#[case(3, 1, AdmissionTarget::Permits(2))]
#[case(3, 3, AdmissionTarget::Drain)]
#[case(3, 5, AdmissionTarget::Drain)]
#[tokio::test]
async fn test_recompute_tracks_pending(
    #[case] ceiling: u32,
    #[case] pending: usize,
    #[case] expected: AdmissionTarget,
) {
    let (registry, admission) = setup(ceiling).await;
    add_pending(&registry, pending).await;

    let target = admission.recompute(&pool("linux")).await;

    assert_eq!(target, expected);
    assert_eq!(
        admission.available_permits(&pool("linux")).await,
        i64::from(expected.permits())
    );
}

#[tokio::test]
async fn test_recompute_is_idempotent() {
    let (registry, admission) = setup(4).await;
    add_pending(&registry, 1).await;

    let first = admission.recompute(&pool("linux")).await;
    let permits = admission.available_permits(&pool("linux")).await;
    let second = admission.recompute(&pool("linux")).await;

    assert_eq!(first, second);
    assert_eq!(admission.available_permits(&pool("linux")).await, permits);
}

#[tokio::test]
async fn test_pending_at_ceiling_blocks_until_it_drops() {
    let (registry, admission) = setup(2).await;
    add_pending(&registry, 2).await;
    admission.recompute(&pool("linux")).await;
    assert!(admission.try_acquire(&pool("linux")).await.is_none());

    registry.remove(&instance("linux-0")).await;
    admission.recompute(&pool("linux")).await;
    assert!(admission.try_acquire(&pool("linux")).await.is_some());
}

#[tokio::test]
async fn test_pools_are_independent() {
    let registry = Arc::new(InstanceRegistry::new());
    let ceilings = PoolCeilings::new(1, HashMap::from([(pool("windows"), 3)]));
    let admission = AdmissionController::new(Arc::clone(&registry), ceilings);
    admission.ensure_pool(&pool("linux")).await;
    admission.ensure_pool(&pool("windows")).await;

    let _linux = admission.try_acquire(&pool("linux")).await.unwrap();
    assert!(admission.try_acquire(&pool("linux")).await.is_none());
    assert_eq!(admission.available_permits(&pool("windows")).await, 3);
}

#[tokio::test]
async fn test_recompute_all_covers_registry_pools() {
    let registry = Arc::new(InstanceRegistry::new());
    let admission = AdmissionController::new(Arc::clone(&registry), PoolCeilings::uniform(2));
    registry
        .insert_pending(instance("macos-0"), pool("macos"), Utc::now())
        .await;

    admission.recompute_all().await;

    let status = admission.status(&pool("macos")).await;
    assert_eq!(status.ceiling, 2);
    assert_eq!(status.pending, 1);
    assert_eq!(status.available_permits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_never_overshoots() {
    let (registry, admission) = setup(5).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let admission = Arc::clone(&admission);
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            if i % 4 == 0 {
                admission.recompute(&pool("linux")).await;
            }
            match admission.try_acquire(&pool("linux")).await {
                Some(permit) => {
                    registry
                        .insert_pending(instance(&format!("linux-{i}")), pool("linux"), Utc::now())
                        .await;
                    permit.commit();
                    true
                }
                None => false,
            }
        }));
    }

    let mut admitted: usize = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    // Recomputes racing with commits may undercount headroom, never
    // overcount it.
    assert!(admitted >= 1 && admitted <= 5, "admitted {admitted}");
    assert_eq!(registry.pending_count(&pool("linux")).await, admitted);

    admission.recompute(&pool("linux")).await;
    let status = admission.status(&pool("linux")).await;
    assert_eq!(status.in_flight, 0);
    assert_eq!(status.available_permits, 5 - admitted as i64);
}
