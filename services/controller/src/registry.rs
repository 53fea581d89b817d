//! Instance registry.
//!
//! The registry is the single owner of instance state. Everything else holds
//! an `InstanceId` and goes through the methods here. Every method is one
//! lock scope, and no method performs I/O, so callers never hold the lock
//! across a platform or scheduler call.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use podpool_id::{InstanceId, PoolName};
use podpool_reconcile::FleetMember;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::platform::ObservedInstance;

/// Lifecycle phase of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePhase {
    /// Requested from the platform, not yet confirmed ready.
    Pending,
    /// Ready on the platform and registered with the scheduler.
    Running,
    /// Marked for deletion, awaiting platform confirmation.
    Terminating,
}

/// A tracked instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub id: InstanceId,
    pub pool: PoolName,
    pub phase: InstancePhase,
    pub created_at: DateTime<Utc>,
}

/// What a platform refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Pods found on the platform that the registry did not know.
    pub adopted: Vec<InstanceId>,
    /// Registry entries whose pods are gone.
    pub removed: Vec<InstanceId>,
    /// Pods that stopped for good and were marked terminating.
    pub failed: Vec<InstanceId>,
}

/// In-memory instance registry.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, Instance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly created instance as pending.
    ///
    /// Returns false if the id is already tracked.
    pub async fn insert_pending(
        &self,
        id: InstanceId,
        pool: PoolName,
        created_at: DateTime<Utc>,
    ) -> bool {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&id) {
            return false;
        }
        debug!(instance_id = %id, pool = %pool, "Registered pending instance");
        instances.insert(
            id.clone(),
            Instance {
                id,
                pool,
                phase: InstancePhase::Pending,
                created_at,
            },
        );
        true
    }

    pub async fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Number of pending instances in a pool.
    pub async fn pending_count(&self, pool: &PoolName) -> usize {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| &i.pool == pool && i.phase == InstancePhase::Pending)
            .count()
    }

    /// Every pool that currently has at least one instance.
    pub async fn pools(&self) -> BTreeSet<PoolName> {
        self.instances
            .read()
            .await
            .values()
            .map(|i| i.pool.clone())
            .collect()
    }

    /// All instances, sorted by id.
    pub async fn snapshot(&self) -> Vec<Instance> {
        let mut all: Vec<_> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// The view the sweep planner needs.
    pub async fn fleet(&self) -> Vec<FleetMember> {
        self.instances
            .read()
            .await
            .values()
            .map(|i| FleetMember {
                id: i.id.clone(),
                created_at: i.created_at,
                terminating: i.phase == InstancePhase::Terminating,
            })
            .collect()
    }

    /// Ids of instances waiting for platform deletion.
    pub async fn terminating(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self
            .instances
            .read()
            .await
            .values()
            .filter(|i| i.phase == InstancePhase::Terminating)
            .map(|i| i.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Promote pending instances in `ready` to running.
    ///
    /// Returns the ids that actually changed phase.
    pub async fn promote(&self, ready: &HashSet<InstanceId>) -> Vec<InstanceId> {
        let mut instances = self.instances.write().await;
        let mut promoted = Vec::new();
        for id in ready {
            if let Some(instance) = instances.get_mut(id) {
                if instance.phase == InstancePhase::Pending {
                    instance.phase = InstancePhase::Running;
                    promoted.push(id.clone());
                }
            }
        }
        promoted
    }

    /// Mark an instance as terminating.
    ///
    /// Returns false if the instance is unknown.
    pub async fn mark_terminating(&self, id: &InstanceId) -> bool {
        match self.instances.write().await.get_mut(id) {
            Some(instance) => {
                instance.phase = InstancePhase::Terminating;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &InstanceId) -> Option<Instance> {
        self.instances.write().await.remove(id)
    }

    /// Fold a platform listing into the registry.
    ///
    /// `listed_at` must be taken before the listing was requested. Entries
    /// created after that moment may legitimately be missing from the
    /// listing and are left alone.
    pub async fn apply_observations(
        &self,
        observed: &[ObservedInstance],
        listed_at: DateTime<Utc>,
    ) -> RefreshOutcome {
        let seen: HashSet<&InstanceId> = observed.iter().map(|o| &o.id).collect();
        let mut outcome = RefreshOutcome::default();
        let mut instances = self.instances.write().await;

        for o in observed {
            if let Some(known) = instances.get_mut(&o.id) {
                if o.terminal && known.phase != InstancePhase::Terminating {
                    warn!(
                        instance_id = %o.id,
                        phase = ?known.phase,
                        "Pod has stopped, marking terminating"
                    );
                    known.phase = InstancePhase::Terminating;
                    outcome.failed.push(o.id.clone());
                }
                continue;
            }
            let phase = if o.terminal {
                outcome.failed.push(o.id.clone());
                InstancePhase::Terminating
            } else if o.ready {
                InstancePhase::Running
            } else {
                InstancePhase::Pending
            };
            info!(instance_id = %o.id, pool = %o.pool, ?phase, "Adopting unknown pod");
            instances.insert(
                o.id.clone(),
                Instance {
                    id: o.id.clone(),
                    pool: o.pool.clone(),
                    phase,
                    created_at: o.created_at,
                },
            );
            outcome.adopted.push(o.id.clone());
        }

        instances.retain(|id, instance| {
            let gone = !seen.contains(id) && instance.created_at < listed_at;
            if gone {
                info!(instance_id = %id, phase = ?instance.phase, "Pod no longer on platform");
                outcome.removed.push(id.clone());
            }
            !gone
        });

        outcome
    }
}
