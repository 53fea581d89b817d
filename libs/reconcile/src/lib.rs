//! Reconciliation primitives for the podpool controller.
//!
//! This library holds the pure decision logic behind the controller's
//! periodic loops. Nothing here performs I/O; the controller feeds in a
//! snapshot and executes the resulting plan. Key concepts:
//!
//! - **Fleet**: the pods the controller believes exist (from its registry).
//! - **Agents**: the build agents the scheduler knows about.
//! - **Sweep**: one pass that compares the two and decides corrective actions.
//! - **Admission target**: how many new pending pods a pool may admit.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Planning a sweep twice over unchanged inputs yields the same plan
//! - An admission target is never negative

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use podpool_id::InstanceId;
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A configured duration cannot be represented as a wall-clock offset.
    #[error("duration {0:?} is out of range")]
    DurationOutOfRange(Duration),

    /// A saga was advanced after it had already finished.
    #[error("saga already finished in stage {0:?}")]
    SagaFinished(SagaStage),
}

/// Convergence status of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Fleet and scheduler agree; nothing was done.
    Converged,

    /// Corrective actions were issued and all succeeded.
    Converging,

    /// At least one corrective action failed; the next sweep retries.
    Degraded,
}

impl ConvergenceStatus {
    /// Returns true if the fleet has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

// =============================================================================
// Admission arithmetic
// =============================================================================

/// What the admission semaphore of a pool should be driven to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionTarget {
    /// No capacity left; permits must be forced to zero immediately.
    Drain,

    /// The pool may hold exactly this many acquirable permits.
    Permits(u32),
}

impl AdmissionTarget {
    /// Compute the target for a pool.
    ///
    /// `in_flight` counts permits handed out whose pods are not yet
    /// recorded as pending.
    pub fn compute(ceiling: u32, pending: usize, in_flight: usize) -> Self {
        let used = pending.saturating_add(in_flight);
        let available = i64::from(ceiling) - i64::try_from(used).unwrap_or(i64::MAX);
        if available <= 0 {
            Self::Drain
        } else {
            // available <= ceiling, which fits in u32
            Self::Permits(available as u32)
        }
    }

    /// The permit count this target resolves to.
    pub fn permits(&self) -> u32 {
        match self {
            Self::Drain => 0,
            Self::Permits(n) => *n,
        }
    }
}

// =============================================================================
// Sweep classification
// =============================================================================

/// A registry entry as seen by the sweep planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetMember {
    pub id: InstanceId,
    pub created_at: DateTime<Utc>,

    /// Terminating members are still live (their pod exists) but are never
    /// reported as stuck again.
    pub terminating: bool,
}

/// Result of classifying one sweep's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan<A> {
    /// Agents with a matching live instance.
    pub healthy: Vec<A>,

    /// Agents with no matching live instance; to be disabled then deleted.
    pub orphaned: Vec<A>,

    /// Instances with no agent past the registration timeout; to be terminated.
    pub stuck: Vec<InstanceId>,
}

impl<A> SweepPlan<A> {
    /// Returns true if the plan issues no corrective action.
    pub fn is_noop(&self) -> bool {
        self.orphaned.is_empty() && self.stuck.is_empty()
    }
}

/// Classify agents and fleet members for one sweep.
///
/// Agents for which `instance_of` returns `None` are not managed by this
/// controller and are ignored entirely.
pub fn plan_sweep<A, F>(
    agents: Vec<A>,
    fleet: &[FleetMember],
    now: DateTime<Utc>,
    register_timeout: Duration,
    instance_of: F,
) -> Result<SweepPlan<A>, ReconcileError>
where
    F: Fn(&A) -> Option<&InstanceId>,
{
    let timeout = chrono::Duration::from_std(register_timeout)
        .map_err(|_| ReconcileError::DurationOutOfRange(register_timeout))?;

    let live: HashSet<&InstanceId> = fleet.iter().map(|m| &m.id).collect();

    let mut healthy = Vec::new();
    let mut orphaned = Vec::new();
    let mut registered: HashSet<InstanceId> = HashSet::new();

    for agent in agents {
        let Some(id) = instance_of(&agent) else {
            continue;
        };
        if live.contains(id) {
            registered.insert(id.clone());
            healthy.push(agent);
        } else {
            orphaned.push(agent);
        }
    }

    let stuck = fleet
        .iter()
        .filter(|m| !m.terminating)
        .filter(|m| !registered.contains(&m.id))
        .filter(|m| now - m.created_at > timeout)
        .map(|m| m.id.clone())
        .collect();

    Ok(SweepPlan {
        healthy,
        orphaned,
        stuck,
    })
}

// =============================================================================
// Orphan saga
// =============================================================================

/// Stage of the disable-then-delete saga for orphaned agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStage {
    /// Waiting for the batched disable call.
    Disabling,

    /// Disable succeeded; waiting for the batched delete call.
    Deleting,

    /// Both calls succeeded (or there was nothing to do).
    Completed,

    /// Disable failed; delete is skipped until the next sweep.
    DisableFailed,

    /// Disable succeeded but delete failed; agents stay disabled.
    DeleteFailed,
}

/// The call a saga wants issued next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStep {
    Disable,
    Delete,
}

/// Two-step saga retiring orphaned agents.
///
/// The saga holds no state across sweeps: a failed saga is simply planned
/// again from scratch on the next sweep, and both steps are idempotent on
/// the scheduler side.
#[derive(Debug, Clone)]
pub struct OrphanSaga<A> {
    agents: Vec<A>,
    stage: SagaStage,
}

impl<A> OrphanSaga<A> {
    /// Start a saga. An empty batch completes immediately.
    pub fn new(agents: Vec<A>) -> Self {
        let stage = if agents.is_empty() {
            SagaStage::Completed
        } else {
            SagaStage::Disabling
        };
        Self { agents, stage }
    }

    pub fn agents(&self) -> &[A] {
        &self.agents
    }

    pub fn stage(&self) -> SagaStage {
        self.stage
    }

    /// The next call to issue, or `None` once the saga has finished.
    pub fn next_step(&self) -> Option<SagaStep> {
        match self.stage {
            SagaStage::Disabling => Some(SagaStep::Disable),
            SagaStage::Deleting => Some(SagaStep::Delete),
            _ => None,
        }
    }

    /// Record the outcome of the step returned by `next_step`.
    pub fn record(&mut self, succeeded: bool) -> Result<SagaStage, ReconcileError> {
        self.stage = match (self.stage, succeeded) {
            (SagaStage::Disabling, true) => SagaStage::Deleting,
            (SagaStage::Disabling, false) => SagaStage::DisableFailed,
            (SagaStage::Deleting, true) => SagaStage::Completed,
            (SagaStage::Deleting, false) => SagaStage::DeleteFailed,
            (finished, _) => return Err(ReconcileError::SagaFinished(finished)),
        };
        Ok(self.stage)
    }

    /// Returns true if both steps succeeded.
    pub fn is_completed(&self) -> bool {
        self.stage == SagaStage::Completed
    }
}

/// Default interval between reconciliation sweeps.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between admission recomputations.
pub const DEFAULT_ADMISSION_INTERVAL: Duration = Duration::from_secs(5);

/// Default time a pod may run without registering as an agent.
pub const DEFAULT_AUTO_REGISTER_TIMEOUT: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default ceiling on simultaneously pending pods.
pub const DEFAULT_MAX_PENDING_INSTANCES: u32 = 10;
