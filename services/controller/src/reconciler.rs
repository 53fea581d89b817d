//! Reconciliation loop for converging the fleet with the scheduler.
//!
//! Each sweep:
//! - Lists the scheduler's agents (a failure aborts the sweep)
//! - Refreshes the registry from the platform (best-effort)
//! - Deletes pods already terminating, including pods that stopped for good
//! - Promotes ready, registered pods to running
//! - Disables then deletes agents whose pod is gone
//! - Terminates pods that never registered in time
//!
//! A sweep holds no state across runs; whatever it fails to do is planned
//! again from scratch on the next tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use podpool_id::InstanceId;
use podpool_reconcile::{
    plan_sweep, ConvergenceStatus, OrphanSaga, SagaStage, SagaStep, DEFAULT_AUTO_REGISTER_TIMEOUT,
    DEFAULT_RECONCILE_INTERVAL,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::SweepError;
use crate::platform::Platform;
use crate::registry::InstanceRegistry;
use crate::scheduler::{AgentRecord, SchedulerApi};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between sweeps.
    pub reconcile_interval: Duration,

    /// How long a pod may exist without a matching agent.
    pub auto_register_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            auto_register_timeout: DEFAULT_AUTO_REGISTER_TIMEOUT,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub agents_seen: usize,
    pub adopted: Vec<InstanceId>,
    pub vanished: Vec<InstanceId>,
    pub failed: Vec<InstanceId>,
    pub promoted: Vec<InstanceId>,
    pub orphaned_agents: usize,
    pub orphan_stage: SagaStage,
    pub stuck: Vec<InstanceId>,
    pub terminated: Vec<InstanceId>,
    pub termination_failures: usize,
    pub platform_refreshed: bool,
}

impl SweepReport {
    pub fn status(&self) -> ConvergenceStatus {
        let failed = self.termination_failures > 0
            || matches!(
                self.orphan_stage,
                SagaStage::DisableFailed | SagaStage::DeleteFailed
            );
        if failed || !self.platform_refreshed {
            ConvergenceStatus::Degraded
        } else if self.orphaned_agents == 0 && self.terminated.is_empty() {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Converging
        }
    }
}

/// Reconciler for converging fleet and scheduler state.
pub struct Reconciler {
    scheduler: Arc<dyn SchedulerApi>,
    platform: Arc<dyn Platform>,
    registry: Arc<InstanceRegistry>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        scheduler: Arc<dyn SchedulerApi>,
        platform: Arc<dyn Platform>,
        registry: Arc<InstanceRegistry>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            scheduler,
            platform,
            registry,
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            auto_register_timeout_secs = self.config.auto_register_timeout.as_secs(),
            "Starting reconciliation loop"
        );

        let mut reconcile_interval = tokio::time::interval(self.config.reconcile_interval);

        loop {
            tokio::select! {
                _ = reconcile_interval.tick() => {
                    match self.sweep().await {
                        Ok(report) => debug!(status = ?report.status(), "Sweep finished"),
                        Err(e) => debug!(error = %e, "Sweep aborted, will retry next interval"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single sweep.
    pub async fn sweep(&self) -> Result<SweepReport, SweepError> {
        debug!("Starting sweep");

        let agents = match self.scheduler.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                error!(error = %e, "Failed to list agents, aborting sweep");
                return Err(e.into());
            }
        };
        let agents_seen = agents.len();

        // Refresh from the platform.
        let listed_at = Utc::now();
        let (platform_refreshed, adopted, vanished, failed, ready) =
            match self.platform.list_instances().await {
                Ok(observed) => {
                    let ready: HashSet<InstanceId> = observed
                        .iter()
                        .filter(|o| o.ready)
                        .map(|o| o.id.clone())
                        .collect();
                    let outcome = self.registry.apply_observations(&observed, listed_at).await;
                    (true, outcome.adopted, outcome.removed, outcome.failed, ready)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to list pods, using registry as-is");
                    (false, Vec::new(), Vec::new(), Vec::new(), HashSet::new())
                }
            };

        // Pods removed here no longer vouch for their agents below.
        let (mut terminated, mut termination_failures) =
            self.delete_instances(self.registry.terminating().await).await;

        // Promote.
        let registered_and_ready: HashSet<InstanceId> = agents
            .iter()
            .filter_map(|a| a.instance_id.clone())
            .filter(|id| ready.contains(id))
            .collect();
        let promoted = self.registry.promote(&registered_and_ready).await;
        for id in &promoted {
            info!(instance_id = %id, "Instance is running");
        }

        // Classify.
        let fleet = self.registry.fleet().await;
        let plan = plan_sweep(
            agents,
            &fleet,
            Utc::now(),
            self.config.auto_register_timeout,
            |a| a.instance_id.as_ref(),
        )?;

        let orphaned_agents = plan.orphaned.len();
        let orphan_stage = self.retire_orphans(OrphanSaga::new(plan.orphaned)).await?;

        for id in &plan.stuck {
            warn!(instance_id = %id, "Instance never registered as an agent, terminating");
            self.registry.mark_terminating(id).await;
        }
        let (stuck_terminated, stuck_failures) = self.delete_instances(plan.stuck.clone()).await;
        terminated.extend(stuck_terminated);
        termination_failures += stuck_failures;

        let report = SweepReport {
            agents_seen,
            adopted,
            vanished,
            failed,
            promoted,
            orphaned_agents,
            orphan_stage,
            stuck: plan.stuck,
            terminated,
            termination_failures,
            platform_refreshed,
        };
        info!(
            agents = report.agents_seen,
            orphaned = report.orphaned_agents,
            stuck = report.stuck.len(),
            terminated = report.terminated.len(),
            status = ?report.status(),
            "Sweep complete"
        );
        Ok(report)
    }

    /// Disable, then delete, the orphaned agents.
    async fn retire_orphans(
        &self,
        mut saga: OrphanSaga<AgentRecord>,
    ) -> Result<SagaStage, SweepError> {
        while let Some(step) = saga.next_step() {
            let result = match step {
                SagaStep::Disable => {
                    info!(count = saga.agents().len(), "Disabling orphaned agents");
                    self.scheduler.disable_agents(saga.agents()).await
                }
                SagaStep::Delete => {
                    info!(count = saga.agents().len(), "Deleting orphaned agents");
                    self.scheduler.delete_agents(saga.agents()).await
                }
            };
            if let Err(e) = &result {
                error!(?step, error = %e, "Orphan cleanup step failed, will retry next sweep");
            }
            saga.record(result.is_ok())?;
        }
        Ok(saga.stage())
    }

    /// Delete the given pods, removing those the platform confirms.
    async fn delete_instances(&self, ids: Vec<InstanceId>) -> (Vec<InstanceId>, usize) {
        let mut terminated = Vec::new();
        let mut failures = 0;

        for id in ids {
            match self.platform.delete_instance(&id).await {
                Ok(()) => {
                    self.registry.remove(&id).await;
                    info!(instance_id = %id, "Terminated instance");
                    terminated.push(id);
                }
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "Failed to delete pod, will retry");
                    failures += 1;
                }
            }
        }

        (terminated, failures)
    }
}
