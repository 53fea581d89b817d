//! Admission control for pending pods.
//!
//! Each pool has a gate holding a count of acquirable permits. A permit
//! lets one caller create one pod. The count is recomputed periodically from
//! the registry's pending count and the pool's ceiling:
//!
//! - no headroom: permits are drained to zero at once
//! - headroom: permits are raised to it, or lowered to it with a
//!   compare-and-swap that never revokes a permit already handed out
//!
//! Permits handed out but not yet committed are tracked as in flight and
//! count against the headroom, so a recompute never re-issues them.
//!
//! Acquire and release are lock-free. Recompute is serialized per pool and
//! never waits on an acquisition; it retries if the count moves under it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use podpool_id::PoolName;
use podpool_reconcile::AdmissionTarget;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use crate::config::PoolCeilings;
use crate::registry::InstanceRegistry;

/// Per-pool permit state.
#[derive(Debug, Default)]
struct PoolGate {
    permits: AtomicI64,

    /// Permits handed out whose pods are not yet in the registry.
    in_flight: AtomicI64,

    /// Serializes recompute for this pool.
    recompute: Mutex<()>,
}

impl PoolGate {
    fn try_take(&self) -> bool {
        // Counted as in flight before the permit leaves the pool, so a
        // concurrent recompute can only undercount headroom.
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let mut current = self.permits.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn give_back(&self) {
        self.permits.fetch_add(1, Ordering::AcqRel);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    fn settle(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Drive permits from `observed` to `target`.
    ///
    /// Fails if the count moved since it was observed. A drain always
    /// succeeds.
    fn apply(&self, observed: i64, target: AdmissionTarget) -> bool {
        match target {
            AdmissionTarget::Drain => {
                self.permits.swap(0, Ordering::AcqRel);
                true
            }
            AdmissionTarget::Permits(n) => {
                let target = i64::from(n);
                observed == target
                    || self
                        .permits
                        .compare_exchange(observed, target, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
            }
        }
    }
}

/// Permission to create one pod.
///
/// Dropping the permit without calling [`AdmissionPermit::commit`] returns it
/// to the pool, which is the compensating action for a failed create.
#[must_use = "dropping a permit immediately returns it to the pool"]
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<PoolGate>,
    pool: PoolName,
    settled: bool,
}

impl AdmissionPermit {
    pub fn pool(&self) -> &PoolName {
        &self.pool
    }

    /// Consume the permit once the pod is recorded as pending.
    pub fn commit(mut self) {
        self.settled = true;
        self.gate.settle();
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.settled {
            debug!(pool = %self.pool, "Returning unused admission permit");
            self.gate.give_back();
        }
    }
}

/// Admission state of a pool, for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStatus {
    pub pool: PoolName,
    pub ceiling: u32,
    pub pending: usize,
    pub in_flight: i64,
    pub available_permits: i64,
}

/// Per-pool admission semaphore.
pub struct AdmissionController {
    registry: Arc<InstanceRegistry>,
    ceilings: PoolCeilings,
    gates: RwLock<HashMap<PoolName, Arc<PoolGate>>>,
}

impl AdmissionController {
    pub fn new(registry: Arc<InstanceRegistry>, ceilings: PoolCeilings) -> Self {
        Self {
            registry,
            ceilings,
            gates: RwLock::new(HashMap::new()),
        }
    }

    async fn gate(&self, pool: &PoolName) -> Option<Arc<PoolGate>> {
        self.gates.read().await.get(pool).cloned()
    }

    /// Returns the gate and whether it was just created.
    async fn gate_or_insert(&self, pool: &PoolName) -> (Arc<PoolGate>, bool) {
        if let Some(gate) = self.gate(pool).await {
            return (gate, false);
        }
        let mut gates = self.gates.write().await;
        match gates.get(pool) {
            Some(gate) => (Arc::clone(gate), false),
            None => {
                let gate = Arc::new(PoolGate::default());
                gates.insert(pool.clone(), Arc::clone(&gate));
                (gate, true)
            }
        }
    }

    /// Make sure a pool has a gate, computing its first permit count.
    pub async fn ensure_pool(&self, pool: &PoolName) {
        let (_, created) = self.gate_or_insert(pool).await;
        if created {
            self.recompute(pool).await;
        }
    }

    /// Try to take a permit without waiting.
    ///
    /// `None` means the pool is at capacity (or was never recomputed).
    pub async fn try_acquire(&self, pool: &PoolName) -> Option<AdmissionPermit> {
        let gate = self.gate(pool).await?;
        if !gate.try_take() {
            return None;
        }
        Some(AdmissionPermit {
            gate,
            pool: pool.clone(),
            settled: false,
        })
    }

    /// Recompute the permit count of one pool.
    pub async fn recompute(&self, pool: &PoolName) -> AdmissionTarget {
        let (gate, _) = self.gate_or_insert(pool).await;
        let _serialized = gate.recompute.lock().await;
        let ceiling = self.ceilings.ceiling_for(pool);

        // Read order matters: permits, then in-flight, then pending. A
        // permit committed in between is then seen in at least one count.
        loop {
            let previous = gate.permits.load(Ordering::Acquire);
            let in_flight = usize::try_from(gate.in_flight.load(Ordering::Acquire)).unwrap_or(0);
            let pending = self.registry.pending_count(pool).await;

            let target = AdmissionTarget::compute(ceiling, pending, in_flight);
            if !gate.apply(previous, target) {
                continue;
            }

            if previous != i64::from(target.permits()) {
                debug!(
                    pool = %pool,
                    ceiling,
                    pending,
                    in_flight,
                    previous,
                    permits = target.permits(),
                    "Adjusted admission permits"
                );
            }
            return target;
        }
    }

    /// Recompute every known pool.
    pub async fn recompute_all(&self) {
        let mut pools: BTreeSet<PoolName> = self.registry.pools().await;
        pools.extend(self.ceilings.configured_pools().cloned());
        pools.extend(self.gates.read().await.keys().cloned());

        for pool in &pools {
            self.recompute(pool).await;
        }
    }

    /// Currently acquirable permits; zero for an unknown pool.
    pub async fn available_permits(&self, pool: &PoolName) -> i64 {
        match self.gate(pool).await {
            Some(gate) => gate.permits.load(Ordering::Acquire),
            None => 0,
        }
    }

    pub async fn status(&self, pool: &PoolName) -> AdmissionStatus {
        let in_flight = match self.gate(pool).await {
            Some(gate) => gate.in_flight.load(Ordering::Acquire),
            None => 0,
        };
        AdmissionStatus {
            pool: pool.clone(),
            ceiling: self.ceilings.ceiling_for(pool),
            pending: self.registry.pending_count(pool).await,
            in_flight,
            available_permits: self.available_permits(pool).await,
        }
    }

    /// Run the periodic recompute loop until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting admission loop"
        );

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.recompute_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Admission loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
