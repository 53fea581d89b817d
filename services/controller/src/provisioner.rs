//! Provisioner: creates and releases pods under admission control.

use std::sync::Arc;

use chrono::Utc;
use podpool_id::{InstanceId, PoolName};
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::error::ProvisionError;
use crate::platform::{InstanceShape, Platform};
use crate::registry::InstanceRegistry;

/// Provisioner.
pub struct Provisioner {
    registry: Arc<InstanceRegistry>,
    admission: Arc<AdmissionController>,
    platform: Arc<dyn Platform>,
    instance_prefix: String,
}

impl Provisioner {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        admission: Arc<AdmissionController>,
        platform: Arc<dyn Platform>,
        instance_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            admission,
            platform,
            instance_prefix: instance_prefix.into(),
        }
    }

    /// Create a pod in `pool` if the pool has admission capacity.
    pub async fn provision(
        &self,
        pool: &PoolName,
        shape: &InstanceShape,
    ) -> Result<InstanceId, ProvisionError> {
        self.admission.ensure_pool(pool).await;

        let Some(permit) = self.admission.try_acquire(pool).await else {
            debug!(pool = %pool, "No admission capacity");
            return Err(ProvisionError::CapacityExhausted { pool: pool.clone() });
        };

        let id = InstanceId::generate(&self.instance_prefix)?;

        // On failure the permit drops here and goes back to the pool.
        if let Err(e) = self.platform.create_instance(&id, pool, shape).await {
            warn!(instance_id = %id, pool = %pool, error = %e, "Pod creation failed");
            return Err(e.into());
        }

        // Stamped after the create returns so a platform listing that started
        // earlier never counts this pod as vanished.
        self.registry
            .insert_pending(id.clone(), pool.clone(), Utc::now())
            .await;
        permit.commit();

        info!(instance_id = %id, pool = %pool, "Provisioned pending instance");
        Ok(id)
    }

    /// Explicitly retire an instance.
    ///
    /// If the platform delete fails the instance stays terminating and the
    /// reconciler retries the delete on its next sweep.
    pub async fn release(&self, id: &InstanceId) -> Result<(), ProvisionError> {
        if !self.registry.mark_terminating(id).await {
            return Err(ProvisionError::UnknownInstance(id.clone()));
        }

        if let Err(e) = self.platform.delete_instance(id).await {
            warn!(instance_id = %id, error = %e, "Pod deletion failed, will retry");
            return Err(e.into());
        }

        self.registry.remove(id).await;
        info!(instance_id = %id, "Released instance");
        Ok(())
    }
}
