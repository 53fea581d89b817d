//! Container platform interface.
//!
//! The platform abstracts pod lifecycle operations:
//! - Creating a pod for a pool with an opaque shape
//! - Deleting a pod
//! - Listing the pods this controller manages
//!
//! `KubernetesPlatform` talks to a real cluster; `MockPlatform` is used in
//! tests and local development.

mod kubernetes;
mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use podpool_id::{InstanceId, PoolName};

use crate::error::PlatformError;

pub use kubernetes::{KubernetesPlatform, MANAGED_BY_LABEL, POOL_LABEL};
pub use mock::MockPlatform;

/// Instance-shape parameters, passed through to the platform untouched.
pub type InstanceShape = serde_json::Value;

/// A pod as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedInstance {
    pub id: InstanceId,
    pub pool: PoolName,
    pub ready: bool,

    /// The pod has stopped for good (failed or succeeded) and will never
    /// serve an agent again.
    pub terminal: bool,

    pub created_at: DateTime<Utc>,
}

/// Platform interface.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Create a pod named `id` in `pool`.
    async fn create_instance(
        &self,
        id: &InstanceId,
        pool: &PoolName,
        shape: &InstanceShape,
    ) -> Result<ObservedInstance, PlatformError>;

    /// Delete a pod. Deleting a pod that no longer exists succeeds.
    async fn delete_instance(&self, id: &InstanceId) -> Result<(), PlatformError>;

    /// List every pod managed by this controller.
    async fn list_instances(&self) -> Result<Vec<ObservedInstance>, PlatformError>;
}
