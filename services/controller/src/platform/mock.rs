//! In-memory platform for tests and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use podpool_id::{InstanceId, PoolName};
use tokio::sync::Mutex;
use tracing::info;

use super::{InstanceShape, ObservedInstance, Platform};
use crate::error::PlatformError;

/// Mock platform.
#[derive(Debug, Default)]
pub struct MockPlatform {
    pods: Mutex<HashMap<InstanceId, ObservedInstance>>,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
    fail_lists: AtomicBool,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock platform that fails all creates.
    pub fn failing() -> Self {
        let platform = Self::new();
        platform.set_fail_creates(true);
        platform
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Mark a pod as ready, as the kubelet would.
    pub async fn set_ready(&self, id: &InstanceId) {
        if let Some(pod) = self.pods.lock().await.get_mut(id) {
            pod.ready = true;
        }
    }

    /// Mark a pod as failed, as the kubelet would after its containers die.
    pub async fn set_failed(&self, id: &InstanceId) {
        if let Some(pod) = self.pods.lock().await.get_mut(id) {
            pod.ready = false;
            pod.terminal = true;
        }
    }

    /// Put a pod on the platform without going through `create_instance`.
    pub async fn insert(&self, pod: ObservedInstance) {
        self.pods.lock().await.insert(pod.id.clone(), pod);
    }

    /// Remove a pod behind the controller's back (eviction, node loss).
    pub async fn evict(&self, id: &InstanceId) {
        self.pods.lock().await.remove(id);
    }

    pub async fn contains(&self, id: &InstanceId) -> bool {
        self.pods.lock().await.contains_key(id)
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn create_instance(
        &self,
        id: &InstanceId,
        pool: &PoolName,
        _shape: &InstanceShape,
    ) -> Result<ObservedInstance, PlatformError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(PlatformError::Rejected {
                operation: "create",
                status: 500,
                body: "mock platform configured to fail".to_string(),
            });
        }

        info!(instance_id = %id, pool = %pool, "[MOCK] Creating pod");
        let pod = ObservedInstance {
            id: id.clone(),
            pool: pool.clone(),
            ready: false,
            terminal: false,
            created_at: Utc::now(),
        };
        self.pods.lock().await.insert(id.clone(), pod.clone());
        Ok(pod)
    }

    async fn delete_instance(&self, id: &InstanceId) -> Result<(), PlatformError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(PlatformError::Request {
                operation: "delete",
                message: "mock platform configured to fail".to_string(),
            });
        }

        info!(instance_id = %id, "[MOCK] Deleting pod");
        self.pods.lock().await.remove(id);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<ObservedInstance>, PlatformError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(PlatformError::Request {
                operation: "list",
                message: "mock platform configured to fail".to_string(),
            });
        }
        Ok(self.pods.lock().await.values().cloned().collect())
    }
}
