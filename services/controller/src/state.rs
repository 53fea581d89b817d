//! Application state shared across request handlers.

use std::sync::Arc;

use crate::admission::AdmissionController;
use crate::provisioner::Provisioner;
use crate::registry::InstanceRegistry;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<InstanceRegistry>,
    admission: Arc<AdmissionController>,
    provisioner: Arc<Provisioner>,
}

impl AppState {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        admission: Arc<AdmissionController>,
        provisioner: Arc<Provisioner>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                admission,
                provisioner,
            }),
        }
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.inner.provisioner
    }
}
