//! podpool controller library.
//!
//! This crate primarily ships a `podpool-controller` binary, but we expose
//! the library surface to enable integration testing and reuse.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod platform;
pub mod provisioner;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use admission::{AdmissionController, AdmissionPermit, AdmissionStatus};
pub use platform::{KubernetesPlatform, MockPlatform, Platform};
pub use provisioner::Provisioner;
pub use reconciler::{Reconciler, ReconcilerConfig, SweepReport};
pub use registry::{Instance, InstancePhase, InstanceRegistry};
pub use scheduler::{HttpSchedulerClient, MockScheduler, SchedulerApi};
