//! Error taxonomy for the controller.
//!
//! Raw transport and I/O failures are converted into one of these kinds at
//! the collaborator boundary; nothing below this module returns a bare
//! `reqwest::Error` or `std::io::Error`.

use std::path::PathBuf;

use podpool_id::{IdError, InstanceId, PoolName};
use podpool_reconcile::ReconcileError;
use thiserror::Error;

/// Errors from the upstream scheduler's control API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler answered with a non-success status.
    #[error("scheduler {operation} failed with status {status}: {body}")]
    UpstreamUnavailable {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// The request never produced a response (connect error, timeout).
    #[error("scheduler {operation} request failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// The scheduler answered but the body could not be decoded.
    #[error("scheduler {operation} returned an undecodable body: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

/// Errors from the container platform.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform {operation} request failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("platform {operation} rejected with status {status}: {body}")]
    Rejected {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("platform {operation} returned an undecodable body: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    /// The instance shape cannot be turned into a pod.
    #[error("invalid instance shape: {0}")]
    InvalidShape(String),
}

/// Errors surfaced by the provisioner to whatever dispatched the request.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The pool is at its pending-instance ceiling. Expected; try later.
    #[error("pool {pool} is at its pending-instance ceiling")]
    CapacityExhausted { pool: PoolName },

    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("cannot generate instance id: {0}")]
    InvalidId(#[from] IdError),
}

impl ProvisionError {
    /// Returns true for the expected "cannot fulfill now" outcome.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Self::CapacityExhausted { .. })
    }
}

/// Errors that abort a reconciliation sweep.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Plan(#[from] ReconcileError),
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(String),

    #[error("invalid configuration value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
