//! # podpool-id
//!
//! Validated name types for the podpool controller.
//!
//! ## Design Principles
//!
//! - Names are opaque strings owned by external systems (the container
//!   platform and the scheduler); this crate only guarantees they are
//!   well-formed before they reach the core
//! - Parsing is strict; a parsed name always formats back to the same string
//! - Names are typed so a pool can never be passed where a pod name is expected
//!
//! ## Name Formats
//!
//! - `InstanceId`: a pod name, DNS-1123 subdomain rules
//!   (`podpool-8f14e45fceea4c5b9a3b2d0e1f7c6a90`)
//! - `PoolName`: a profile name (`linux-large`, `dotnet_8`)
//! - `AgentUuid`: the scheduler's agent identifier, opaque but non-blank

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
