//! Name type definitions for pods, pools, and scheduler agents.

use crate::{define_name, IdError};

/// Maximum length of a pod name (DNS-1123 subdomain).
pub const MAX_INSTANCE_ID_LEN: usize = 253;

/// Maximum length of a pool (profile) name.
pub const MAX_POOL_NAME_LEN: usize = 63;

/// Maximum length of a scheduler agent uuid.
pub const MAX_AGENT_UUID_LEN: usize = 128;

// =============================================================================
// Instances
// =============================================================================

define_name!(InstanceId, "instance id", validate_instance_id);

impl InstanceId {
    /// Generates a fresh pod name of the form `{prefix}-{uuid}`.
    pub fn generate(prefix: &str) -> Result<Self, IdError> {
        Self::parse(&format!("{prefix}-{}", uuid::Uuid::new_v4().simple()))
    }
}

fn validate_instance_id(kind: &'static str, s: &str) -> Result<(), IdError> {
    check_length(kind, s, MAX_INSTANCE_ID_LEN)?;
    check_chars(kind, s, |c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.'
    })?;
    check_boundaries(kind, s, |c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

// =============================================================================
// Pools
// =============================================================================

define_name!(PoolName, "pool name", validate_pool_name);

fn validate_pool_name(kind: &'static str, s: &str) -> Result<(), IdError> {
    check_length(kind, s, MAX_POOL_NAME_LEN)?;
    check_chars(kind, s, |c| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
    })?;
    check_boundaries(kind, s, |c| c.is_ascii_alphanumeric())
}

// =============================================================================
// Scheduler agents
// =============================================================================

define_name!(AgentUuid, "agent uuid", validate_agent_uuid);

fn validate_agent_uuid(kind: &'static str, s: &str) -> Result<(), IdError> {
    check_length(kind, s, MAX_AGENT_UUID_LEN)?;
    check_chars(kind, s, |c| c.is_ascii_graphic())
}

// =============================================================================
// Shared checks
// =============================================================================

fn check_length(kind: &'static str, s: &str, max: usize) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty { kind });
    }
    let actual = s.chars().count();
    if actual > max {
        return Err(IdError::TooLong { kind, max, actual });
    }
    Ok(())
}

fn check_chars(kind: &'static str, s: &str, allowed: impl Fn(char) -> bool) -> Result<(), IdError> {
    match s.chars().enumerate().find(|(_, c)| !allowed(*c)) {
        Some((position, ch)) => Err(IdError::InvalidCharacter { kind, ch, position }),
        None => Ok(()),
    }
}

fn check_boundaries(
    kind: &'static str,
    s: &str,
    edge: impl Fn(char) -> bool,
) -> Result<(), IdError> {
    let first = s.chars().next();
    let last = s.chars().last();
    match (first, last) {
        (Some(first), Some(last)) if edge(first) && edge(last) => Ok(()),
        _ => Err(IdError::InvalidBoundary { kind }),
    }
}
