//! Typed ID definitions for the node agent's resources.

use crate::{define_id, define_opaque_id, IdError};

// =============================================================================
// Generated IDs (minted on the agent)
// =============================================================================

// One run of an executor. A fresh ContainerId disambiguates re-launches of
// the same ExecutorId and names the run's sandbox and checkpoint directory.
define_id!(ContainerId, "run");

// One status update. The master acknowledges an update by echoing its
// UpdateId; streams deduplicate on it.
define_id!(UpdateId, "su");

// =============================================================================
// Assigned IDs (opaque strings from master / frameworks)
// =============================================================================

define_opaque_id!(AgentId);
define_opaque_id!(FrameworkId);
define_opaque_id!(ExecutorId);
define_opaque_id!(TaskId);

/// Validates an externally-assigned ID value.
///
/// These values become checkpoint directory names, so anything that could
/// escape the directory tree or break a path is rejected.
pub fn validate_opaque(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > 255 {
        return Err(IdError::TooLong { length: s.len() });
    }
    if s == "." || s == ".." {
        return Err(IdError::InvalidFormat {
            message: format!("'{s}' is a reserved path component"),
        });
    }
    for c in s.chars() {
        if c == '/' || c == '\\' || c == '\0' || c.is_whitespace() {
            return Err(IdError::InvalidCharacter { character: c });
        }
    }
    Ok(())
}
