//! # armada-id
//!
//! Typed identifiers for the armada cluster manager.
//!
//! Two families of IDs exist on a node agent:
//!
//! - **Generated IDs** are minted locally and use a prefixed format
//!   `{prefix}_{ulid}` (e.g. `run_01HV4Z2WQXKJNM8GPQY6VBKC3D`). The ULID
//!   makes them time-ordered, which the agent exploits to find the latest
//!   run of an executor without a `latest` marker on disk.
//! - **Assigned IDs** arrive from the master or a framework scheduler and
//!   are opaque strings. The agent only validates that they are safe to
//!   embed in checkpoint directory names.
//!
//! Both families are typed to prevent mixing different resource kinds.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
