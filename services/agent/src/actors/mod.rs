//! Actor implementations.
//!
//! - `core`: the actor runtime (mailboxes, handles, timers-as-messages)
//! - `agent`: the agent actor orchestrating everything on this node
//! - `status_update`: the reliable status-update delivery pipeline

pub mod agent;
pub mod core;
pub mod status_update;

pub use agent::{spawn_agent, Agent, AgentHandles, AgentMessage, AgentSnapshot, RegistrationState};
pub use core::{spawn, Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy, Flow};
pub use status_update::{
    AckedUpdate, RecoveredStream, StatusUpdateManager, UpdateManagerMessage,
};
