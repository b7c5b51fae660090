//! armada node agent library.
//!
//! The node agent runs on every machine in an armada cluster. It accepts
//! task assignments from the master, launches executor processes to run
//! them, reports task-state transitions reliably (at-least-once, in order
//! per task), and recovers in-flight work from its checkpoint tree across
//! its own restarts.
//!
//! ## Architecture
//!
//! Cooperating single-threaded actors, wired by `spawn_agent`:
//!
//! ```text
//! Agent ──────────────┐ owns the registry, sequences all events
//! ├── StatusUpdateManager   durable at-least-once update delivery
//! ├── Reaper                observes process exits (children or not)
//! └── Isolator (trait)      launches and destroys executors
//! ```
//!
//! ## Modules
//!
//! - `actors`: the agent and status-update-manager actors plus the runtime
//! - `checkpoint`: on-disk layout, durable records, recovery
//! - `client`: master/executor endpoints (HTTP impl and test mocks)
//! - `registry`: frameworks, executors, tasks and their state machines
//! - `reaper`, `isolator`, `gc`: process and sandbox supervision

pub mod actors;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod gc;
pub mod isolator;
pub mod reaper;
pub mod registry;
pub mod resources;

// Re-export the types most callers need.
pub use actors::{spawn_agent, AgentHandles, AgentMessage, AgentSnapshot, RegistrationState};
pub use client::{MockExecutorEndpoint, MockMasterEndpoint};
pub use config::{Config, RecoverMode};
pub use isolator::{Isolator, MockIsolator, PosixIsolator};
