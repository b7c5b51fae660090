//! The authoritative in-memory model of frameworks, executors, and tasks.
//!
//! Handlers resolve entities through the registry by explicit id; nothing
//! holds references across messages. Completed entities move into bounded
//! rings owned by their parent, so history is kept without unbounded
//! growth and without back-pointers.

mod executor;
mod framework;
mod task;

pub use executor::{Executor, ExecutorInfo};
pub use framework::{Framework, FrameworkInfo, COMMAND_EXECUTOR_NAME};
pub use task::{CommandInfo, StatusUpdate, Task, TaskInfo, TaskState};

use std::collections::{HashMap, VecDeque};

use armada_id::{AgentId, FrameworkId};
use serde::{Deserialize, Serialize};

use crate::resources::Resources;

/// Identity of this node, assigned its id by the master on first
/// registration and persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    pub hostname: String,
    pub resources: Resources,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// A bounded ring of completed entities: pushing past capacity drops the
/// oldest entry.
#[derive(Debug)]
pub struct CompletedRing<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> CompletedRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn latest(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

/// Counters kept by the agent for introspection.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Statistics {
    pub tasks: HashMap<TaskState, u64>,
    pub valid_status_updates: u64,
    pub invalid_status_updates: u64,
    pub valid_framework_messages: u64,
    pub invalid_framework_messages: u64,
}

impl Statistics {
    pub fn record_task_state(&mut self, state: TaskState) {
        *self.tasks.entry(state).or_insert(0) += 1;
    }
}

/// Registry of frameworks with live executors on this agent.
#[derive(Debug)]
pub struct Registry {
    frameworks: HashMap<FrameworkId, Framework>,
    completed_frameworks: CompletedRing<Framework>,
    pub stats: Statistics,
}

impl Registry {
    pub fn new(max_completed_frameworks: usize) -> Self {
        Self {
            frameworks: HashMap::new(),
            completed_frameworks: CompletedRing::new(max_completed_frameworks),
            stats: Statistics::default(),
        }
    }

    pub fn framework(&self, id: &FrameworkId) -> Option<&Framework> {
        self.frameworks.get(id)
    }

    pub fn framework_mut(&mut self, id: &FrameworkId) -> Option<&mut Framework> {
        self.frameworks.get_mut(id)
    }

    /// Returns the framework, creating it on first task arrival.
    pub fn ensure_framework(
        &mut self,
        id: FrameworkId,
        info: FrameworkInfo,
        scheduler_endpoint: Option<String>,
        max_completed_executors: usize,
    ) -> &mut Framework {
        self.frameworks.entry(id.clone()).or_insert_with(|| {
            Framework::new(id, info, scheduler_endpoint, max_completed_executors)
        })
    }

    pub fn insert_framework(&mut self, framework: Framework) {
        self.frameworks
            .insert(framework.framework_id.clone(), framework);
    }

    /// Removes a framework and archives it.
    pub fn remove_framework(&mut self, id: &FrameworkId) -> bool {
        if let Some(framework) = self.frameworks.remove(id) {
            self.completed_frameworks.push(framework);
            true
        } else {
            false
        }
    }

    pub fn frameworks(&self) -> impl Iterator<Item = &Framework> {
        self.frameworks.values()
    }

    pub fn frameworks_mut(&mut self) -> impl Iterator<Item = &mut Framework> {
        self.frameworks.values_mut()
    }

    pub fn framework_ids(&self) -> Vec<FrameworkId> {
        self.frameworks.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.frameworks.is_empty()
    }
}
