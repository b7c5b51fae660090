//! Task model: the unit of work and its state machine.

use armada_id::{ExecutorId, FrameworkId, TaskId, UpdateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::registry::executor::ExecutorInfo;
use crate::resources::Resources;

/// Task lifecycle states.
///
/// `Staging` covers both queued-on-agent and dispatched-but-unacknowledged;
/// the terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl TaskState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Failed | TaskState::Killed | TaskState::Lost
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Staging => "staging",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Failed => "failed",
            TaskState::Killed => "killed",
            TaskState::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// A command line run by an executor, with its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    /// Shell command, run as `sh -c '<value>'`.
    pub value: String,

    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl CommandInfo {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            environment: HashMap::new(),
        }
    }
}

/// A task as described by the master in a `RunTask` message.
///
/// Exactly one of `command` and `executor` must be set: either the task
/// carries an inline command (the agent synthesizes a command executor for
/// it) or it names a custom executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl TaskInfo {
    /// A well-formed task names exactly one execution vehicle.
    pub fn is_well_formed(&self) -> bool {
        self.command.is_some() != self.executor.is_some()
    }
}

/// A launched task tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub name: String,
    pub resources: Resources,
    pub state: TaskState,
}

impl Task {
    pub fn from_info(info: &TaskInfo, framework_id: FrameworkId, executor_id: ExecutorId) -> Self {
        Self {
            task_id: info.task_id.clone(),
            framework_id,
            executor_id,
            name: info.name.clone(),
            resources: info.resources,
            state: TaskState::Staging,
        }
    }
}

/// A durably-logged task-state transition.
///
/// Uniquely identified by `update_id`; updates for one task are totally
/// ordered by creation time and the master acknowledges by echoing the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub task_id: TaskId,
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
    pub update_id: UpdateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl StatusUpdate {
    pub fn new(
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        task_id: TaskId,
        state: TaskState,
    ) -> Self {
        Self {
            framework_id,
            executor_id,
            task_id,
            state,
            timestamp: Utc::now(),
            update_id: UpdateId::new(),
            message: None,
            data: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
