//! Executor model: one process instance running tasks for a framework.

use std::collections::HashMap;
use std::path::PathBuf;

use armada_id::{ContainerId, ExecutorId, FrameworkId, TaskId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::registry::task::{CommandInfo, Task, TaskInfo, TaskState};
use crate::registry::CompletedRing;
use crate::resources::Resources;

/// Static description of an executor, either supplied by the framework or
/// synthesized for a command task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: ExecutorId,
    pub name: String,
    /// Task or framework this executor was derived from, for display.
    pub source: String,
    pub command: CommandInfo,
    pub resources: Resources,
}

/// A live executor run.
///
/// `container_id` is fresh per launch and disambiguates re-launches of the
/// same executor id; it also names the run's sandbox and checkpoint
/// directories.
#[derive(Debug)]
pub struct Executor {
    pub executor_id: ExecutorId,
    pub framework_id: FrameworkId,
    pub info: ExecutorInfo,
    pub container_id: ContainerId,

    /// Sandbox directory for this run.
    pub directory: PathBuf,

    /// OS process id, known once the isolator has forked.
    pub pid: Option<i32>,

    /// Set when the executor process has called back and registered.
    pub registered: bool,

    /// Set once a shutdown has been initiated; no new tasks are accepted.
    pub shutdown: bool,

    /// Executor reservation plus the sum of launched task resources.
    pub resources: Resources,

    /// Tasks waiting for the executor process to register.
    pub queued_tasks: HashMap<TaskId, TaskInfo>,

    /// Tasks dispatched to the executor process.
    pub launched_tasks: HashMap<TaskId, Task>,

    /// Terminal tasks, most recent last.
    pub completed_tasks: CompletedRing<Task>,
}

impl Executor {
    pub fn new(
        framework_id: FrameworkId,
        info: ExecutorInfo,
        container_id: ContainerId,
        directory: PathBuf,
        max_completed_tasks: usize,
    ) -> Self {
        let resources = info.resources;
        Self {
            executor_id: info.executor_id.clone(),
            framework_id,
            info,
            container_id,
            directory,
            pid: None,
            registered: false,
            shutdown: false,
            resources,
            queued_tasks: HashMap::new(),
            launched_tasks: HashMap::new(),
            completed_tasks: CompletedRing::new(max_completed_tasks),
        }
    }

    /// Queues a task for dispatch once the executor process registers.
    ///
    /// Duplicate task ids within one executor are a programming error: the
    /// agent validates them before tasks reach the registry.
    pub fn queue_task(&mut self, task: TaskInfo) {
        assert!(
            !self.queued_tasks.contains_key(&task.task_id)
                && !self.launched_tasks.contains_key(&task.task_id),
            "duplicate task id {} within executor {}",
            task.task_id,
            self.executor_id,
        );
        self.queued_tasks.insert(task.task_id.clone(), task);
    }

    /// Moves a queued task to launched and accounts for its resources.
    pub fn launch_task(&mut self, info: &TaskInfo) -> &Task {
        assert!(
            !self.launched_tasks.contains_key(&info.task_id),
            "duplicate task id {} within executor {}",
            info.task_id,
            self.executor_id,
        );

        self.queued_tasks.remove(&info.task_id);

        let task = Task::from_info(info, self.framework_id.clone(), self.executor_id.clone());
        self.resources += task.resources;
        self.launched_tasks.insert(info.task_id.clone(), task);
        &self.launched_tasks[&info.task_id]
    }

    /// Removes a task after its terminal update has been acknowledged,
    /// returning its resources to the pool and archiving it.
    pub fn complete_task(&mut self, task_id: &TaskId) {
        self.queued_tasks.remove(task_id);

        if let Some(task) = self.launched_tasks.remove(task_id) {
            self.resources -= task.resources;
            self.completed_tasks.push(task);
        }
    }

    pub fn update_task_state(&mut self, task_id: &TaskId, state: TaskState) {
        match self.launched_tasks.get_mut(task_id) {
            Some(task) => task.state = state,
            None => warn!(
                executor_id = %self.executor_id,
                task_id = %task_id,
                "state change for unknown task"
            ),
        }
    }

    /// Removes and returns every task (queued or launched) that has not
    /// reached a terminal state. Used when the executor terminates and the
    /// remaining tasks must be reconciled; launched tasks in a terminal
    /// state stay behind, awaiting their acknowledgements.
    pub fn drain_live_tasks(&mut self) -> Vec<Task> {
        let mut live = Vec::new();

        for (_, info) in self.queued_tasks.drain() {
            live.push(Task::from_info(
                &info,
                self.framework_id.clone(),
                self.executor_id.clone(),
            ));
        }

        let non_terminal: Vec<TaskId> = self
            .launched_tasks
            .iter()
            .filter(|(_, t)| !t.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in non_terminal {
            if let Some(task) = self.launched_tasks.remove(&task_id) {
                self.resources -= task.resources;
                live.push(task);
            }
        }

        live
    }

    pub fn has_task(&self, task_id: &TaskId) -> bool {
        self.queued_tasks.contains_key(task_id) || self.launched_tasks.contains_key(task_id)
    }

    /// True when nothing live remains: used to decide framework removal.
    pub fn is_idle(&self) -> bool {
        self.queued_tasks.is_empty() && self.launched_tasks.is_empty()
    }
}
