//! Framework model: a tenant of the cluster, owning executors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use armada_id::{ContainerId, ExecutorId, FrameworkId, TaskId};
use serde::{Deserialize, Serialize};

use crate::registry::executor::{Executor, ExecutorInfo};
use crate::registry::task::TaskInfo;
use crate::registry::CompletedRing;

/// The name of the helper binary that runs command tasks. It is resolved
/// under `launcher_dir` when a command executor is synthesized.
pub const COMMAND_EXECUTOR_NAME: &str = "armada-executor";

/// Static description of a framework, supplied by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameworkInfo {
    pub name: String,
    pub user: String,
    /// How long the master keeps the framework's tasks after losing its
    /// scheduler, in seconds.
    #[serde(default)]
    pub failover_timeout_secs: u64,
}

/// A framework with live executors on this agent.
#[derive(Debug)]
pub struct Framework {
    pub framework_id: FrameworkId,
    pub info: FrameworkInfo,

    /// Scheduler endpoint, updated by the master on failover.
    pub scheduler_endpoint: Option<String>,

    /// Set once a shutdown has been requested; the framework is removed
    /// when its last executor terminates.
    pub shutdown: bool,

    pub executors: HashMap<ExecutorId, Executor>,

    /// Terminated executors, most recent last.
    pub completed_executors: CompletedRing<Executor>,
}

impl Framework {
    pub fn new(
        framework_id: FrameworkId,
        info: FrameworkInfo,
        scheduler_endpoint: Option<String>,
        max_completed_executors: usize,
    ) -> Self {
        Self {
            framework_id,
            info,
            scheduler_endpoint,
            shutdown: false,
            executors: HashMap::new(),
            completed_executors: CompletedRing::new(max_completed_executors),
        }
    }

    /// Derives the `ExecutorInfo` for a task: a custom executor is used as
    /// given; a command task synthesizes a command executor that shares the
    /// task's id and invokes the `armada-executor` helper.
    pub fn executor_info_for(&self, task: &TaskInfo, launcher_dir: &Path) -> ExecutorInfo {
        if let Some(executor) = &task.executor {
            return executor.clone();
        }

        let command = task
            .command
            .as_ref()
            .expect("well-formed task carries a command or an executor");

        // Command executors share the task's id.
        let executor_id = ExecutorId::parse(task.task_id.as_str())
            .expect("task id is a valid executor id");

        let name = format!(
            "Command Executor (Task: {}) (Command: sh -c '{}')",
            task.task_id,
            abbreviate_command(&command.value),
        );

        // Keep the task's environment but invoke the helper binary. If the
        // helper cannot be resolved, the executor's command becomes an
        // exit-with-message so the failure is visible in the sandbox.
        let mut executor_command = command.clone();
        executor_command.value = match std::fs::canonicalize(launcher_dir.join(COMMAND_EXECUTOR_NAME))
        {
            Ok(path) => path.display().to_string(),
            Err(e) => format!(
                "echo 'failed to locate {COMMAND_EXECUTOR_NAME} in {}: {e}'; exit 1",
                launcher_dir.display()
            ),
        };

        ExecutorInfo {
            executor_id,
            name,
            source: task.task_id.to_string(),
            command: executor_command,
            resources: crate::resources::Resources::default(),
        }
    }

    /// Registers a new executor run.
    pub fn create_executor(
        &mut self,
        info: ExecutorInfo,
        container_id: ContainerId,
        directory: PathBuf,
        max_completed_tasks: usize,
    ) -> &mut Executor {
        let executor_id = info.executor_id.clone();
        assert!(
            !self.executors.contains_key(&executor_id),
            "executor {executor_id} already exists in framework {}",
            self.framework_id,
        );

        let executor = Executor::new(
            self.framework_id.clone(),
            info,
            container_id,
            directory,
            max_completed_tasks,
        );
        self.executors.insert(executor_id.clone(), executor);
        self.executors.get_mut(&executor_id).unwrap()
    }

    /// Removes a terminated executor and archives it.
    pub fn destroy_executor(&mut self, executor_id: &ExecutorId) -> Option<&Executor> {
        if let Some(executor) = self.executors.remove(executor_id) {
            self.completed_executors.push(executor);
            self.completed_executors.latest()
        } else {
            None
        }
    }

    pub fn executor(&self, executor_id: &ExecutorId) -> Option<&Executor> {
        self.executors.get(executor_id)
    }

    pub fn executor_mut(&mut self, executor_id: &ExecutorId) -> Option<&mut Executor> {
        self.executors.get_mut(executor_id)
    }

    /// Finds the executor owning a task, queued or launched.
    pub fn executor_for_task(&self, task_id: &TaskId) -> Option<&Executor> {
        self.executors.values().find(|e| e.has_task(task_id))
    }

    pub fn executor_for_task_mut(&mut self, task_id: &TaskId) -> Option<&mut Executor> {
        self.executors.values_mut().find(|e| e.has_task(task_id))
    }

    /// A framework is removable once shutdown is requested and its last
    /// executor has terminated.
    pub fn is_removable(&self) -> bool {
        self.shutdown && self.executors.is_empty()
    }
}

/// Shortens a command for display: longer than 15 characters becomes the
/// first 12 plus `...`; an empty command gets a deterministic placeholder.
fn abbreviate_command(value: &str) -> String {
    if value.is_empty() {
        "<none>".to_string()
    } else if value.chars().count() > 15 {
        let head: String = value.chars().take(12).collect();
        format!("{head}...")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::task::CommandInfo;
    use crate::resources::Resources;

    fn test_framework() -> Framework {
        Framework::new(
            FrameworkId::parse("fw-1").unwrap(),
            FrameworkInfo {
                name: "analytics".to_string(),
                user: "svc-analytics".to_string(),
                failover_timeout_secs: 0,
            },
            Some("http://scheduler:8080".to_string()),
            2,
        )
    }

    fn command_task(id: &str, command: &str) -> TaskInfo {
        TaskInfo {
            task_id: TaskId::parse(id).unwrap(),
            name: id.to_string(),
            resources: Resources::new(1.0, 64 << 20, 0),
            command: Some(CommandInfo::new(command)),
            executor: None,
            data: None,
        }
    }

    #[test]
    fn command_executor_shares_task_id() {
        let framework = test_framework();
        let task = command_task("task-42", "echo hello");

        let info = framework.executor_info_for(&task, Path::new("/nonexistent"));
        assert_eq!(info.executor_id.as_str(), "task-42");
        assert_eq!(info.source, "task-42");
        // Helper is unresolvable; the command degrades to exit-with-message.
        assert!(info.command.value.contains("exit 1"));
    }

    #[test]
    fn command_abbreviation() {
        assert_eq!(abbreviate_command(""), "<none>");
        assert_eq!(abbreviate_command("echo hi"), "echo hi");
        assert_eq!(abbreviate_command("123456789012345"), "123456789012345");
        assert_eq!(abbreviate_command("1234567890123456"), "123456789012...");
    }

    #[test]
    fn command_executor_name_embeds_command() {
        let framework = test_framework();
        let task = command_task("t1", "while true; do work; done");

        let info = framework.executor_info_for(&task, Path::new("/nonexistent"));
        assert!(info.name.contains("Command Executor"));
        assert!(info.name.contains("while true; d..."));
    }

    #[test]
    fn destroy_executor_archives() {
        let mut framework = test_framework();
        let task = command_task("t1", "true");
        let info = framework.executor_info_for(&task, Path::new("/nonexistent"));
        let executor_id = info.executor_id.clone();

        framework.create_executor(info, ContainerId::new(), PathBuf::from("/tmp/sb"), 4);
        assert!(framework.executor(&executor_id).is_some());

        framework.destroy_executor(&executor_id);
        assert!(framework.executor(&executor_id).is_none());
        assert_eq!(framework.completed_executors.len(), 1);
        assert!(!framework.is_removable());
    }

    #[test]
    fn removable_after_shutdown_and_last_executor() {
        let mut framework = test_framework();
        assert!(!framework.is_removable());

        framework.shutdown = true;
        assert!(framework.is_removable());
    }
}
