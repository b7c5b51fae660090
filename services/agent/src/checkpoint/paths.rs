//! Checkpoint and sandbox directory layout.
//!
//! The layout is a compatibility contract: a new agent binary must be able
//! to read the previous binary's tree. All checkpointed metadata lives
//! under `<work_dir>/meta`; sandboxes mirror the same shape directly under
//! `<work_dir>`.
//!
//! ```text
//! meta/slaves/<agent-id>/
//!   slave.info
//!   frameworks/<framework-id>/
//!     framework.info
//!     executors/<executor-id>/
//!       runs/<container-id>/
//!         executor.info
//!         pid
//!         forked.pid
//!         tasks/<task-id>/
//!           task.info
//!           updates
//! ```

use std::path::{Path, PathBuf};

use armada_id::{AgentId, ContainerId, ExecutorId, FrameworkId, TaskId};

pub const AGENT_INFO_FILE: &str = "slave.info";
pub const FRAMEWORK_INFO_FILE: &str = "framework.info";
pub const EXECUTOR_INFO_FILE: &str = "executor.info";
pub const TASK_INFO_FILE: &str = "task.info";
pub const UPDATES_FILE: &str = "updates";
pub const LIBPROCESS_PID_FILE: &str = "pid";
pub const FORKED_PID_FILE: &str = "forked.pid";

pub fn meta_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("meta")
}

pub fn agents_dir(work_dir: &Path) -> PathBuf {
    meta_dir(work_dir).join("slaves")
}

pub fn agent_dir(work_dir: &Path, agent_id: &AgentId) -> PathBuf {
    agents_dir(work_dir).join(agent_id.as_str())
}

pub fn agent_info_path(work_dir: &Path, agent_id: &AgentId) -> PathBuf {
    agent_dir(work_dir, agent_id).join(AGENT_INFO_FILE)
}

pub fn frameworks_dir(work_dir: &Path, agent_id: &AgentId) -> PathBuf {
    agent_dir(work_dir, agent_id).join("frameworks")
}

pub fn framework_dir(work_dir: &Path, agent_id: &AgentId, framework_id: &FrameworkId) -> PathBuf {
    frameworks_dir(work_dir, agent_id).join(framework_id.as_str())
}

pub fn framework_info_path(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
) -> PathBuf {
    framework_dir(work_dir, agent_id, framework_id).join(FRAMEWORK_INFO_FILE)
}

pub fn executors_dir(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
) -> PathBuf {
    framework_dir(work_dir, agent_id, framework_id).join("executors")
}

pub fn runs_dir(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
) -> PathBuf {
    executors_dir(work_dir, agent_id, framework_id)
        .join(executor_id.as_str())
        .join("runs")
}

pub fn run_dir(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
) -> PathBuf {
    runs_dir(work_dir, agent_id, framework_id, executor_id).join(container_id.to_string())
}

pub fn executor_info_path(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
) -> PathBuf {
    run_dir(work_dir, agent_id, framework_id, executor_id, container_id).join(EXECUTOR_INFO_FILE)
}

pub fn libprocess_pid_path(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
) -> PathBuf {
    run_dir(work_dir, agent_id, framework_id, executor_id, container_id).join(LIBPROCESS_PID_FILE)
}

pub fn forked_pid_path(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
) -> PathBuf {
    run_dir(work_dir, agent_id, framework_id, executor_id, container_id).join(FORKED_PID_FILE)
}

pub fn tasks_dir(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
) -> PathBuf {
    run_dir(work_dir, agent_id, framework_id, executor_id, container_id).join("tasks")
}

pub fn task_dir(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
    task_id: &TaskId,
) -> PathBuf {
    tasks_dir(work_dir, agent_id, framework_id, executor_id, container_id).join(task_id.as_str())
}

pub fn task_info_path(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
    task_id: &TaskId,
) -> PathBuf {
    task_dir(
        work_dir,
        agent_id,
        framework_id,
        executor_id,
        container_id,
        task_id,
    )
    .join(TASK_INFO_FILE)
}

pub fn updates_path(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
    task_id: &TaskId,
) -> PathBuf {
    task_dir(
        work_dir,
        agent_id,
        framework_id,
        executor_id,
        container_id,
        task_id,
    )
    .join(UPDATES_FILE)
}

/// Sandbox directory for one executor run, outside the meta tree.
pub fn sandbox_dir(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: &ExecutorId,
    container_id: &ContainerId,
) -> PathBuf {
    work_dir
        .join("slaves")
        .join(agent_id.as_str())
        .join("frameworks")
        .join(framework_id.as_str())
        .join("executors")
        .join(executor_id.as_str())
        .join("runs")
        .join(container_id.to_string())
}
