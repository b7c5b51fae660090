//! Recovery: rebuilding agent state from the checkpoint tree.
//!
//! Reading happens once, before the store accepts writes. Individual
//! missing records (a crash between directory creation and the first
//! checkpoint) are surfaced as `None` fields; the agent decides whether a
//! partially-recovered executor is shut down or treated as fatal.

use std::path::{Path, PathBuf};

use armada_id::{AgentId, ContainerId, ExecutorId, FrameworkId, TaskId};
use tracing::warn;

use crate::checkpoint::paths;
use crate::checkpoint::store::{self, CheckpointError, UpdateLogRecord};
use crate::registry::{AgentInfo, ExecutorInfo, FrameworkInfo, TaskInfo};

/// Everything recovered from disk for one agent id.
#[derive(Debug)]
pub struct AgentState {
    pub info: AgentInfo,
    pub frameworks: Vec<FrameworkState>,
}

#[derive(Debug)]
pub struct FrameworkState {
    pub framework_id: FrameworkId,
    pub info: Option<FrameworkInfo>,
    pub executors: Vec<ExecutorState>,
}

/// The latest run of one checkpointed executor.
#[derive(Debug)]
pub struct ExecutorState {
    pub executor_id: ExecutorId,
    pub container_id: ContainerId,
    pub info: Option<ExecutorInfo>,
    /// Pid of the forked executor process, if it was checkpointed.
    pub forked_pid: Option<i32>,
    pub tasks: Vec<TaskStreamState>,
}

#[derive(Debug)]
pub struct TaskStreamState {
    pub task_id: TaskId,
    pub info: Option<TaskInfo>,
    pub records: Vec<UpdateLogRecord>,
}

/// Recovers the checkpointed state under `work_dir`.
///
/// `None` means a cold start: no agent has ever checkpointed here. When
/// several agent ids are present (the master re-assigned an id at some
/// point), the most recently modified one wins.
pub fn recover(work_dir: &Path) -> Result<Option<AgentState>, CheckpointError> {
    let agents_dir = paths::agents_dir(work_dir);
    let Some(agent_id) = latest_agent_id(&agents_dir)? else {
        return Ok(None);
    };

    let info: AgentInfo =
        match store::read_record(&paths::agent_info_path(work_dir, &agent_id))? {
            Some(info) => info,
            None => {
                warn!(agent_id = %agent_id, "agent directory exists without slave.info; cold start");
                return Ok(None);
            }
        };

    let mut frameworks = Vec::new();
    for framework_id in subdirectories(&paths::frameworks_dir(work_dir, &agent_id))? {
        let Ok(framework_id) = FrameworkId::parse(&framework_id) else {
            warn!(entry = %framework_id, "skipping unparsable framework directory");
            continue;
        };
        frameworks.push(recover_framework(work_dir, &agent_id, framework_id)?);
    }

    Ok(Some(AgentState { info, frameworks }))
}

fn recover_framework(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: FrameworkId,
) -> Result<FrameworkState, CheckpointError> {
    let info =
        store::read_record(&paths::framework_info_path(work_dir, agent_id, &framework_id))?;

    let mut executors = Vec::new();
    for executor_id in subdirectories(&paths::executors_dir(work_dir, agent_id, &framework_id))? {
        let Ok(executor_id) = ExecutorId::parse(&executor_id) else {
            warn!(entry = %executor_id, "skipping unparsable executor directory");
            continue;
        };

        if let Some(executor) =
            recover_executor(work_dir, agent_id, &framework_id, executor_id)?
        {
            executors.push(executor);
        }
    }

    Ok(FrameworkState {
        framework_id,
        info,
        executors,
    })
}

fn recover_executor(
    work_dir: &Path,
    agent_id: &AgentId,
    framework_id: &FrameworkId,
    executor_id: ExecutorId,
) -> Result<Option<ExecutorState>, CheckpointError> {
    // ContainerIds are time-ordered, so the greatest directory name is the
    // latest run. Earlier runs are only kept for their sandboxes.
    let runs_dir = paths::runs_dir(work_dir, agent_id, framework_id, &executor_id);
    let mut runs: Vec<ContainerId> = subdirectories(&runs_dir)?
        .iter()
        .filter_map(|name| match ContainerId::parse(name) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(entry = %name, "skipping unparsable run directory");
                None
            }
        })
        .collect();
    runs.sort();

    let Some(container_id) = runs.pop() else {
        warn!(
            executor_id = %executor_id,
            "executor directory has no runs; skipping"
        );
        return Ok(None);
    };

    let info = store::read_record(&paths::executor_info_path(
        work_dir,
        agent_id,
        framework_id,
        &executor_id,
        &container_id,
    ))?;

    let forked_pid = store::read_record(&paths::forked_pid_path(
        work_dir,
        agent_id,
        framework_id,
        &executor_id,
        &container_id,
    ))?;

    let mut tasks = Vec::new();
    let tasks_dir = paths::tasks_dir(work_dir, agent_id, framework_id, &executor_id, &container_id);
    for task_id in subdirectories(&tasks_dir)? {
        let Ok(task_id) = TaskId::parse(&task_id) else {
            warn!(entry = %task_id, "skipping unparsable task directory");
            continue;
        };

        let info = store::read_record(&paths::task_info_path(
            work_dir,
            agent_id,
            framework_id,
            &executor_id,
            &container_id,
            &task_id,
        ))?;

        let records = store::read_update_records(&paths::updates_path(
            work_dir,
            agent_id,
            framework_id,
            &executor_id,
            &container_id,
            &task_id,
        ))?;

        tasks.push(TaskStreamState {
            task_id,
            info,
            records,
        });
    }

    Ok(Some(ExecutorState {
        executor_id,
        container_id,
        info,
        forked_pid,
        tasks,
    }))
}

fn latest_agent_id(agents_dir: &Path) -> Result<Option<AgentId>, CheckpointError> {
    let mut latest: Option<(std::time::SystemTime, AgentId)> = None;

    for name in subdirectories(agents_dir)? {
        let Ok(agent_id) = AgentId::parse(&name) else {
            warn!(entry = %name, "skipping unparsable agent directory");
            continue;
        };

        let dir = agents_dir.join(&name);
        let modified = std::fs::metadata(&dir)
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

        if latest.as_ref().map_or(true, |(t, _)| modified >= *t) {
            latest = Some((modified, agent_id));
        }
    }

    Ok(latest.map(|(_, id)| id))
}

fn subdirectories(dir: &Path) -> Result<Vec<String>, CheckpointError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CheckpointError::Io {
                path: PathBuf::from(dir),
                source: e,
            })
        }
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| CheckpointError::Io {
            path: PathBuf::from(dir),
            source: e,
        })?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::store::checkpoint;
    use crate::registry::{CommandInfo, StatusUpdate, TaskState};
    use crate::resources::Resources;

    fn seed_agent(work_dir: &Path, agent_id: &AgentId) -> AgentInfo {
        let info = AgentInfo {
            agent_id: Some(agent_id.clone()),
            hostname: "host-a".to_string(),
            resources: Resources::new(4.0, 8 << 30, 100 << 30),
            attributes: Default::default(),
        };
        checkpoint(&paths::agent_info_path(work_dir, agent_id), &info).unwrap();
        info
    }

    #[test]
    fn cold_start_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(recover(dir.path()).unwrap().is_none());
    }

    #[test]
    fn warm_start_recovers_tree() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let agent_id = AgentId::parse("node-1").unwrap();
        seed_agent(work, &agent_id);

        let fid = FrameworkId::parse("fw-1").unwrap();
        checkpoint(
            &paths::framework_info_path(work, &agent_id, &fid),
            &FrameworkInfo {
                name: "etl".into(),
                user: "etl".into(),
                failover_timeout_secs: 0,
            },
        )
        .unwrap();

        let eid = ExecutorId::parse("exec-1").unwrap();
        let cid = ContainerId::new();
        let executor_info = ExecutorInfo {
            executor_id: eid.clone(),
            name: "executor".into(),
            source: "t1".into(),
            command: CommandInfo::new("sleep 60"),
            resources: Resources::default(),
        };
        checkpoint(
            &paths::executor_info_path(work, &agent_id, &fid, &eid, &cid),
            &executor_info,
        )
        .unwrap();
        checkpoint(
            &paths::forked_pid_path(work, &agent_id, &fid, &eid, &cid),
            &4242i32,
        )
        .unwrap();

        let tid = TaskId::parse("t1").unwrap();
        let task_info = TaskInfo {
            task_id: tid.clone(),
            name: "t1".into(),
            resources: Resources::new(1.0, 1 << 30, 0),
            command: Some(CommandInfo::new("true")),
            executor: None,
            data: None,
        };
        checkpoint(
            &paths::task_info_path(work, &agent_id, &fid, &eid, &cid, &tid),
            &task_info,
        )
        .unwrap();

        let update = StatusUpdate::new(fid.clone(), eid.clone(), tid.clone(), TaskState::Running);
        store::append_update_record(
            &paths::updates_path(work, &agent_id, &fid, &eid, &cid, &tid),
            &UpdateLogRecord::Update { update },
        )
        .unwrap();

        let state = recover(work).unwrap().unwrap();
        assert_eq!(state.info.hostname, "host-a");
        assert_eq!(state.frameworks.len(), 1);

        let framework = &state.frameworks[0];
        assert_eq!(framework.framework_id, fid);
        assert!(framework.info.is_some());
        assert_eq!(framework.executors.len(), 1);

        let executor = &framework.executors[0];
        assert_eq!(executor.executor_id, eid);
        assert_eq!(executor.container_id, cid);
        assert_eq!(executor.forked_pid, Some(4242));

        // The recovered executor command equals what was persisted.
        let recovered_info = executor.info.as_ref().unwrap();
        assert_eq!(recovered_info.command, executor_info.command);
        assert_eq!(recovered_info.name, executor_info.name);

        assert_eq!(executor.tasks.len(), 1);
        assert_eq!(executor.tasks[0].task_id, tid);
        assert!(executor.tasks[0].info.is_some());
        assert_eq!(executor.tasks[0].records.len(), 1);
    }

    #[test]
    fn latest_run_wins() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let agent_id = AgentId::parse("node-1").unwrap();
        seed_agent(work, &agent_id);

        let fid = FrameworkId::parse("fw-1").unwrap();
        checkpoint(
            &paths::framework_info_path(work, &agent_id, &fid),
            &FrameworkInfo {
                name: "x".into(),
                user: "x".into(),
                failover_timeout_secs: 0,
            },
        )
        .unwrap();

        let eid = ExecutorId::parse("exec-1").unwrap();
        let old_run = ContainerId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let new_run = ContainerId::new();

        for cid in [&old_run, &new_run] {
            checkpoint(
                &paths::executor_info_path(work, &agent_id, &fid, &eid, cid),
                &ExecutorInfo {
                    executor_id: eid.clone(),
                    name: "executor".into(),
                    source: "t1".into(),
                    command: CommandInfo::new("sleep 60"),
                    resources: Resources::default(),
                },
            )
            .unwrap();
        }

        let state = recover(work).unwrap().unwrap();
        let executor = &state.frameworks[0].executors[0];
        assert_eq!(executor.container_id, new_run);
    }

    #[test]
    fn partial_executor_surfaces_as_missing_info() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();
        let agent_id = AgentId::parse("node-1").unwrap();
        seed_agent(work, &agent_id);

        let fid = FrameworkId::parse("fw-1").unwrap();
        let eid = ExecutorId::parse("exec-1").unwrap();
        let cid = ContainerId::new();

        // Run directory exists, but the crash happened before executor.info
        // was checkpointed.
        std::fs::create_dir_all(paths::run_dir(work, &agent_id, &fid, &eid, &cid)).unwrap();

        let state = recover(work).unwrap().unwrap();
        let executor = &state.frameworks[0].executors[0];
        assert!(executor.info.is_none());
        assert!(executor.forked_pid.is_none());
    }
}
