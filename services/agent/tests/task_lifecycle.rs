//! End-to-end task lifecycle against a mock master and mock isolator:
//! launch, executor registration, ordered status delivery, kill paths,
//! and framework teardown.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};

use armada_agent::actors::{ActorHandle, AgentMessage, AgentSnapshot};
use armada_agent::client::{ExecutorCall, MasterCall, MockExecutorEndpoint, MockMasterEndpoint};
use armada_agent::config::{Config, RecoverMode};
use armada_agent::isolator::MockIsolator;
use armada_agent::registry::{CommandInfo, FrameworkInfo, StatusUpdate, TaskInfo, TaskState};
use armada_agent::resources::Resources;
use armada_agent::spawn_agent;
use armada_id::{AgentId, ExecutorId, FrameworkId, TaskId};

fn test_config(work_dir: &Path) -> Config {
    Config {
        work_dir: work_dir.to_path_buf(),
        launcher_dir: work_dir.join("libexec"),
        master_url: "http://127.0.0.1:0".to_string(),
        hostname: "test-host".to_string(),
        attributes: HashMap::new(),
        executor_shutdown_grace_period: Duration::from_millis(200),
        executor_reregister_timeout: Duration::from_millis(600),
        gc_delay: Duration::from_secs(3600),
        disk_watch_interval: Duration::from_secs(3600),
        recover: RecoverMode::Reconnect,
        strict: false,
        max_completed_frameworks: 10,
        max_completed_executors_per_framework: 10,
        max_completed_tasks_per_executor: 10,
        framework_pending_updates_soft_cap: 100,
    }
}

fn fid() -> FrameworkId {
    FrameworkId::parse("fw-1").unwrap()
}

fn framework_info() -> FrameworkInfo {
    FrameworkInfo {
        name: "analytics".to_string(),
        user: "svc".to_string(),
        failover_timeout_secs: 0,
    }
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

async fn register_agent(
    agent: &ActorHandle<AgentMessage>,
    master: Arc<MockMasterEndpoint>,
    master_rx: &mut mpsc::UnboundedReceiver<MasterCall>,
    agent_id: &str,
) {
    agent
        .send(AgentMessage::NewMasterDetected { master })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match master_rx.recv().await.expect("master channel closed") {
                MasterCall::Register { .. } | MasterCall::Reregister { .. } => break,
                _ => {}
            }
        }
    })
    .await
    .expect("no registration attempt");

    agent
        .send(AgentMessage::Registered {
            agent_id: AgentId::parse(agent_id).unwrap(),
        })
        .await
        .unwrap();
}

async fn expect_status(
    master_rx: &mut mpsc::UnboundedReceiver<MasterCall>,
    state: TaskState,
) -> StatusUpdate {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(MasterCall::StatusUpdate(update)) = master_rx.recv().await {
                if update.state == state {
                    return update;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("master never saw a {state} update"))
}

async fn ack(agent: &ActorHandle<AgentMessage>, update: &StatusUpdate) {
    agent
        .send(AgentMessage::StatusUpdateAck {
            framework_id: update.framework_id.clone(),
            task_id: update.task_id.clone(),
            update_id: update.update_id,
        })
        .await
        .unwrap();
}

async fn snapshot(agent: &ActorHandle<AgentMessage>) -> AgentSnapshot {
    let (tx, rx) = oneshot::channel();
    agent
        .send(AgentMessage::GetSnapshot { reply: tx })
        .await
        .unwrap();
    rx.await.unwrap()
}

async fn wait_for_launches(isolator: &MockIsolator, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while isolator.launches().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("isolator launch never happened");
}

#[tokio::test]
async fn happy_path_command_task() {
    let tmp = tempfile::tempdir().unwrap();
    let isolator = Arc::new(MockIsolator::new());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_agent(test_config(tmp.path()), isolator.clone(), shutdown_rx);
    let agent = handles.agent;

    let (master, mut master_rx) = MockMasterEndpoint::new();
    register_agent(&agent, master.clone(), &mut master_rx, "node-1").await;

    // A task with an inline command synthesizes a command executor that
    // shares the task's id.
    agent
        .send(AgentMessage::RunTask {
            framework_id: fid(),
            framework_info: framework_info(),
            scheduler_endpoint: None,
            task: command_task("t1", "echo hello"),
        })
        .await
        .unwrap();

    wait_for_launches(&isolator, 1).await;
    let launch = &isolator.launches()[0];
    assert_eq!(launch.executor_id.as_str(), "t1");

    // The executor process calls back and gets the queued task.
    let (executor, mut executor_rx) = MockExecutorEndpoint::new();
    agent
        .send(AgentMessage::RegisterExecutor {
            framework_id: fid(),
            executor_id: ExecutorId::parse("t1").unwrap(),
            address: Some("executor@127.0.0.1:0".to_string()),
            endpoint: executor.clone(),
        })
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), executor_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(delivered, ExecutorCall::RunTask(t) if t.task_id.as_str() == "t1"));

    // The executor reports the full lifecycle; the master sees the updates
    // in order and each ack flows back to the executor.
    let eid = ExecutorId::parse("t1").unwrap();
    let tid = TaskId::parse("t1").unwrap();
    for state in [TaskState::Starting, TaskState::Running, TaskState::Finished] {
        agent
            .send(AgentMessage::StatusUpdate {
                update: StatusUpdate::new(fid(), eid.clone(), tid.clone(), state),
            })
            .await
            .unwrap();

        let observed = expect_status(&mut master_rx, state).await;
        ack(&agent, &observed).await;

        let executor_ack = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(ExecutorCall::StatusUpdateAck { update_id, .. }) =
                    executor_rx.recv().await
                {
                    return update_id;
                }
            }
        })
        .await
        .expect("executor never saw the ack");
        assert_eq!(executor_ack, observed.update_id);
    }

    // The executor is kept after its task finishes; only a framework
    // shutdown tears it down.
    let snap = snapshot(&agent).await;
    assert_eq!(snap.framework_count, 1);
    assert!(executor
        .calls()
        .iter()
        .all(|c| !matches!(c, ExecutorCall::Shutdown)));

    agent
        .send(AgentMessage::ShutdownFramework {
            framework_id: fid(),
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ExecutorCall::Shutdown) = executor_rx.recv().await {
                break;
            }
        }
    })
    .await
    .expect("executor never received shutdown");

    // The executor exits; the framework is removed with it.
    isolator.terminate(
        &fid(),
        &eid,
        armada_agent::reaper::Termination::Exited(0),
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if snapshot(&agent).await.framework_count == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("framework never removed");
}

#[tokio::test]
async fn kill_queued_task_synthesizes_killed() {
    let tmp = tempfile::tempdir().unwrap();
    let isolator = Arc::new(MockIsolator::new());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_agent(test_config(tmp.path()), isolator.clone(), shutdown_rx);
    let agent = handles.agent;

    let (master, mut master_rx) = MockMasterEndpoint::new();
    register_agent(&agent, master.clone(), &mut master_rx, "node-1").await;

    agent
        .send(AgentMessage::RunTask {
            framework_id: fid(),
            framework_info: framework_info(),
            scheduler_endpoint: None,
            task: command_task("t1", "sleep 300"),
        })
        .await
        .unwrap();
    wait_for_launches(&isolator, 1).await;

    // The executor has not registered; the task is still queued and the
    // kill resolves on the agent alone.
    agent
        .send(AgentMessage::KillTask {
            framework_id: fid(),
            task_id: TaskId::parse("t1").unwrap(),
        })
        .await
        .unwrap();

    let killed = expect_status(&mut master_rx, TaskState::Killed).await;
    assert_eq!(killed.task_id.as_str(), "t1");
    ack(&agent, &killed).await;
}

#[tokio::test]
async fn kill_launched_task_is_forwarded_to_executor() {
    let tmp = tempfile::tempdir().unwrap();
    let isolator = Arc::new(MockIsolator::new());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_agent(test_config(tmp.path()), isolator.clone(), shutdown_rx);
    let agent = handles.agent;

    let (master, mut master_rx) = MockMasterEndpoint::new();
    register_agent(&agent, master.clone(), &mut master_rx, "node-1").await;

    agent
        .send(AgentMessage::RunTask {
            framework_id: fid(),
            framework_info: framework_info(),
            scheduler_endpoint: None,
            task: command_task("t1", "sleep 300"),
        })
        .await
        .unwrap();
    wait_for_launches(&isolator, 1).await;

    let (executor, mut executor_rx) = MockExecutorEndpoint::new();
    agent
        .send(AgentMessage::RegisterExecutor {
            framework_id: fid(),
            executor_id: ExecutorId::parse("t1").unwrap(),
            address: None,
            endpoint: executor.clone(),
        })
        .await
        .unwrap();

    agent
        .send(AgentMessage::KillTask {
            framework_id: fid(),
            task_id: TaskId::parse("t1").unwrap(),
        })
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ExecutorCall::KillTask(task_id)) = executor_rx.recv().await {
                assert_eq!(task_id.as_str(), "t1");
                break;
            }
        }
    })
    .await
    .expect("executor never received the kill");
}

#[tokio::test]
async fn task_for_shutdown_framework_is_lost() {
    let tmp = tempfile::tempdir().unwrap();
    let isolator = Arc::new(MockIsolator::new());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_agent(test_config(tmp.path()), isolator.clone(), shutdown_rx);
    let agent = handles.agent;

    let (master, mut master_rx) = MockMasterEndpoint::new();
    register_agent(&agent, master.clone(), &mut master_rx, "node-1").await;

    agent
        .send(AgentMessage::RunTask {
            framework_id: fid(),
            framework_info: framework_info(),
            scheduler_endpoint: None,
            task: command_task("t1", "sleep 300"),
        })
        .await
        .unwrap();
    wait_for_launches(&isolator, 1).await;

    agent
        .send(AgentMessage::ShutdownFramework {
            framework_id: fid(),
        })
        .await
        .unwrap();

    // A second task arriving for the framework mid-shutdown is refused.
    agent
        .send(AgentMessage::RunTask {
            framework_id: fid(),
            framework_info: framework_info(),
            scheduler_endpoint: None,
            task: command_task("t2", "true"),
        })
        .await
        .unwrap();

    let lost = expect_status(&mut master_rx, TaskState::Lost).await;
    assert_eq!(lost.task_id.as_str(), "t2");
}

#[tokio::test]
async fn launch_failure_fails_queued_tasks() {
    let tmp = tempfile::tempdir().unwrap();
    let isolator = Arc::new(MockIsolator::failing());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_agent(test_config(tmp.path()), isolator.clone(), shutdown_rx);
    let agent = handles.agent;

    let (master, mut master_rx) = MockMasterEndpoint::new();
    register_agent(&agent, master.clone(), &mut master_rx, "node-1").await;

    agent
        .send(AgentMessage::RunTask {
            framework_id: fid(),
            framework_info: framework_info(),
            scheduler_endpoint: None,
            task: command_task("t1", "true"),
        })
        .await
        .unwrap();

    let failed = expect_status(&mut master_rx, TaskState::Failed).await;
    assert_eq!(failed.task_id.as_str(), "t1");
    assert!(failed
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("launch failed"));
}
