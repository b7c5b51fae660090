//! The agent actor: the single-threaded event handler sequencing messages
//! from the master, executors, the reaper, the isolator, and timers.
//!
//! The agent owns the registry and is the only writer of it. Anything that
//! would wait (isolator launches, shutdown grace periods, registration
//! retries) is expressed as a message back to this mailbox; the re-entry
//! handler re-validates against the registry because the executor it was
//! scheduled for may be gone by then.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use armada_id::{AgentId, ContainerId, ExecutorId, FrameworkId, TaskId, UpdateId};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::actors::core::{
    spawn, Actor, ActorContext, ActorError, ActorHandle, BackoffPolicy, Flow,
};
use crate::actors::status_update::{
    AckedUpdate, RecoveredStream, StatusUpdateManager, UpdateManagerMessage,
};
use crate::checkpoint::{self, paths, CheckpointError, UpdateLogRecord};
use crate::client::{AgentInventory, ExecutorEndpoint, ExecutorSummary, MasterEndpoint};
use crate::config::{Config, RecoverMode};
use crate::gc::{disk_usage, permitted_age, GarbageCollector};
use crate::isolator::{Isolator, Launch, RecoveredRun};
use crate::reaper::{ProcessExit, Reaper, ReaperHandle, Termination};
use crate::registry::{
    AgentInfo, Framework, FrameworkInfo, Registry, Statistics, StatusUpdate, Task, TaskInfo,
    TaskState,
};
use crate::resources::Resources;

/// Where the agent stands with the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Disconnected,
    Registering,
    Reregistering,
    Registered,
}

/// Introspection snapshot, served over the mailbox so reads are serialized
/// with writes.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub registration: RegistrationState,
    pub agent_id: Option<AgentId>,
    pub recovered: bool,
    pub framework_count: usize,
    pub stats: Statistics,
}

pub enum AgentMessage {
    // -- master detection and registration --
    NewMasterDetected {
        master: Arc<dyn MasterEndpoint>,
    },
    NoMasterDetected,
    MasterDetectionFailure {
        error: String,
    },
    Registered {
        agent_id: AgentId,
    },
    Reregistered {
        agent_id: AgentId,
    },
    RetryRegistration {
        attempt: u32,
    },
    Ping,

    // -- master to agent --
    RunTask {
        framework_id: FrameworkId,
        framework_info: FrameworkInfo,
        scheduler_endpoint: Option<String>,
        task: TaskInfo,
    },
    KillTask {
        framework_id: FrameworkId,
        task_id: TaskId,
    },
    ShutdownFramework {
        framework_id: FrameworkId,
    },
    UpdateFramework {
        framework_id: FrameworkId,
        scheduler_endpoint: String,
    },
    FrameworkToExecutorMessage {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    },
    StatusUpdateAck {
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },

    // -- executor to agent --
    RegisterExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        address: Option<String>,
        endpoint: Arc<dyn ExecutorEndpoint>,
    },
    ReregisterExecutor {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<Task>,
        updates: Vec<StatusUpdate>,
        address: Option<String>,
        endpoint: Arc<dyn ExecutorEndpoint>,
    },
    StatusUpdate {
        update: StatusUpdate,
    },
    ExecutorToFrameworkMessage {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    },

    // -- internal --
    ExecutorLaunched {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        result: Result<i32, String>,
    },
    ExecutorTerminated {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        termination: Termination,
    },
    ProcessExited(ProcessExit),
    ShutdownExecutorTimeout {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
    },
    ReregisterExecutorTimeout,
    UpdateAcked(AckedUpdate),
    CheckDiskUsage,
    GetSnapshot {
        reply: oneshot::Sender<AgentSnapshot>,
    },
    Shutdown,
}

impl std::fmt::Debug for AgentMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewMasterDetected { .. } => f.write_str("NewMasterDetected"),
            Self::NoMasterDetected => f.write_str("NoMasterDetected"),
            Self::MasterDetectionFailure { error } => {
                write!(f, "MasterDetectionFailure({error})")
            }
            Self::Registered { agent_id } => write!(f, "Registered({agent_id})"),
            Self::Reregistered { agent_id } => write!(f, "Reregistered({agent_id})"),
            Self::RetryRegistration { attempt } => write!(f, "RetryRegistration({attempt})"),
            Self::Ping => f.write_str("Ping"),
            Self::RunTask { task, .. } => write!(f, "RunTask({})", task.task_id),
            Self::KillTask { task_id, .. } => write!(f, "KillTask({task_id})"),
            Self::ShutdownFramework { framework_id } => {
                write!(f, "ShutdownFramework({framework_id})")
            }
            Self::UpdateFramework { framework_id, .. } => {
                write!(f, "UpdateFramework({framework_id})")
            }
            Self::FrameworkToExecutorMessage { executor_id, .. } => {
                write!(f, "FrameworkToExecutorMessage({executor_id})")
            }
            Self::StatusUpdateAck { update_id, .. } => write!(f, "StatusUpdateAck({update_id})"),
            Self::RegisterExecutor { executor_id, .. } => {
                write!(f, "RegisterExecutor({executor_id})")
            }
            Self::ReregisterExecutor { executor_id, .. } => {
                write!(f, "ReregisterExecutor({executor_id})")
            }
            Self::StatusUpdate { update } => {
                write!(f, "StatusUpdate({}: {})", update.task_id, update.state)
            }
            Self::ExecutorToFrameworkMessage { executor_id, .. } => {
                write!(f, "ExecutorToFrameworkMessage({executor_id})")
            }
            Self::ExecutorLaunched {
                executor_id,
                result,
                ..
            } => write!(f, "ExecutorLaunched({executor_id}, ok={})", result.is_ok()),
            Self::ExecutorTerminated {
                executor_id,
                termination,
                ..
            } => write!(f, "ExecutorTerminated({executor_id}, {termination:?})"),
            Self::ProcessExited(exit) => write!(f, "ProcessExited({})", exit.pid),
            Self::ShutdownExecutorTimeout { executor_id, .. } => {
                write!(f, "ShutdownExecutorTimeout({executor_id})")
            }
            Self::ReregisterExecutorTimeout => f.write_str("ReregisterExecutorTimeout"),
            Self::UpdateAcked(acked) => {
                write!(f, "UpdateAcked({}: {})", acked.update.task_id, acked.update.state)
            }
            Self::CheckDiskUsage => f.write_str("CheckDiskUsage"),
            Self::GetSnapshot { .. } => f.write_str("GetSnapshot"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

pub struct Agent {
    config: Config,
    info: AgentInfo,
    registration: RegistrationState,
    master: Option<Arc<dyn MasterEndpoint>>,
    registry: Registry,
    isolator: Arc<dyn Isolator>,
    reaper: ReaperHandle,
    update_manager: ActorHandle<UpdateManagerMessage>,

    /// Endpoints of registered executor processes.
    executor_endpoints: HashMap<(FrameworkId, ExecutorId), Arc<dyn ExecutorEndpoint>>,

    /// Reaper-monitored pid to executor run.
    pids: HashMap<i32, (FrameworkId, ExecutorId, ContainerId)>,

    gc: GarbageCollector,
    registration_backoff: BackoffPolicy,

    /// Set once recovery has settled; RunTask is deferred until then.
    recovered: bool,
    recovering: HashSet<(FrameworkId, ExecutorId)>,
    deferred: Vec<AgentMessage>,

    halting: bool,
}

/// Everything `spawn_agent` hands back to the caller.
pub struct AgentHandles {
    pub agent: ActorHandle<AgentMessage>,
    pub task: tokio::task::JoinHandle<()>,
}

/// Wires up the agent with its collaborators (reaper, status-update
/// manager, notification pumps) and spawns it.
pub fn spawn_agent(
    config: Config,
    isolator: Arc<dyn Isolator>,
    shutdown: watch::Receiver<bool>,
) -> AgentHandles {
    let reaper = Reaper::spawn();

    let (acked_tx, mut acked_rx) = mpsc::channel::<AckedUpdate>(256);
    let manager = StatusUpdateManager::new(
        acked_tx,
        config.framework_pending_updates_soft_cap,
        config.strict,
    );
    let (manager_handle, _manager_task) = spawn(manager, 1024, shutdown.clone());

    let hostname = config.hostname.clone();
    let resources = Resources::measure(&config.work_dir);
    let info = AgentInfo {
        agent_id: None,
        hostname,
        resources,
        attributes: config.attributes.clone(),
    };

    let max_completed_frameworks = config.max_completed_frameworks;
    let agent = Agent {
        config,
        info,
        registration: RegistrationState::Disconnected,
        master: None,
        registry: Registry::new(max_completed_frameworks),
        isolator,
        reaper: reaper.clone(),
        update_manager: manager_handle,
        executor_endpoints: HashMap::new(),
        pids: HashMap::new(),
        gc: GarbageCollector::new(),
        registration_backoff: BackoffPolicy::default(),
        recovered: false,
        recovering: HashSet::new(),
        deferred: Vec::new(),
        halting: false,
    };

    let (handle, task) = spawn(agent, 1024, shutdown);

    // Pump manager acknowledgements into the agent mailbox.
    let acked_handle = handle.clone();
    tokio::spawn(async move {
        while let Some(acked) = acked_rx.recv().await {
            if acked_handle
                .send(AgentMessage::UpdateAcked(acked))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Pump reaper notifications into the agent mailbox.
    let reaper_handle = handle.clone();
    tokio::spawn(async move {
        let mut rx = reaper.subscribe().await;
        while let Some(exit) = rx.recv().await {
            if reaper_handle
                .send(AgentMessage::ProcessExited(exit))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    AgentHandles {
        agent: handle,
        task,
    }
}

impl Agent {
    fn agent_id(&self) -> Option<AgentId> {
        self.info.agent_id.clone()
    }

    /// Checkpoint failures are logged; under strict they abort the process.
    fn guard_checkpoint(&self, result: Result<(), CheckpointError>) {
        if let Err(e) = result {
            error!(error = %e, "checkpoint failed");
            if self.config.strict {
                std::process::abort();
            }
        }
    }

    fn updates_path_for(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
        task_id: &TaskId,
    ) -> Option<PathBuf> {
        let agent_id = self.info.agent_id.as_ref()?;
        Some(paths::updates_path(
            &self.config.work_dir,
            agent_id,
            framework_id,
            executor_id,
            container_id,
            task_id,
        ))
    }

    /// Pushes a synthesized task-state transition through the same
    /// pipeline executor-produced updates take.
    async fn synthesize(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: Option<ContainerId>,
        task_id: TaskId,
        state: TaskState,
        message: String,
    ) {
        self.registry.stats.record_task_state(state);
        self.registry.stats.valid_status_updates += 1;

        let updates_path = container_id
            .and_then(|cid| self.updates_path_for(&framework_id, &executor_id, &cid, &task_id));

        let update = StatusUpdate::new(framework_id, executor_id, task_id, state)
            .with_message(message);

        let _ = self
            .update_manager
            .send(UpdateManagerMessage::Update {
                update,
                updates_path,
            })
            .await;
    }

    fn inventory(&self) -> AgentInventory {
        let mut executors = Vec::new();
        for framework in self.registry.frameworks() {
            for executor in framework.executors.values() {
                executors.push(ExecutorSummary {
                    framework_id: framework.framework_id.clone(),
                    executor_id: executor.executor_id.clone(),
                    container_id: executor.container_id,
                    tasks: executor.launched_tasks.values().cloned().collect(),
                });
            }
        }
        AgentInventory { executors }
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    async fn handle_new_master(
        &mut self,
        master: Arc<dyn MasterEndpoint>,
        ctx: &ActorContext<AgentMessage>,
    ) {
        info!("new master detected");
        self.master = Some(Arc::clone(&master));
        let _ = self
            .update_manager
            .send(UpdateManagerMessage::MasterChanged {
                master: Some(master),
            })
            .await;

        self.registration = if self.info.agent_id.is_some() {
            RegistrationState::Reregistering
        } else {
            RegistrationState::Registering
        };

        self.attempt_registration(0, ctx).await;
    }

    /// Sends a (re)registration and arms the retry. The retry message
    /// becomes a no-op once `registration` leaves the in-progress states.
    async fn attempt_registration(&mut self, attempt: u32, ctx: &ActorContext<AgentMessage>) {
        let Some(master) = self.master.clone() else {
            return;
        };

        let result = match self.agent_id() {
            None => master.register(&self.info).await,
            Some(agent_id) => {
                let inventory = self.inventory();
                master.reregister(&agent_id, &self.info, &inventory).await
            }
        };

        if let Err(e) = result {
            warn!(attempt, error = %e, "registration attempt failed");
        }

        ctx.notify_after(
            self.registration_backoff.delay(attempt),
            AgentMessage::RetryRegistration {
                attempt: attempt + 1,
            },
        );
    }

    async fn handle_registered(&mut self, agent_id: AgentId, reregistered: bool) {
        if let Some(existing) = &self.info.agent_id {
            if *existing != agent_id {
                // A different id means the master no longer knows this
                // node; running on would split-brain the checkpoint tree.
                error!(
                    existing = %existing,
                    assigned = %agent_id,
                    "master assigned a different agent id"
                );
                std::process::abort();
            }
        }

        info!(agent_id = %agent_id, reregistered, "registered with master");
        self.info.agent_id = Some(agent_id.clone());
        self.registration = RegistrationState::Registered;

        self.guard_checkpoint(checkpoint::checkpoint(
            &paths::agent_info_path(&self.config.work_dir, &agent_id),
            &self.info,
        ));
    }

    async fn handle_no_master(&mut self) {
        info!("master lost; disconnected");
        self.master = None;
        self.registration = RegistrationState::Disconnected;
        let _ = self
            .update_manager
            .send(UpdateManagerMessage::MasterChanged { master: None })
            .await;
    }

    // -------------------------------------------------------------------------
    // Task launch
    // -------------------------------------------------------------------------

    async fn handle_run_task(
        &mut self,
        framework_id: FrameworkId,
        framework_info: FrameworkInfo,
        scheduler_endpoint: Option<String>,
        task: TaskInfo,
        ctx: &ActorContext<AgentMessage>,
    ) {
        if self.halting {
            warn!(task_id = %task.task_id, "dropping task: agent is shutting down");
            return;
        }

        if !task.is_well_formed() {
            warn!(
                task_id = %task.task_id,
                "dropping malformed task: exactly one of command/executor required"
            );
            return;
        }

        let Some(agent_id) = self.agent_id() else {
            warn!(task_id = %task.task_id, "dropping task: agent not registered");
            return;
        };

        // First task for an unknown framework creates it.
        let is_new = self.registry.framework(&framework_id).is_none();
        let max_completed_executors = self.config.max_completed_executors_per_framework;
        let framework = self.registry.ensure_framework(
            framework_id.clone(),
            framework_info,
            scheduler_endpoint,
            max_completed_executors,
        );

        if framework.shutdown {
            let executor_id = derived_executor_id(&task);
            let task_id = task.task_id.clone();
            self.synthesize(
                framework_id,
                executor_id,
                None,
                task_id,
                TaskState::Lost,
                "framework is shutting down".to_string(),
            )
            .await;
            return;
        }

        if is_new {
            let info = framework.info.clone();
            self.guard_checkpoint(checkpoint::checkpoint(
                &paths::framework_info_path(&self.config.work_dir, &agent_id, &framework_id),
                &info,
            ));
        }

        let framework = self
            .registry
            .framework_mut(&framework_id)
            .expect("framework ensured above");

        // A task id the framework already has on this agent is a protocol
        // violation, dropped before it can trip the registry's invariant.
        if framework.executor_for_task(&task.task_id).is_some() {
            warn!(task_id = %task.task_id, "dropping task with duplicate id");
            return;
        }

        let framework = self
            .registry
            .framework_mut(&framework_id)
            .expect("framework ensured above");
        let executor_info = framework.executor_info_for(&task, &self.config.launcher_dir);
        let executor_id = executor_info.executor_id.clone();

        enum Disposition {
            ExecutorShutdown,
            Dispatch(ContainerId),
            Queue(ContainerId),
            LaunchNew(ContainerId),
        }

        let exists = framework.executor(&executor_id).is_some();
        let disposition = if exists {
            let executor = framework.executor_mut(&executor_id).expect("probed above");
            if executor.shutdown {
                Disposition::ExecutorShutdown
            } else {
                let container_id = executor.container_id;
                if executor.registered {
                    executor.launch_task(&task);
                    Disposition::Dispatch(container_id)
                } else {
                    executor.queue_task(task.clone());
                    Disposition::Queue(container_id)
                }
            }
        } else {
            let container_id = ContainerId::new();
            let sandbox = paths::sandbox_dir(
                &self.config.work_dir,
                &agent_id,
                &framework_id,
                &executor_id,
                &container_id,
            );
            let executor = framework.create_executor(
                executor_info.clone(),
                container_id,
                sandbox,
                self.config.max_completed_tasks_per_executor,
            );
            executor.queue_task(task.clone());
            Disposition::LaunchNew(container_id)
        };

        match disposition {
            Disposition::ExecutorShutdown => {
                let task_id = task.task_id.clone();
                self.synthesize(
                    framework_id,
                    executor_id,
                    None,
                    task_id,
                    TaskState::Lost,
                    "executor is shutting down".to_string(),
                )
                .await;
            }

            Disposition::Dispatch(container_id) => {
                self.checkpoint_task(&agent_id, &framework_id, &executor_id, &container_id, &task);
                self.update_executor_limits(&framework_id, &executor_id).await;

                let endpoint = self
                    .executor_endpoints
                    .get(&(framework_id.clone(), executor_id.clone()))
                    .cloned();
                if let Some(endpoint) = endpoint {
                    if let Err(e) = endpoint.run_task(&task).await {
                        warn!(task_id = %task.task_id, error = %e, "run task delivery failed");
                    }
                } else {
                    warn!(
                        executor_id = %executor_id,
                        "registered executor has no endpoint"
                    );
                }
            }

            Disposition::Queue(container_id) => {
                self.checkpoint_task(&agent_id, &framework_id, &executor_id, &container_id, &task);
            }

            Disposition::LaunchNew(container_id) => {
                self.guard_checkpoint(checkpoint::checkpoint(
                    &paths::executor_info_path(
                        &self.config.work_dir,
                        &agent_id,
                        &framework_id,
                        &executor_id,
                        &container_id,
                    ),
                    &executor_info,
                ));
                self.checkpoint_task(&agent_id, &framework_id, &executor_id, &container_id, &task);

                let framework = self
                    .registry
                    .framework(&framework_id)
                    .expect("framework exists");
                let launch = Launch {
                    framework_id: framework_id.clone(),
                    executor_id: executor_id.clone(),
                    container_id,
                    command: executor_info.command.clone(),
                    sandbox: paths::sandbox_dir(
                        &self.config.work_dir,
                        &agent_id,
                        &framework_id,
                        &executor_id,
                        &container_id,
                    ),
                    resources: executor_info.resources + task.resources,
                    user: framework.info.user.clone(),
                };

                // The launch completes as a message-to-self; the executor
                // may have been shut down by then.
                let isolator = Arc::clone(&self.isolator);
                let handle = ctx.self_handle();
                tokio::spawn(async move {
                    match isolator.launch(launch).await {
                        Ok(launched) => {
                            let pid = launched.pid;
                            let _ = handle
                                .send(AgentMessage::ExecutorLaunched {
                                    framework_id: framework_id.clone(),
                                    executor_id: executor_id.clone(),
                                    container_id,
                                    result: Ok(pid),
                                })
                                .await;

                            let termination =
                                launched.termination.await.unwrap_or(Termination::Unknown);
                            let _ = handle
                                .send(AgentMessage::ExecutorTerminated {
                                    framework_id,
                                    executor_id,
                                    container_id,
                                    termination,
                                })
                                .await;
                        }
                        Err(e) => {
                            let _ = handle
                                .send(AgentMessage::ExecutorLaunched {
                                    framework_id,
                                    executor_id,
                                    container_id,
                                    result: Err(e.to_string()),
                                })
                                .await;
                        }
                    }
                });
            }
        }
    }

    /// Re-applies an executor's limits after its task set changed.
    async fn update_executor_limits(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let resources = self
            .registry
            .framework(framework_id)
            .and_then(|f| f.executor(executor_id))
            .map(|e| e.resources);

        if let Some(resources) = resources {
            if let Err(e) = self
                .isolator
                .update(framework_id, executor_id, resources)
                .await
            {
                debug!(%executor_id, error = %e, "limit update failed");
            }
        }
    }

    fn checkpoint_task(
        &self,
        agent_id: &AgentId,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        container_id: &ContainerId,
        task: &TaskInfo,
    ) {
        self.guard_checkpoint(checkpoint::checkpoint(
            &paths::task_info_path(
                &self.config.work_dir,
                agent_id,
                framework_id,
                executor_id,
                container_id,
                &task.task_id,
            ),
            task,
        ));
    }

    async fn handle_executor_launched(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        result: Result<i32, String>,
        ctx: &ActorContext<AgentMessage>,
    ) {
        let current = self
            .registry
            .framework_mut(&framework_id)
            .and_then(|f| f.executor_mut(&executor_id))
            .filter(|e| e.container_id == container_id)
            .is_some();

        match result {
            Ok(pid) => {
                if !current {
                    // The executor was torn down while the launch was in
                    // flight; reap the stray process.
                    warn!(%executor_id, pid, "launch completed for removed executor; destroying");
                    self.isolator.destroy(&framework_id, &executor_id).await;
                    return;
                }

                let executor = self
                    .registry
                    .framework_mut(&framework_id)
                    .and_then(|f| f.executor_mut(&executor_id))
                    .expect("checked above");
                executor.pid = Some(pid);

                if let Some(agent_id) = self.agent_id() {
                    self.guard_checkpoint(checkpoint::checkpoint(
                        &paths::forked_pid_path(
                            &self.config.work_dir,
                            &agent_id,
                            &framework_id,
                            &executor_id,
                            &container_id,
                        ),
                        &pid,
                    ));
                }

                self.pids.insert(pid, (framework_id, executor_id, container_id));
                self.reaper.monitor(pid).await;
            }

            Err(e) => {
                warn!(%executor_id, error = %e, "executor launch failed");
                self.executor_terminated(
                    framework_id,
                    executor_id,
                    container_id,
                    Termination::Unknown,
                    Some(format!("executor launch failed: {e}")),
                    TaskState::Failed,
                    ctx,
                )
                .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Executor registration
    // -------------------------------------------------------------------------

    async fn handle_register_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        address: Option<String>,
        endpoint: Arc<dyn ExecutorEndpoint>,
    ) {
        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            warn!(%executor_id, "registration from unknown framework; shutting executor down");
            let _ = endpoint.shutdown().await;
            return;
        };

        let Some(executor) = framework.executor_mut(&executor_id) else {
            warn!(%executor_id, "registration from unknown executor; shutting it down");
            let _ = endpoint.shutdown().await;
            return;
        };

        if executor.shutdown {
            info!(%executor_id, "executor registered while shutting down");
            let _ = endpoint.shutdown().await;
            return;
        }

        info!(%framework_id, %executor_id, "executor registered");
        executor.registered = true;
        let container_id = executor.container_id;

        // Flush the queue: everything waiting moves to launched and is
        // dispatched in one batch.
        let queued: Vec<TaskInfo> = executor.queued_tasks.values().cloned().collect();
        for task in &queued {
            executor.launch_task(task);
        }

        if let (Some(agent_id), Some(address)) = (self.agent_id(), address) {
            self.guard_checkpoint(checkpoint::checkpoint(
                &paths::libprocess_pid_path(
                    &self.config.work_dir,
                    &agent_id,
                    &framework_id,
                    &executor_id,
                    &container_id,
                ),
                &address,
            ));
        }

        if !queued.is_empty() {
            self.update_executor_limits(&framework_id, &executor_id).await;
        }

        self.executor_endpoints
            .insert((framework_id, executor_id), Arc::clone(&endpoint));

        for task in &queued {
            if let Err(e) = endpoint.run_task(task).await {
                warn!(task_id = %task.task_id, error = %e, "run task delivery failed");
            }
        }
    }

    async fn handle_reregister_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        tasks: Vec<Task>,
        updates: Vec<StatusUpdate>,
        address: Option<String>,
        endpoint: Arc<dyn ExecutorEndpoint>,
        ctx: &ActorContext<AgentMessage>,
    ) {
        let key = (framework_id.clone(), executor_id.clone());

        let Some(executor) = self
            .registry
            .framework_mut(&framework_id)
            .and_then(|f| f.executor_mut(&executor_id))
        else {
            warn!(%executor_id, "re-registration from unknown executor; shutting it down");
            let _ = endpoint.shutdown().await;
            return;
        };

        info!(%framework_id, %executor_id, "executor re-registered");
        executor.registered = true;
        let container_id = executor.container_id;
        let shutting_down = executor.shutdown;

        // Reconcile in-memory task states with what the executor reports.
        for task in &tasks {
            executor.update_task_state(&task.task_id, task.state);
        }

        if let (Some(agent_id), Some(address)) = (self.agent_id(), address) {
            self.guard_checkpoint(checkpoint::checkpoint(
                &paths::libprocess_pid_path(
                    &self.config.work_dir,
                    &agent_id,
                    &framework_id,
                    &executor_id,
                    &container_id,
                ),
                &address,
            ));
        }

        self.executor_endpoints
            .insert(key.clone(), Arc::clone(&endpoint));

        // Unacknowledged updates the executor retained: replayed through
        // the pipeline, where id-dedup makes re-delivery harmless.
        for update in updates {
            let updates_path = self.updates_path_for(
                &framework_id,
                &executor_id,
                &container_id,
                &update.task_id,
            );
            let _ = self
                .update_manager
                .send(UpdateManagerMessage::Update {
                    update,
                    updates_path,
                })
                .await;
        }

        if shutting_down {
            let _ = endpoint.shutdown().await;
        }

        if self.recovering.remove(&key) && self.recovering.is_empty() && !self.recovered {
            self.finish_recovery(ctx);
        }
    }

    // -------------------------------------------------------------------------
    // Status updates
    // -------------------------------------------------------------------------

    async fn handle_status_update(&mut self, update: StatusUpdate) {
        let framework_id = update.framework_id.clone();

        let container_id = self
            .registry
            .framework_mut(&framework_id)
            .and_then(|f| f.executor_for_task_mut(&update.task_id))
            .map(|executor| {
                executor.update_task_state(&update.task_id, update.state);
                executor.container_id
            });

        let Some(container_id) = container_id else {
            warn!(
                task_id = %update.task_id,
                state = %update.state,
                "status update for unknown task"
            );
            self.registry.stats.invalid_status_updates += 1;
            return;
        };

        self.registry.stats.valid_status_updates += 1;
        self.registry.stats.record_task_state(update.state);

        let updates_path = self.updates_path_for(
            &framework_id,
            &update.executor_id,
            &container_id,
            &update.task_id,
        );
        let _ = self
            .update_manager
            .send(UpdateManagerMessage::Update {
                update,
                updates_path,
            })
            .await;
    }

    async fn handle_update_acked(&mut self, acked: AckedUpdate) {
        let update = &acked.update;
        let key = (update.framework_id.clone(), update.executor_id.clone());

        // Executor-bound acknowledgement, when the executor is still alive.
        if let Some(endpoint) = self.executor_endpoints.get(&key).cloned() {
            if let Err(e) = endpoint
                .status_update_ack(&update.task_id, &update.update_id)
                .await
            {
                debug!(task_id = %update.task_id, error = %e, "executor ack delivery failed");
            }
        }

        if !acked.terminal {
            return;
        }

        // A terminal acknowledgement retires the task.
        let mut remove = false;
        let mut executor_alive = false;
        if let Some(framework) = self.registry.framework_mut(&update.framework_id) {
            if let Some(executor) = framework.executor_mut(&update.executor_id) {
                executor.complete_task(&update.task_id);
                executor_alive = true;
            }
            remove = acked.framework_open_streams == 0 && framework.is_removable();
        }

        if executor_alive {
            self.update_executor_limits(&update.framework_id, &update.executor_id)
                .await;
        }

        if remove {
            self.remove_framework(update.framework_id.clone()).await;
        }
    }

    // -------------------------------------------------------------------------
    // Kill / shutdown
    // -------------------------------------------------------------------------

    async fn handle_kill_task(&mut self, framework_id: FrameworkId, task_id: TaskId) {
        // Probe immutably first; the failure paths need the agent mutably.
        let target = self
            .registry
            .framework(&framework_id)
            .and_then(|f| f.executor_for_task(&task_id))
            .map(|e| {
                (
                    e.executor_id.clone(),
                    e.container_id,
                    e.queued_tasks.contains_key(&task_id),
                )
            });

        let Some((executor_id, container_id, queued)) = target else {
            warn!(%task_id, "kill for unknown task");
            let executor_id = ExecutorId::parse(task_id.as_str()).expect("task id is valid");
            self.synthesize(
                framework_id,
                executor_id,
                None,
                task_id,
                TaskState::Lost,
                "task is unknown to this agent".to_string(),
            )
            .await;
            return;
        };

        if queued {
            // Never dispatched: the kill resolves entirely on the agent.
            if let Some(executor) = self
                .registry
                .framework_mut(&framework_id)
                .and_then(|f| f.executor_mut(&executor_id))
            {
                executor.queued_tasks.remove(&task_id);
            }
            self.synthesize(
                framework_id,
                executor_id,
                Some(container_id),
                task_id,
                TaskState::Killed,
                "killed before delivery to executor".to_string(),
            )
            .await;
            return;
        }

        let endpoint = self
            .executor_endpoints
            .get(&(framework_id.clone(), executor_id.clone()))
            .cloned();
        match endpoint {
            Some(endpoint) => {
                if let Err(e) = endpoint.kill_task(&task_id).await {
                    warn!(%task_id, error = %e, "kill task delivery failed");
                }
            }
            None => {
                // The executor has not registered yet; its termination or
                // registration will settle the task either way.
                warn!(%task_id, "kill for task on unregistered executor deferred");
            }
        }
    }

    async fn handle_shutdown_framework(
        &mut self,
        framework_id: FrameworkId,
        ctx: &ActorContext<AgentMessage>,
    ) {
        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            warn!(%framework_id, "shutdown for unknown framework");
            return;
        };

        info!(%framework_id, "shutting down framework");
        framework.shutdown = true;
        let executor_ids: Vec<ExecutorId> = framework.executors.keys().cloned().collect();

        if executor_ids.is_empty() {
            self.remove_framework(framework_id).await;
            return;
        }

        for executor_id in executor_ids {
            self.shutdown_executor(framework_id.clone(), executor_id, ctx)
                .await;
        }
    }

    /// Phase one of the two-phase shutdown: a polite message and a timer.
    /// Phase two (the timer handler) destroys through the isolator.
    async fn shutdown_executor(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        ctx: &ActorContext<AgentMessage>,
    ) {
        let Some(executor) = self
            .registry
            .framework_mut(&framework_id)
            .and_then(|f| f.executor_mut(&executor_id))
        else {
            return;
        };

        if executor.shutdown {
            return;
        }

        info!(%framework_id, %executor_id, "shutting down executor");
        executor.shutdown = true;
        let container_id = executor.container_id;

        let endpoint = self
            .executor_endpoints
            .get(&(framework_id.clone(), executor_id.clone()))
            .cloned();
        if let Some(endpoint) = endpoint {
            if let Err(e) = endpoint.shutdown().await {
                debug!(%executor_id, error = %e, "shutdown message delivery failed");
            }
        }

        ctx.notify_after(
            self.config.executor_shutdown_grace_period,
            AgentMessage::ShutdownExecutorTimeout {
                framework_id,
                executor_id,
                container_id,
            },
        );
    }

    async fn handle_shutdown_executor_timeout(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
    ) {
        // Re-validate: the executor may have exited within the grace
        // period, or this may be a stale timer for an earlier run.
        let still_running = self
            .registry
            .framework(&framework_id)
            .and_then(|f| f.executor(&executor_id))
            .is_some_and(|e| e.container_id == container_id);

        if !still_running {
            return;
        }

        warn!(%framework_id, %executor_id, "grace period expired; destroying executor");
        self.isolator.destroy(&framework_id, &executor_id).await;
    }

    // -------------------------------------------------------------------------
    // Executor termination
    // -------------------------------------------------------------------------

    async fn handle_process_exited(&mut self, exit: ProcessExit, ctx: &ActorContext<AgentMessage>) {
        let Some((framework_id, executor_id, container_id)) = self.pids.remove(&exit.pid) else {
            debug!(pid = exit.pid, "exit notification for untracked pid");
            return;
        };

        self.executor_terminated(
            framework_id,
            executor_id,
            container_id,
            exit.termination,
            None,
            TaskState::Lost,
            ctx,
        )
        .await;
    }

    /// Reconciles a terminated executor: synthesizes terminal updates for
    /// whatever was still live, archives the executor, and schedules its
    /// sandbox for collection.
    #[allow(clippy::too_many_arguments)]
    async fn executor_terminated(
        &mut self,
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        container_id: ContainerId,
        termination: Termination,
        message: Option<String>,
        default_state: TaskState,
        ctx: &ActorContext<AgentMessage>,
    ) {
        let key = (framework_id.clone(), executor_id.clone());

        let Some(framework) = self.registry.framework_mut(&framework_id) else {
            debug!(%executor_id, "termination for unknown framework");
            return;
        };
        let Some(executor) = framework.executor_mut(&executor_id) else {
            // Already reconciled via the other notification path.
            debug!(%executor_id, "termination for unknown executor");
            return;
        };
        if executor.container_id != container_id {
            debug!(%executor_id, "termination for a stale run");
            return;
        }

        info!(
            %framework_id,
            %executor_id,
            ?termination,
            "executor terminated"
        );

        let live = executor.drain_live_tasks();
        let sandbox = executor.directory.clone();
        let pid = executor.pid;
        let unacked_terminal = !executor.launched_tasks.is_empty();

        framework.destroy_executor(&executor_id);
        let removable = framework.is_removable();

        self.executor_endpoints.remove(&key);
        if let Some(pid) = pid {
            self.pids.remove(&pid);
        }

        // A known non-zero exit code is a failure; everything else is
        // indistinguishable from a lost executor.
        let state = match termination {
            Termination::Exited(code) if code != 0 => TaskState::Failed,
            Termination::Exited(_) => default_state,
            Termination::Signaled(_) => default_state,
            Termination::Unknown => default_state,
        };

        let reason = message.unwrap_or_else(|| match termination {
            Termination::Exited(code) => format!("executor exited with status {code}"),
            Termination::Signaled(signal) => format!("executor killed by signal {signal}"),
            Termination::Unknown => "executor terminated".to_string(),
        });

        let had_live = !live.is_empty();
        for task in live {
            self.synthesize(
                framework_id.clone(),
                executor_id.clone(),
                Some(container_id),
                task.task_id,
                state,
                reason.clone(),
            )
            .await;
        }

        self.gc.schedule(sandbox, self.config.gc_delay);

        if self.recovering.remove(&key) && self.recovering.is_empty() && !self.recovered {
            self.finish_recovery(ctx);
        }

        // With nothing synthesized and no terminal acks outstanding, the
        // framework can be removed right away; otherwise removal waits for
        // the last terminal acknowledgement.
        if !had_live && !unacked_terminal && removable {
            self.remove_framework(framework_id).await;
        }
    }

    async fn remove_framework(&mut self, framework_id: FrameworkId) {
        info!(%framework_id, "removing framework");
        self.registry.remove_framework(&framework_id);
        let _ = self
            .update_manager
            .send(UpdateManagerMessage::CleanupFramework {
                framework_id: framework_id.clone(),
            })
            .await;

        if let Some(agent_id) = self.agent_id() {
            let meta = paths::framework_dir(&self.config.work_dir, &agent_id, &framework_id);
            self.gc.schedule(meta, self.config.gc_delay);
        }
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    async fn restore(
        &mut self,
        state: checkpoint::AgentState,
        ctx: &ActorContext<AgentMessage>,
    ) -> Result<(), ActorError> {
        let Some(agent_id) = state.info.agent_id.clone() else {
            // A slave.info without an id was never registered; nothing to
            // reconcile.
            info!("checkpoint has no agent id; treating as cold start");
            self.recovered = true;
            return Ok(());
        };

        info!(agent_id = %agent_id, "recovering from checkpoint");
        if state.info.hostname != self.info.hostname {
            warn!(
                checkpointed = %state.info.hostname,
                current = %self.info.hostname,
                "hostname changed across restart"
            );
        }
        self.info.agent_id = Some(agent_id.clone());

        let mut recovered_runs = Vec::new();
        let mut streams = Vec::new();
        let mut dead_executors = Vec::new();

        for framework_state in state.frameworks {
            let framework_id = framework_state.framework_id.clone();

            let Some(framework_info) = framework_state.info else {
                self.recovery_error(format!(
                    "framework {framework_id} has no checkpointed info"
                ))?;
                continue;
            };

            let mut framework = Framework::new(
                framework_id.clone(),
                framework_info,
                None,
                self.config.max_completed_executors_per_framework,
            );

            for executor_state in framework_state.executors {
                let executor_id = executor_state.executor_id.clone();
                let container_id = executor_state.container_id;
                let key = (framework_id.clone(), executor_id.clone());

                let Some(executor_info) = executor_state.info else {
                    self.recovery_error(format!(
                        "executor {executor_id} run {container_id} has no checkpointed info"
                    ))?;
                    self.gc.schedule(
                        paths::run_dir(
                            &self.config.work_dir,
                            &agent_id,
                            &framework_id,
                            &executor_id,
                            &container_id,
                        ),
                        Duration::ZERO,
                    );
                    continue;
                };

                let sandbox = paths::sandbox_dir(
                    &self.config.work_dir,
                    &agent_id,
                    &framework_id,
                    &executor_id,
                    &container_id,
                );
                let executor = framework.create_executor(
                    executor_info,
                    container_id,
                    sandbox,
                    self.config.max_completed_tasks_per_executor,
                );
                executor.pid = executor_state.forked_pid;

                for task_state in executor_state.tasks {
                    if let Some(task_info) = &task_state.info {
                        executor.launch_task(task_info);

                        // The latest durably-logged state is the best
                        // in-memory guess until the executor reconciles.
                        let latest = task_state.records.iter().rev().find_map(|r| match r {
                            UpdateLogRecord::Update { update } => Some(update.state),
                            UpdateLogRecord::Ack { .. } => None,
                        });
                        if let Some(latest) = latest {
                            executor.update_task_state(&task_state.task_id, latest);
                        }
                    }

                    streams.push(RecoveredStream {
                        framework_id: framework_id.clone(),
                        executor_id: executor_id.clone(),
                        task_id: task_state.task_id.clone(),
                        updates_path: paths::updates_path(
                            &self.config.work_dir,
                            &agent_id,
                            &framework_id,
                            &executor_id,
                            &container_id,
                            &task_state.task_id,
                        ),
                        records: task_state.records,
                    });
                }

                if let Some(pid) = executor_state.forked_pid {
                    self.pids.insert(pid, (framework_id.clone(), executor_id.clone(), container_id));
                    self.reaper.monitor(pid).await;
                } else {
                    // Never forked: there is no process to wait for.
                    dead_executors.push((framework_id.clone(), executor_id.clone(), container_id));
                }

                recovered_runs.push(RecoveredRun {
                    framework_id: framework_id.clone(),
                    executor_id: executor_id.clone(),
                    container_id,
                    pid: executor_state.forked_pid,
                });
                self.recovering.insert(key);
            }

            self.registry.insert_framework(framework);
        }

        let _ = self
            .update_manager
            .send(UpdateManagerMessage::Recover { streams })
            .await;

        if let Err(e) = self.isolator.recover(recovered_runs).await {
            self.recovery_error(format!("isolator recovery failed: {e}"))?;
        }

        for (framework_id, executor_id, container_id) in dead_executors {
            ctx.notify(AgentMessage::ExecutorTerminated {
                framework_id,
                executor_id,
                container_id,
                termination: Termination::Unknown,
            });
        }

        match self.config.recover {
            RecoverMode::Cleanup => {
                info!("cleanup recovery: shutting down all recovered executors");
                let keys: Vec<_> = self.recovering.iter().cloned().collect();
                for (framework_id, executor_id) in keys {
                    self.shutdown_executor(framework_id, executor_id, ctx).await;
                }
            }
            RecoverMode::Reconnect => {
                info!(
                    executors = self.recovering.len(),
                    timeout_secs = self.config.executor_reregister_timeout.as_secs(),
                    "reconnect recovery: waiting for executors to re-register"
                );
                ctx.notify_after(
                    self.config.executor_reregister_timeout,
                    AgentMessage::ReregisterExecutorTimeout,
                );
            }
        }

        if self.recovering.is_empty() {
            self.finish_recovery(ctx);
        }

        Ok(())
    }

    /// Under strict recovery any error is fatal; otherwise it is logged and
    /// the affected entity is skipped (and shut down where applicable).
    fn recovery_error(&self, message: String) -> Result<(), ActorError> {
        if self.config.strict {
            Err(ActorError::Fatal(message))
        } else {
            warn!("{message}; continuing non-strict recovery");
            Ok(())
        }
    }

    fn finish_recovery(&mut self, ctx: &ActorContext<AgentMessage>) {
        self.recovered = true;
        info!("recovery settled; accepting tasks");

        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            let handle = ctx.self_handle();
            tokio::spawn(async move {
                for msg in deferred {
                    if handle.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    }

    async fn handle_reregister_timeout(&mut self, ctx: &ActorContext<AgentMessage>) {
        if self.recovering.is_empty() {
            return;
        }

        warn!(
            executors = self.recovering.len(),
            "executors failed to re-register in time; shutting them down"
        );
        let keys: Vec<_> = self.recovering.iter().cloned().collect();
        for (framework_id, executor_id) in keys {
            self.shutdown_executor(framework_id, executor_id, ctx).await;
        }
    }

    // -------------------------------------------------------------------------
    // Disk usage control loop
    // -------------------------------------------------------------------------

    async fn handle_check_disk_usage(&mut self, ctx: &ActorContext<AgentMessage>) {
        match disk_usage(&self.config.work_dir) {
            Ok(usage) => {
                let age = permitted_age(self.config.gc_delay, usage);
                debug!(
                    usage,
                    permitted_age_secs = age.as_secs(),
                    pending = self.gc.pending(),
                    "disk usage check"
                );
                self.gc.prune(age);
            }
            Err(e) => {
                warn!(error = %e, "disk usage check failed");
            }
        }

        self.gc.sweep().await;
        ctx.notify_after(self.config.disk_watch_interval, AgentMessage::CheckDiskUsage);
    }

    // -------------------------------------------------------------------------
    // Agent shutdown
    // -------------------------------------------------------------------------

    async fn handle_shutdown(&mut self, ctx: &ActorContext<AgentMessage>) {
        info!("agent shutting down");
        self.halting = true;

        if let (Some(master), Some(agent_id)) = (self.master.clone(), self.agent_id()) {
            if let Err(e) = master.unregister(&agent_id).await {
                warn!(error = %e, "unregister failed");
            }
        }

        let framework_ids = self.registry.framework_ids();
        for framework_id in framework_ids {
            if let Some(framework) = self.registry.framework_mut(&framework_id) {
                framework.shutdown = true;
                let executor_ids: Vec<ExecutorId> =
                    framework.executors.keys().cloned().collect();
                for executor_id in executor_ids {
                    self.shutdown_executor(framework_id.clone(), executor_id, ctx)
                        .await;
                }
            }
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            registration: self.registration,
            agent_id: self.agent_id(),
            recovered: self.recovered,
            framework_count: self.registry.frameworks().count(),
            stats: self.registry.stats.clone(),
        }
    }
}

/// The executor id a task resolves to before its executor exists: a custom
/// executor's own id, or the task id for command tasks.
fn derived_executor_id(task: &TaskInfo) -> ExecutorId {
    task.executor
        .as_ref()
        .map(|e| e.executor_id.clone())
        .unwrap_or_else(|| {
            ExecutorId::parse(task.task_id.as_str()).expect("task id is a valid executor id")
        })
}

#[async_trait]
impl Actor for Agent {
    type Message = AgentMessage;

    fn name(&self) -> &str {
        "agent"
    }

    async fn on_start(
        &mut self,
        ctx: &mut ActorContext<AgentMessage>,
    ) -> Result<(), ActorError> {
        std::fs::create_dir_all(&self.config.work_dir)
            .map_err(|e| ActorError::Fatal(format!("cannot create work dir: {e}")))?;

        match checkpoint::state::recover(&self.config.work_dir) {
            Ok(Some(state)) => self.restore(state, ctx).await?,
            Ok(None) => {
                info!("cold start: no checkpointed state");
                self.recovered = true;
            }
            Err(e) => {
                self.recovery_error(format!("checkpoint recovery failed: {e}"))?;
                self.recovered = true;
            }
        }

        ctx.notify_after(self.config.disk_watch_interval, AgentMessage::CheckDiskUsage);
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: AgentMessage,
        ctx: &mut ActorContext<AgentMessage>,
    ) -> Result<Flow, ActorError> {
        // New work is deferred until recovery has settled; everything else
        // (acks, registrations, terminations) must flow for recovery to
        // make progress.
        if !self.recovered && matches!(msg, AgentMessage::RunTask { .. }) {
            debug!(?msg, "deferring until recovery settles");
            self.deferred.push(msg);
            return Ok(Flow::Continue);
        }

        match msg {
            AgentMessage::NewMasterDetected { master } => {
                self.handle_new_master(master, ctx).await;
            }
            AgentMessage::NoMasterDetected => {
                self.handle_no_master().await;
            }
            AgentMessage::MasterDetectionFailure { error } => {
                error!(error = %error, "master detection failed");
                self.handle_no_master().await;
            }
            AgentMessage::Registered { agent_id } => {
                self.handle_registered(agent_id, false).await;
            }
            AgentMessage::Reregistered { agent_id } => {
                self.handle_registered(agent_id, true).await;
            }
            AgentMessage::RetryRegistration { attempt } => {
                if matches!(
                    self.registration,
                    RegistrationState::Registering | RegistrationState::Reregistering
                ) {
                    self.attempt_registration(attempt, ctx).await;
                }
            }
            AgentMessage::Ping => {
                if let (Some(master), Some(agent_id)) = (self.master.clone(), self.agent_id()) {
                    if let Err(e) = master.pong(&agent_id).await {
                        debug!(error = %e, "pong failed");
                    }
                }
            }

            AgentMessage::RunTask {
                framework_id,
                framework_info,
                scheduler_endpoint,
                task,
            } => {
                self.handle_run_task(framework_id, framework_info, scheduler_endpoint, task, ctx)
                    .await;
            }
            AgentMessage::KillTask {
                framework_id,
                task_id,
            } => {
                self.handle_kill_task(framework_id, task_id).await;
            }
            AgentMessage::ShutdownFramework { framework_id } => {
                self.handle_shutdown_framework(framework_id, ctx).await;
            }
            AgentMessage::UpdateFramework {
                framework_id,
                scheduler_endpoint,
            } => match self.registry.framework_mut(&framework_id) {
                Some(framework) => {
                    debug!(%framework_id, endpoint = %scheduler_endpoint, "framework endpoint updated");
                    framework.scheduler_endpoint = Some(scheduler_endpoint);
                }
                None => warn!(%framework_id, "endpoint update for unknown framework"),
            },
            AgentMessage::FrameworkToExecutorMessage {
                framework_id,
                executor_id,
                data,
            } => {
                let key = (framework_id, executor_id);
                match self.executor_endpoints.get(&key).cloned() {
                    Some(endpoint) => {
                        self.registry.stats.valid_framework_messages += 1;
                        if let Err(e) = endpoint.framework_message(&data).await {
                            warn!(error = %e, "framework message delivery failed");
                        }
                    }
                    None => {
                        warn!(executor_id = %key.1, "framework message for unknown executor");
                        self.registry.stats.invalid_framework_messages += 1;
                    }
                }
            }
            AgentMessage::StatusUpdateAck {
                framework_id,
                task_id,
                update_id,
            } => {
                let _ = self
                    .update_manager
                    .send(UpdateManagerMessage::Ack {
                        framework_id,
                        task_id,
                        update_id,
                    })
                    .await;
            }

            AgentMessage::RegisterExecutor {
                framework_id,
                executor_id,
                address,
                endpoint,
            } => {
                self.handle_register_executor(framework_id, executor_id, address, endpoint)
                    .await;
            }
            AgentMessage::ReregisterExecutor {
                framework_id,
                executor_id,
                tasks,
                updates,
                address,
                endpoint,
            } => {
                self.handle_reregister_executor(
                    framework_id,
                    executor_id,
                    tasks,
                    updates,
                    address,
                    endpoint,
                    ctx,
                )
                .await;
            }
            AgentMessage::StatusUpdate { update } => {
                self.handle_status_update(update).await;
            }
            AgentMessage::ExecutorToFrameworkMessage {
                framework_id,
                executor_id,
                data,
            } => {
                let known = self
                    .registry
                    .framework(&framework_id)
                    .and_then(|f| f.executor(&executor_id))
                    .is_some();
                if known {
                    self.registry.stats.valid_framework_messages += 1;
                    if let Some(master) = self.master.clone() {
                        if let Err(e) = master
                            .framework_message(&framework_id, &executor_id, &data)
                            .await
                        {
                            warn!(error = %e, "framework message relay failed");
                        }
                    }
                } else {
                    warn!(%executor_id, "framework message from unknown executor");
                    self.registry.stats.invalid_framework_messages += 1;
                }
            }

            AgentMessage::ExecutorLaunched {
                framework_id,
                executor_id,
                container_id,
                result,
            } => {
                self.handle_executor_launched(framework_id, executor_id, container_id, result, ctx)
                    .await;
            }
            AgentMessage::ExecutorTerminated {
                framework_id,
                executor_id,
                container_id,
                termination,
            } => {
                self.executor_terminated(
                    framework_id,
                    executor_id,
                    container_id,
                    termination,
                    None,
                    TaskState::Lost,
                    ctx,
                )
                .await;
            }
            AgentMessage::ProcessExited(exit) => {
                self.handle_process_exited(exit, ctx).await;
            }
            AgentMessage::ShutdownExecutorTimeout {
                framework_id,
                executor_id,
                container_id,
            } => {
                self.handle_shutdown_executor_timeout(framework_id, executor_id, container_id)
                    .await;
            }
            AgentMessage::ReregisterExecutorTimeout => {
                self.handle_reregister_timeout(ctx).await;
            }
            AgentMessage::UpdateAcked(acked) => {
                self.handle_update_acked(acked).await;
            }
            AgentMessage::CheckDiskUsage => {
                self.handle_check_disk_usage(ctx).await;
            }
            AgentMessage::GetSnapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            AgentMessage::Shutdown => {
                self.handle_shutdown(ctx).await;
            }
        }

        Ok(Flow::Continue)
    }
}
