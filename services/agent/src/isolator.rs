//! Executor isolation interface.
//!
//! The agent holds any isolation backend behind this capability set:
//! launch, update, usage, destroy, recover. A posix implementation runs
//! executors as plain processes; a mock implementation drives tests. The
//! reaper remains the authority on process exit regardless of backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use armada_id::{ContainerId, ExecutorId, FrameworkId};
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::reaper::Termination;
use crate::registry::CommandInfo;
use crate::resources::{ResourceStatistics, Resources};

/// Errors surfaced by isolator implementations.
#[derive(Debug, Error)]
pub enum IsolatorError {
    /// The executor could not be started. Fatal for that executor: the
    /// agent synthesizes task failures for anything queued on it.
    #[error("failed to launch executor: {0}")]
    LaunchFailed(String),

    /// The referenced executor run is not known to the isolator.
    #[error("unknown executor run: {framework_id}/{executor_id}")]
    UnknownRun {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
    },
}

/// Everything an isolator needs to start one executor run.
#[derive(Debug, Clone)]
pub struct Launch {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub container_id: ContainerId,
    pub command: CommandInfo,
    pub sandbox: PathBuf,
    pub resources: Resources,
    pub user: String,
}

/// A successfully launched executor.
///
/// The termination future resolves when the isolator observes the executor
/// terminated, which is distinct from OS exit: container-level kills
/// complete it too.
pub struct Launched {
    pub pid: i32,
    pub termination: oneshot::Receiver<Termination>,
}

/// A checkpointed run handed back to the isolator on agent restart.
#[derive(Debug, Clone)]
pub struct RecoveredRun {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub container_id: ContainerId,
    pub pid: Option<i32>,
}

#[async_trait]
pub trait Isolator: Send + Sync {
    /// Starts an executor in its sandbox with resource limits applied.
    async fn launch(&self, launch: Launch) -> Result<Launched, IsolatorError>;

    /// Changes the applied limits of a running executor.
    async fn update(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resources: Resources,
    ) -> Result<(), IsolatorError>;

    /// Samples current usage for monitoring.
    async fn usage(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> Result<ResourceStatistics, IsolatorError>;

    /// Forcibly terminates an executor. Idempotent: destroying an unknown
    /// or already-dead run succeeds.
    async fn destroy(&self, framework_id: &FrameworkId, executor_id: &ExecutorId);

    /// Re-attaches to still-running executors after an agent restart.
    async fn recover(&self, runs: Vec<RecoveredRun>) -> Result<(), IsolatorError>;
}

// =============================================================================
// Posix isolator
// =============================================================================

struct PosixRun {
    pid: i32,
    resources: Resources,
}

/// Runs executors as plain child processes with no containment beyond a
/// sandbox working directory. Resource limits are recorded but not
/// enforced.
#[derive(Default)]
pub struct PosixIsolator {
    runs: std::sync::Arc<Mutex<HashMap<(FrameworkId, ExecutorId), PosixRun>>>,
}

impl PosixIsolator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Isolator for PosixIsolator {
    async fn launch(&self, launch: Launch) -> Result<Launched, IsolatorError> {
        tokio::fs::create_dir_all(&launch.sandbox)
            .await
            .map_err(|e| IsolatorError::LaunchFailed(format!("sandbox creation: {e}")))?;

        let stdout = std::fs::File::create(launch.sandbox.join("stdout"))
            .map_err(|e| IsolatorError::LaunchFailed(format!("stdout file: {e}")))?;
        let stderr = std::fs::File::create(launch.sandbox.join("stderr"))
            .map_err(|e| IsolatorError::LaunchFailed(format!("stderr file: {e}")))?;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&launch.command.value)
            .current_dir(&launch.sandbox)
            .envs(&launch.command.environment)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| IsolatorError::LaunchFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| IsolatorError::LaunchFailed("child has no pid".to_string()))?
            as i32;

        info!(
            framework_id = %launch.framework_id,
            executor_id = %launch.executor_id,
            container_id = %launch.container_id,
            pid,
            sandbox = %launch.sandbox.display(),
            "launched executor"
        );

        self.runs.lock().unwrap().insert(
            (launch.framework_id.clone(), launch.executor_id.clone()),
            PosixRun {
                pid,
                resources: launch.resources,
            },
        );

        let (tx, rx) = oneshot::channel();
        let key = (launch.framework_id, launch.executor_id);
        let runs = std::sync::Arc::clone(&self.runs);
        tokio::spawn(async move {
            let termination = match child.wait().await {
                Ok(status) => {
                    use std::os::unix::process::ExitStatusExt;
                    if let Some(code) = status.code() {
                        Termination::Exited(code)
                    } else if let Some(signal) = status.signal() {
                        Termination::Signaled(signal)
                    } else {
                        Termination::Unknown
                    }
                }
                Err(e) => {
                    warn!(error = %e, "wait on executor failed");
                    Termination::Unknown
                }
            };
            runs.lock().unwrap().remove(&key);
            let _ = tx.send(termination);
        });

        Ok(Launched {
            pid,
            termination: rx,
        })
    }

    async fn update(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        resources: Resources,
    ) -> Result<(), IsolatorError> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(&(framework_id.clone(), executor_id.clone()))
            .ok_or_else(|| IsolatorError::UnknownRun {
                framework_id: framework_id.clone(),
                executor_id: executor_id.clone(),
            })?;

        // No enforcement in the posix backend; the new limits are recorded
        // so usage reports them.
        run.resources = resources;
        debug!(%framework_id, %executor_id, %resources, "updated executor limits");
        Ok(())
    }

    async fn usage(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> Result<ResourceStatistics, IsolatorError> {
        let (pid, resources) = {
            let runs = self.runs.lock().unwrap();
            let run = runs
                .get(&(framework_id.clone(), executor_id.clone()))
                .ok_or_else(|| IsolatorError::UnknownRun {
                    framework_id: framework_id.clone(),
                    executor_id: executor_id.clone(),
                })?;
            (run.pid, run.resources)
        };

        Ok(ResourceStatistics {
            timestamp: Utc::now(),
            cpus_limit: resources.cpus,
            mem_limit_bytes: resources.mem_bytes,
            mem_rss_bytes: rss_bytes(pid),
        })
    }

    async fn destroy(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let run = self
            .runs
            .lock()
            .unwrap()
            .remove(&(framework_id.clone(), executor_id.clone()));

        if let Some(run) = run {
            info!(%framework_id, %executor_id, pid = run.pid, "destroying executor");
            match nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(run.pid),
                nix::sys::signal::Signal::SIGKILL,
            ) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => warn!(%framework_id, %executor_id, error = %e, "destroy failed"),
            }
        }
    }

    async fn recover(&self, runs: Vec<RecoveredRun>) -> Result<(), IsolatorError> {
        let mut map = self.runs.lock().unwrap();
        for run in runs {
            let Some(pid) = run.pid else {
                debug!(
                    framework_id = %run.framework_id,
                    executor_id = %run.executor_id,
                    "recovered run has no checkpointed pid; skipping"
                );
                continue;
            };

            info!(
                framework_id = %run.framework_id,
                executor_id = %run.executor_id,
                pid,
                "re-attached to executor"
            );
            map.insert(
                (run.framework_id, run.executor_id),
                PosixRun {
                    pid,
                    resources: Resources::default(),
                },
            );
        }
        Ok(())
    }
}

/// Resident set size from procfs, when available.
fn rss_bytes(pid: i32) -> Option<i64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: i64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    (page_size > 0).then(|| pages * page_size as i64)
}

// =============================================================================
// Mock isolator
// =============================================================================

struct MockRun {
    pid: i32,
    termination_tx: Option<oneshot::Sender<Termination>>,
}

#[derive(Default)]
struct MockState {
    launches: Vec<Launch>,
    destroys: Vec<(FrameworkId, ExecutorId)>,
    recovered: Vec<RecoveredRun>,
    runs: HashMap<(FrameworkId, ExecutorId), MockRun>,
    pid_override: Option<i32>,
    fail_launches: bool,
}

/// Mock isolator for tests: records calls and lets tests complete
/// termination futures on demand.
///
/// Launched "executors" report the test process's own pid, which is alive
/// for the duration of the test, so the reaper's liveness probe does not
/// reap them prematurely. `with_pid` substitutes a specific pid for
/// scenarios that need a dead one.
#[derive(Default)]
pub struct MockIsolator {
    state: Mutex<MockState>,
}

impl MockIsolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock that fails every launch.
    pub fn failing() -> Self {
        let isolator = Self::new();
        isolator.state.lock().unwrap().fail_launches = true;
        isolator
    }

    /// A mock whose launches report the given pid.
    pub fn with_pid(pid: i32) -> Self {
        let isolator = Self::new();
        isolator.state.lock().unwrap().pid_override = Some(pid);
        isolator
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn destroys(&self) -> Vec<(FrameworkId, ExecutorId)> {
        self.state.lock().unwrap().destroys.clone()
    }

    pub fn recovered_runs(&self) -> Vec<RecoveredRun> {
        self.state.lock().unwrap().recovered.clone()
    }

    /// Completes the termination future of a running mock executor.
    pub fn terminate(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        termination: Termination,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(run) = state
            .runs
            .get_mut(&(framework_id.clone(), executor_id.clone()))
        {
            if let Some(tx) = run.termination_tx.take() {
                let _ = tx.send(termination);
            }
        }
    }
}

#[async_trait]
impl Isolator for MockIsolator {
    async fn launch(&self, launch: Launch) -> Result<Launched, IsolatorError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_launches {
            return Err(IsolatorError::LaunchFailed(
                "mock isolator configured to fail".to_string(),
            ));
        }

        let pid = state.pid_override.unwrap_or(std::process::id() as i32);
        let (tx, rx) = oneshot::channel();

        state.launches.push(launch.clone());
        state.runs.insert(
            (launch.framework_id, launch.executor_id),
            MockRun {
                pid,
                termination_tx: Some(tx),
            },
        );

        Ok(Launched {
            pid,
            termination: rx,
        })
    }

    async fn update(
        &self,
        _framework_id: &FrameworkId,
        _executor_id: &ExecutorId,
        _resources: Resources,
    ) -> Result<(), IsolatorError> {
        Ok(())
    }

    async fn usage(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
    ) -> Result<ResourceStatistics, IsolatorError> {
        let state = self.state.lock().unwrap();
        state
            .runs
            .get(&(framework_id.clone(), executor_id.clone()))
            .map(|_| ResourceStatistics {
                timestamp: Utc::now(),
                cpus_limit: 0.0,
                mem_limit_bytes: 0,
                mem_rss_bytes: None,
            })
            .ok_or_else(|| IsolatorError::UnknownRun {
                framework_id: framework_id.clone(),
                executor_id: executor_id.clone(),
            })
    }

    async fn destroy(&self, framework_id: &FrameworkId, executor_id: &ExecutorId) {
        let mut state = self.state.lock().unwrap();
        state
            .destroys
            .push((framework_id.clone(), executor_id.clone()));

        // A forced destroy is observed as a kill by the termination future.
        if let Some(mut run) = state
            .runs
            .remove(&(framework_id.clone(), executor_id.clone()))
        {
            if let Some(tx) = run.termination_tx.take() {
                let _ = tx.send(Termination::Signaled(libc::SIGKILL));
            }
        }
    }

    async fn recover(&self, runs: Vec<RecoveredRun>) -> Result<(), IsolatorError> {
        self.state.lock().unwrap().recovered.extend(runs);
        Ok(())
    }
}
