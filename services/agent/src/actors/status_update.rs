//! Status-update manager: at-least-once, per-task in-order delivery of
//! task-state changes to the master.
//!
//! Each task has its own update stream. The head of the stream is the only
//! update in flight; later updates queue behind it until the master
//! acknowledges the head by echoing its id. Every produced update and
//! every acknowledgement is appended to the task's durable log before it
//! takes effect, so a restarted agent reconstructs exactly the streams it
//! had. Retransmission backs off exponentially and never gives up.
//!
//! Log appends happen in this actor's context: the agent actor hands an
//! update over and moves on without waiting for the fsync.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use armada_id::{ExecutorId, FrameworkId, TaskId, UpdateId};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::actors::core::{Actor, ActorContext, ActorError, BackoffPolicy, Flow};
use crate::checkpoint::{append_update_record, CheckpointError, UpdateLogRecord};
use crate::client::MasterEndpoint;
use crate::registry::StatusUpdate;

/// Acknowledgement handed back to the agent after the master confirmed an
/// update and the ack was checkpointed.
#[derive(Debug, Clone)]
pub struct AckedUpdate {
    pub update: StatusUpdate,
    /// True when the acknowledged update closed the stream.
    pub terminal: bool,
    /// Streams of the same framework still open after this ack. Zero means
    /// every task of the framework has reached a terminal acknowledged
    /// state, which gates framework removal.
    pub framework_open_streams: usize,
}

/// A task stream reconstructed from its checkpointed log.
#[derive(Debug)]
pub struct RecoveredStream {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub task_id: TaskId,
    pub updates_path: PathBuf,
    pub records: Vec<UpdateLogRecord>,
}

pub enum UpdateManagerMessage {
    /// Replay checkpointed streams. Sent once, before any other traffic.
    Recover { streams: Vec<RecoveredStream> },

    /// The master link changed: `Some` re-forwards every stream head,
    /// `None` pauses forwarding (retry timers keep running).
    MasterChanged {
        master: Option<Arc<dyn MasterEndpoint>>,
    },

    /// A new update produced by an executor or synthesized by the agent.
    Update {
        update: StatusUpdate,
        updates_path: Option<PathBuf>,
    },

    /// The master acknowledged an update.
    Ack {
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },

    /// Retransmit timer fired for a forwarded update.
    Retry {
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
    },

    /// Drop all streams of a removed framework.
    CleanupFramework { framework_id: FrameworkId },
}

impl std::fmt::Debug for UpdateManagerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recover { streams } => f
                .debug_struct("Recover")
                .field("streams", &streams.len())
                .finish(),
            Self::MasterChanged { master } => f
                .debug_struct("MasterChanged")
                .field("connected", &master.is_some())
                .finish(),
            Self::Update { update, .. } => f
                .debug_struct("Update")
                .field("task_id", &update.task_id)
                .field("state", &update.state)
                .field("update_id", &update.update_id)
                .finish(),
            Self::Ack {
                task_id, update_id, ..
            } => f
                .debug_struct("Ack")
                .field("task_id", task_id)
                .field("update_id", update_id)
                .finish(),
            Self::Retry {
                task_id, update_id, ..
            } => f
                .debug_struct("Retry")
                .field("task_id", task_id)
                .field("update_id", update_id)
                .finish(),
            Self::CleanupFramework { framework_id } => f
                .debug_struct("CleanupFramework")
                .field("framework_id", framework_id)
                .finish(),
        }
    }
}

/// Per-task stream state.
#[derive(Debug, Default)]
struct UpdateStream {
    /// Updates not yet acknowledged; the front is the one in flight.
    pending: VecDeque<StatusUpdate>,

    /// Whether the front has been sent to the current master.
    forwarded: bool,

    /// Every update id ever accepted into this stream.
    received: HashSet<UpdateId>,

    /// Every update id the master has acknowledged.
    acked: HashSet<UpdateId>,

    /// Set once a terminal update has been acknowledged; the stream is
    /// closed and further updates are dropped.
    terminated: bool,

    /// Retransmission attempt counter for the current head.
    attempt: u32,

    /// Durable log location; absent only for streams created without
    /// checkpointing (tests).
    updates_path: Option<PathBuf>,
}

impl UpdateStream {
    fn head(&self) -> Option<&StatusUpdate> {
        self.pending.front()
    }
}

pub struct StatusUpdateManager {
    streams: HashMap<(FrameworkId, TaskId), UpdateStream>,
    master: Option<Arc<dyn MasterEndpoint>>,
    acked_tx: mpsc::Sender<AckedUpdate>,
    backoff: BackoffPolicy,
    soft_cap: usize,
    strict: bool,
}

impl StatusUpdateManager {
    pub fn new(acked_tx: mpsc::Sender<AckedUpdate>, soft_cap: usize, strict: bool) -> Self {
        Self {
            streams: HashMap::new(),
            master: None,
            acked_tx,
            backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            soft_cap,
            strict,
        }
    }

    /// Checkpoint failures are logged; under strict they abort the process
    /// because continuing would let acknowledged state diverge from disk.
    fn guard_checkpoint(&self, result: Result<(), CheckpointError>) {
        if let Err(e) = result {
            error!(error = %e, "status update checkpoint failed");
            if self.strict {
                std::process::abort();
            }
        }
    }

    async fn handle_update(
        &mut self,
        update: StatusUpdate,
        updates_path: Option<PathBuf>,
        ctx: &ActorContext<UpdateManagerMessage>,
    ) {
        let key = (update.framework_id.clone(), update.task_id.clone());
        let path = {
            let stream = self.streams.entry(key.clone()).or_default();
            if stream.updates_path.is_none() {
                stream.updates_path = updates_path;
            }

            if stream.terminated {
                warn!(
                    task_id = %update.task_id,
                    state = %update.state,
                    "dropping update for terminated stream"
                );
                return;
            }

            if stream.received.contains(&update.update_id) {
                debug!(
                    task_id = %update.task_id,
                    update_id = %update.update_id,
                    "dropping duplicate update"
                );
                return;
            }

            stream.updates_path.clone()
        };

        if let Some(path) = path {
            let record = UpdateLogRecord::Update {
                update: update.clone(),
            };
            self.guard_checkpoint(append_update_record(&path, &record));
        }

        let stream = self.streams.get_mut(&key).unwrap();
        stream.received.insert(update.update_id);
        stream.pending.push_back(update);

        // Only the head may be in flight; a freshly queued update behind an
        // unacked predecessor waits its turn.
        if stream.pending.len() == 1 {
            self.forward(&key, ctx).await;
        }

        self.check_soft_cap(&key.0);
    }

    async fn handle_ack(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
        ctx: &ActorContext<UpdateManagerMessage>,
    ) {
        let key = (framework_id, task_id);
        let Some(stream) = self.streams.get_mut(&key) else {
            warn!(
                task_id = %key.1,
                update_id = %update_id,
                "acknowledgement for unknown stream"
            );
            return;
        };

        // A re-delivered ack is a no-op.
        if stream.acked.contains(&update_id) {
            debug!(
                task_id = %key.1,
                update_id = %update_id,
                "dropping duplicate acknowledgement"
            );
            return;
        }

        let Some(head) = stream.head() else {
            warn!(
                task_id = %key.1,
                update_id = %update_id,
                "acknowledgement with no update in flight"
            );
            return;
        };

        if head.update_id != update_id {
            warn!(
                task_id = %key.1,
                expected = %head.update_id,
                update_id = %update_id,
                "out-of-order acknowledgement dropped"
            );
            return;
        }

        if let Some(path) = stream.updates_path.clone() {
            self.guard_checkpoint(append_update_record(
                &path,
                &UpdateLogRecord::Ack { update_id },
            ));
        }

        let stream = self.streams.get_mut(&key).unwrap();
        let update = stream.pending.pop_front().expect("head checked above");
        stream.acked.insert(update_id);
        stream.forwarded = false;
        stream.attempt = 0;

        let terminal = update.state.is_terminal();
        if terminal {
            stream.terminated = true;
            info!(
                framework_id = %key.0,
                task_id = %key.1,
                state = %update.state,
                "task stream closed"
            );
            if !stream.pending.is_empty() {
                warn!(
                    task_id = %key.1,
                    dropped = stream.pending.len(),
                    "dropping updates queued behind a terminal update"
                );
                stream.pending.clear();
            }
        }

        let framework_open_streams = self
            .streams
            .iter()
            .filter(|((fid, _), s)| *fid == key.0 && !s.terminated)
            .count();

        let _ = self
            .acked_tx
            .send(AckedUpdate {
                update,
                terminal,
                framework_open_streams,
            })
            .await;

        if self.streams.get(&key).is_some_and(|s| !s.pending.is_empty()) {
            self.forward(&key, ctx).await;
        }
    }

    async fn handle_retry(
        &mut self,
        framework_id: FrameworkId,
        task_id: TaskId,
        update_id: UpdateId,
        ctx: &ActorContext<UpdateManagerMessage>,
    ) {
        let key = (framework_id, task_id);
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };

        // The timer may be stale: the head it was armed for is gone.
        let armed_for_head =
            stream.head().map(|u| u.update_id) == Some(update_id) && stream.forwarded;
        if !armed_for_head {
            return;
        }

        stream.attempt += 1;
        let update = stream.head().expect("checked above").clone();
        let attempt = stream.attempt;

        debug!(
            task_id = %key.1,
            update_id = %update.update_id,
            attempt,
            "retransmitting status update"
        );

        if let Some(master) = &self.master {
            if let Err(e) = master.status_update(&update).await {
                warn!(error = %e, "status update retransmit failed");
            }
        }

        ctx.notify_after(
            self.backoff.delay(attempt),
            UpdateManagerMessage::Retry {
                framework_id: key.0,
                task_id: key.1,
                update_id,
            },
        );
    }

    /// Sends the head of a stream to the master (when one is present) and
    /// arms the retransmit timer.
    async fn forward(
        &mut self,
        key: &(FrameworkId, TaskId),
        ctx: &ActorContext<UpdateManagerMessage>,
    ) {
        let Some(stream) = self.streams.get_mut(key) else {
            return;
        };
        let Some(head) = stream.head().cloned() else {
            return;
        };

        let Some(master) = &self.master else {
            // No master: leave the head unforwarded; the next
            // MasterChanged flushes it.
            stream.forwarded = false;
            return;
        };

        stream.forwarded = true;
        let attempt = stream.attempt;

        debug!(
            framework_id = %key.0,
            task_id = %key.1,
            state = %head.state,
            update_id = %head.update_id,
            "forwarding status update"
        );

        if let Err(e) = master.status_update(&head).await {
            warn!(error = %e, "status update forward failed; retry armed");
        }

        ctx.notify_after(
            self.backoff.delay(attempt),
            UpdateManagerMessage::Retry {
                framework_id: key.0.clone(),
                task_id: key.1.clone(),
                update_id: head.update_id,
            },
        );
    }

    fn check_soft_cap(&self, framework_id: &FrameworkId) {
        let pending: usize = self
            .streams
            .iter()
            .filter(|((fid, _), _)| fid == framework_id)
            .map(|(_, s)| s.pending.len())
            .sum();

        if pending > self.soft_cap {
            warn!(
                framework_id = %framework_id,
                pending,
                soft_cap = self.soft_cap,
                "framework has an unusual backlog of unacknowledged updates"
            );
        }
    }

    fn recover_streams(&mut self, streams: Vec<RecoveredStream>) {
        for recovered in streams {
            let key = (recovered.framework_id.clone(), recovered.task_id.clone());
            let stream = replay(recovered.records, recovered.updates_path);

            info!(
                framework_id = %key.0,
                task_id = %key.1,
                pending = stream.pending.len(),
                terminated = stream.terminated,
                "recovered update stream"
            );
            self.streams.insert(key, stream);
        }
    }
}

/// Reconstructs stream state from its checkpointed log. The log is a
/// prefix of what memory had, so replaying it in order is sufficient.
fn replay(records: Vec<UpdateLogRecord>, updates_path: PathBuf) -> UpdateStream {
    let mut stream = UpdateStream {
        updates_path: Some(updates_path),
        ..Default::default()
    };

    for record in records {
        match record {
            UpdateLogRecord::Update { update } => {
                if stream.received.insert(update.update_id) {
                    stream.pending.push_back(update);
                }
            }
            UpdateLogRecord::Ack { update_id } => {
                let head_id = stream.pending.front().map(|u| u.update_id);
                if head_id == Some(update_id) {
                    let update = stream.pending.pop_front().expect("head checked");
                    stream.acked.insert(update_id);
                    if update.state.is_terminal() {
                        stream.terminated = true;
                    }
                } else {
                    warn!(update_id = %update_id, "ack in log does not match stream head");
                }
            }
        }
    }

    stream
}

#[async_trait]
impl Actor for StatusUpdateManager {
    type Message = UpdateManagerMessage;

    fn name(&self) -> &str {
        "status_update_manager"
    }

    async fn handle(
        &mut self,
        msg: UpdateManagerMessage,
        ctx: &mut ActorContext<UpdateManagerMessage>,
    ) -> Result<Flow, ActorError> {
        match msg {
            UpdateManagerMessage::Recover { streams } => {
                self.recover_streams(streams);
            }

            UpdateManagerMessage::MasterChanged { master } => {
                let connected = master.is_some();
                self.master = master;
                info!(connected, "status update manager master link changed");

                if connected {
                    // Flush: re-forward the head of every open stream.
                    let keys: Vec<_> = self
                        .streams
                        .iter()
                        .filter(|(_, s)| !s.pending.is_empty())
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in keys {
                        self.forward(&key, ctx).await;
                    }
                }
            }

            UpdateManagerMessage::Update {
                update,
                updates_path,
            } => {
                self.handle_update(update, updates_path, ctx).await;
            }

            UpdateManagerMessage::Ack {
                framework_id,
                task_id,
                update_id,
            } => {
                self.handle_ack(framework_id, task_id, update_id, ctx).await;
            }

            UpdateManagerMessage::Retry {
                framework_id,
                task_id,
                update_id,
            } => {
                self.handle_retry(framework_id, task_id, update_id, ctx)
                    .await;
            }

            UpdateManagerMessage::CleanupFramework { framework_id } => {
                let before = self.streams.len();
                self.streams.retain(|(fid, _), _| *fid != framework_id);
                debug!(
                    framework_id = %framework_id,
                    removed = before - self.streams.len(),
                    "cleaned up framework streams"
                );
            }
        }

        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::core::spawn;
    use crate::client::{MasterCall, MockMasterEndpoint};
    use crate::registry::TaskState;
    use tokio::sync::watch;

    fn fid() -> FrameworkId {
        FrameworkId::parse("fw-1").unwrap()
    }

    fn eid() -> ExecutorId {
        ExecutorId::parse("exec-1").unwrap()
    }

    fn tid(name: &str) -> TaskId {
        TaskId::parse(name).unwrap()
    }

    fn update(task: &str, state: TaskState) -> StatusUpdate {
        StatusUpdate::new(fid(), eid(), tid(task), state)
    }

    struct Harness {
        handle: crate::actors::core::ActorHandle<UpdateManagerMessage>,
        master: std::sync::Arc<MockMasterEndpoint>,
        master_rx: mpsc::UnboundedReceiver<MasterCall>,
        acked_rx: mpsc::Receiver<AckedUpdate>,
        _shutdown: watch::Sender<bool>,
    }

    async fn harness() -> Harness {
        let (acked_tx, acked_rx) = mpsc::channel(64);
        let manager = StatusUpdateManager::new(acked_tx, 1000, false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _) = spawn(manager, 64, shutdown_rx);

        let (master, master_rx) = MockMasterEndpoint::new();
        handle
            .send(UpdateManagerMessage::MasterChanged {
                master: Some(master.clone()),
            })
            .await
            .unwrap();

        Harness {
            handle,
            master,
            master_rx,
            acked_rx,
            _shutdown: shutdown_tx,
        }
    }

    async fn next_forwarded(rx: &mut mpsc::UnboundedReceiver<MasterCall>) -> StatusUpdate {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(MasterCall::StatusUpdate(u)) = rx.recv().await {
                    return u;
                }
            }
        })
        .await
        .expect("no update forwarded")
    }

    #[tokio::test]
    async fn forwards_and_acks_in_order() {
        let mut h = harness().await;

        let running = update("t1", TaskState::Running);
        let finished = update("t1", TaskState::Finished);

        for u in [running.clone(), finished.clone()] {
            h.handle
                .send(UpdateManagerMessage::Update {
                    update: u,
                    updates_path: None,
                })
                .await
                .unwrap();
        }

        // Only the head goes out; the terminal update waits for the ack.
        let first = next_forwarded(&mut h.master_rx).await;
        assert_eq!(first.update_id, running.update_id);
        assert_eq!(h.master.status_updates().len(), 1);

        h.handle
            .send(UpdateManagerMessage::Ack {
                framework_id: fid(),
                task_id: tid("t1"),
                update_id: running.update_id,
            })
            .await
            .unwrap();

        let acked = h.acked_rx.recv().await.unwrap();
        assert!(!acked.terminal);
        assert_eq!(acked.update.update_id, running.update_id);

        let second = next_forwarded(&mut h.master_rx).await;
        assert_eq!(second.update_id, finished.update_id);

        h.handle
            .send(UpdateManagerMessage::Ack {
                framework_id: fid(),
                task_id: tid("t1"),
                update_id: finished.update_id,
            })
            .await
            .unwrap();

        let acked = h.acked_rx.recv().await.unwrap();
        assert!(acked.terminal);
    }

    #[tokio::test]
    async fn duplicate_update_is_dropped() {
        let mut h = harness().await;

        let running = update("t1", TaskState::Running);
        for _ in 0..2 {
            h.handle
                .send(UpdateManagerMessage::Update {
                    update: running.clone(),
                    updates_path: None,
                })
                .await
                .unwrap();
        }

        let _ = next_forwarded(&mut h.master_rx).await;
        h.handle
            .send(UpdateManagerMessage::Ack {
                framework_id: fid(),
                task_id: tid("t1"),
                update_id: running.update_id,
            })
            .await
            .unwrap();
        let _ = h.acked_rx.recv().await.unwrap();

        // Nothing further: the duplicate never entered the stream.
        let extra =
            tokio::time::timeout(Duration::from_millis(300), next_forwarded(&mut h.master_rx))
                .await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn duplicate_ack_is_idempotent() {
        let mut h = harness().await;

        let running = update("t1", TaskState::Running);
        h.handle
            .send(UpdateManagerMessage::Update {
                update: running.clone(),
                updates_path: None,
            })
            .await
            .unwrap();
        let _ = next_forwarded(&mut h.master_rx).await;

        for _ in 0..2 {
            h.handle
                .send(UpdateManagerMessage::Ack {
                    framework_id: fid(),
                    task_id: tid("t1"),
                    update_id: running.update_id,
                })
                .await
                .unwrap();
        }

        // Exactly one ack reaches the agent.
        let _ = h.acked_rx.recv().await.unwrap();
        let extra = tokio::time::timeout(Duration::from_millis(300), h.acked_rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn updates_after_terminal_ack_are_dropped() {
        let mut h = harness().await;

        let finished = update("t1", TaskState::Finished);
        h.handle
            .send(UpdateManagerMessage::Update {
                update: finished.clone(),
                updates_path: None,
            })
            .await
            .unwrap();
        let _ = next_forwarded(&mut h.master_rx).await;

        h.handle
            .send(UpdateManagerMessage::Ack {
                framework_id: fid(),
                task_id: tid("t1"),
                update_id: finished.update_id,
            })
            .await
            .unwrap();
        let _ = h.acked_rx.recv().await.unwrap();

        h.handle
            .send(UpdateManagerMessage::Update {
                update: update("t1", TaskState::Running),
                updates_path: None,
            })
            .await
            .unwrap();

        let extra =
            tokio::time::timeout(Duration::from_millis(300), next_forwarded(&mut h.master_rx))
                .await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn out_of_order_ack_is_dropped() {
        let mut h = harness().await;

        let running = update("t1", TaskState::Running);
        let finished = update("t1", TaskState::Finished);
        for u in [running.clone(), finished.clone()] {
            h.handle
                .send(UpdateManagerMessage::Update {
                    update: u,
                    updates_path: None,
                })
                .await
                .unwrap();
        }
        let _ = next_forwarded(&mut h.master_rx).await;

        // Ack the queued update instead of the head: refused.
        h.handle
            .send(UpdateManagerMessage::Ack {
                framework_id: fid(),
                task_id: tid("t1"),
                update_id: finished.update_id,
            })
            .await
            .unwrap();

        let none = tokio::time::timeout(Duration::from_millis(300), h.acked_rx.recv()).await;
        assert!(none.is_err());
    }

    #[tokio::test]
    async fn flushes_on_master_change() {
        let (acked_tx, _acked_rx) = mpsc::channel(64);
        let manager = StatusUpdateManager::new(acked_tx, 1000, false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _) = spawn(manager, 64, shutdown_rx);

        // No master yet: the update is queued, not forwarded.
        let running = update("t1", TaskState::Running);
        handle
            .send(UpdateManagerMessage::Update {
                update: running.clone(),
                updates_path: None,
            })
            .await
            .unwrap();

        let (master, mut master_rx) = MockMasterEndpoint::new();
        handle
            .send(UpdateManagerMessage::MasterChanged {
                master: Some(master.clone()),
            })
            .await
            .unwrap();

        let forwarded = next_forwarded(&mut master_rx).await;
        assert_eq!(forwarded.update_id, running.update_id);
    }

    #[tokio::test]
    async fn retransmits_until_acked() {
        let mut h = harness().await;

        let running = update("t1", TaskState::Running);
        h.handle
            .send(UpdateManagerMessage::Update {
                update: running.clone(),
                updates_path: None,
            })
            .await
            .unwrap();

        let first = next_forwarded(&mut h.master_rx).await;
        assert_eq!(first.update_id, running.update_id);

        // The retransmit timer (1s base) fires and resends the same update.
        let second = next_forwarded(&mut h.master_rx).await;
        assert_eq!(second.update_id, running.update_id);
    }

    #[test]
    fn replay_reconstructs_pending_and_terminated() {
        let running = update("t1", TaskState::Running);
        let finished = update("t1", TaskState::Finished);

        // Running was acked; finished is still in flight.
        let records = vec![
            UpdateLogRecord::Update {
                update: running.clone(),
            },
            UpdateLogRecord::Ack {
                update_id: running.update_id,
            },
            UpdateLogRecord::Update {
                update: finished.clone(),
            },
        ];

        let stream = replay(records, PathBuf::from("/tmp/updates"));
        assert!(!stream.terminated);
        assert_eq!(stream.pending.len(), 1);
        assert_eq!(stream.head().unwrap().update_id, finished.update_id);
        assert!(stream.acked.contains(&running.update_id));
    }

    #[test]
    fn replay_closed_stream() {
        let finished = update("t1", TaskState::Finished);
        let records = vec![
            UpdateLogRecord::Update {
                update: finished.clone(),
            },
            UpdateLogRecord::Ack {
                update_id: finished.update_id,
            },
        ];

        let stream = replay(records, PathBuf::from("/tmp/updates"));
        assert!(stream.terminated);
        assert!(stream.pending.is_empty());
    }
}
