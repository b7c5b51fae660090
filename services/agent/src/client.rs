//! Endpoints the agent talks to: the master and its executor processes.
//!
//! Wire framing is a transport concern; the agent core only sees these
//! traits. An HTTP implementation is provided for the master link; tests
//! substitute channel-backed mocks. Inbound traffic (RunTask, acks,
//! executor registration) is delivered by the transport adapter directly
//! into the agent actor's mailbox.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use armada_id::{AgentId, ContainerId, ExecutorId, FrameworkId, TaskId, UpdateId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::registry::{AgentInfo, StatusUpdate, Task, TaskInfo};

/// Inventory of live executors and tasks, sent on re-registration so the
/// master can reconcile its view of this node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInventory {
    pub executors: Vec<ExecutorSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSummary {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,
    pub container_id: ContainerId,
    pub tasks: Vec<Task>,
}

/// Replies the master transport produces for registration attempts.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationReply {
    pub agent_id: AgentId,
}

// =============================================================================
// Master endpoint
// =============================================================================

/// Outbound messages to the master. Fire-and-forget from the agent's view;
/// replies arrive as agent mailbox messages.
#[async_trait]
pub trait MasterEndpoint: Send + Sync {
    async fn register(&self, info: &AgentInfo) -> Result<()>;

    async fn reregister(
        &self,
        agent_id: &AgentId,
        info: &AgentInfo,
        inventory: &AgentInventory,
    ) -> Result<()>;

    async fn unregister(&self, agent_id: &AgentId) -> Result<()>;

    async fn status_update(&self, update: &StatusUpdate) -> Result<()>;

    async fn framework_message(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        data: &str,
    ) -> Result<()>;

    async fn pong(&self, agent_id: &AgentId) -> Result<()>;
}

// =============================================================================
// Executor endpoint
// =============================================================================

/// Outbound messages to one registered executor process.
#[async_trait]
pub trait ExecutorEndpoint: Send + Sync {
    async fn run_task(&self, task: &TaskInfo) -> Result<()>;

    async fn kill_task(&self, task_id: &TaskId) -> Result<()>;

    async fn status_update_ack(&self, task_id: &TaskId, update_id: &UpdateId) -> Result<()>;

    async fn framework_message(&self, data: &str) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

// =============================================================================
// HTTP master endpoint
// =============================================================================

/// Registration replies parsed out of HTTP responses, forwarded to whoever
/// owns the agent mailbox.
#[derive(Debug)]
pub enum MasterReply {
    Registered { agent_id: AgentId },
    Reregistered { agent_id: AgentId },
}

/// JSON-over-HTTP master link.
pub struct HttpMasterEndpoint {
    client: reqwest::Client,
    base_url: String,
    replies: mpsc::Sender<MasterReply>,
}

impl HttpMasterEndpoint {
    pub fn new(base_url: String, replies: mpsc::Sender<MasterReply>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url,
            replies,
        })
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "posting to master");

        let response = self.client.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("master returned {} for {}", response.status(), path);
        }
        Ok(response)
    }
}

#[async_trait]
impl MasterEndpoint for HttpMasterEndpoint {
    async fn register(&self, info: &AgentInfo) -> Result<()> {
        let response = self.post("/master/agents/register", info).await?;
        let reply: RegistrationReply = response.json().await?;
        let _ = self
            .replies
            .send(MasterReply::Registered {
                agent_id: reply.agent_id,
            })
            .await;
        Ok(())
    }

    async fn reregister(
        &self,
        agent_id: &AgentId,
        info: &AgentInfo,
        inventory: &AgentInventory,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            agent_id: &'a AgentId,
            info: &'a AgentInfo,
            inventory: &'a AgentInventory,
        }

        let response = self
            .post(
                "/master/agents/reregister",
                &Body {
                    agent_id,
                    info,
                    inventory,
                },
            )
            .await?;
        let reply: RegistrationReply = response.json().await?;
        let _ = self
            .replies
            .send(MasterReply::Reregistered {
                agent_id: reply.agent_id,
            })
            .await;
        Ok(())
    }

    async fn unregister(&self, agent_id: &AgentId) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            agent_id: &'a AgentId,
        }

        self.post("/master/agents/unregister", &Body { agent_id })
            .await?;
        Ok(())
    }

    async fn status_update(&self, update: &StatusUpdate) -> Result<()> {
        self.post("/master/status-updates", update).await?;
        Ok(())
    }

    async fn framework_message(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        data: &str,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            framework_id: &'a FrameworkId,
            executor_id: &'a ExecutorId,
            data: &'a str,
        }

        self.post(
            "/master/framework-messages",
            &Body {
                framework_id,
                executor_id,
                data,
            },
        )
        .await?;
        Ok(())
    }

    async fn pong(&self, agent_id: &AgentId) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            agent_id: &'a AgentId,
        }

        self.post("/master/pong", &Body { agent_id }).await?;
        Ok(())
    }
}

// =============================================================================
// Mocks
// =============================================================================

/// Everything a mock master observed.
#[derive(Debug, Clone)]
pub enum MasterCall {
    Register {
        info: AgentInfo,
    },
    Reregister {
        agent_id: AgentId,
        inventory: AgentInventory,
    },
    Unregister {
        agent_id: AgentId,
    },
    StatusUpdate(StatusUpdate),
    FrameworkMessage {
        framework_id: FrameworkId,
        executor_id: ExecutorId,
        data: String,
    },
    Pong,
}

/// Channel-backed master for tests: records every call and streams them to
/// the receiver returned by `new`.
pub struct MockMasterEndpoint {
    calls: Mutex<Vec<MasterCall>>,
    events: mpsc::UnboundedSender<MasterCall>,
}

impl MockMasterEndpoint {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<MasterCall>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                events,
            }),
            rx,
        )
    }

    pub fn calls(&self) -> Vec<MasterCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Status updates observed so far, in arrival order.
    pub fn status_updates(&self) -> Vec<StatusUpdate> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MasterCall::StatusUpdate(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MasterCall) {
        self.calls.lock().unwrap().push(call.clone());
        let _ = self.events.send(call);
    }
}

#[async_trait]
impl MasterEndpoint for MockMasterEndpoint {
    async fn register(&self, info: &AgentInfo) -> Result<()> {
        self.record(MasterCall::Register { info: info.clone() });
        Ok(())
    }

    async fn reregister(
        &self,
        agent_id: &AgentId,
        _info: &AgentInfo,
        inventory: &AgentInventory,
    ) -> Result<()> {
        self.record(MasterCall::Reregister {
            agent_id: agent_id.clone(),
            inventory: inventory.clone(),
        });
        Ok(())
    }

    async fn unregister(&self, agent_id: &AgentId) -> Result<()> {
        self.record(MasterCall::Unregister {
            agent_id: agent_id.clone(),
        });
        Ok(())
    }

    async fn status_update(&self, update: &StatusUpdate) -> Result<()> {
        self.record(MasterCall::StatusUpdate(update.clone()));
        Ok(())
    }

    async fn framework_message(
        &self,
        framework_id: &FrameworkId,
        executor_id: &ExecutorId,
        data: &str,
    ) -> Result<()> {
        self.record(MasterCall::FrameworkMessage {
            framework_id: framework_id.clone(),
            executor_id: executor_id.clone(),
            data: data.to_string(),
        });
        Ok(())
    }

    async fn pong(&self, _agent_id: &AgentId) -> Result<()> {
        self.record(MasterCall::Pong);
        Ok(())
    }
}

/// Everything a mock executor observed.
#[derive(Debug, Clone)]
pub enum ExecutorCall {
    RunTask(TaskInfo),
    KillTask(TaskId),
    StatusUpdateAck { task_id: TaskId, update_id: UpdateId },
    FrameworkMessage(String),
    Shutdown,
}

/// Channel-backed executor endpoint for tests.
pub struct MockExecutorEndpoint {
    calls: Mutex<Vec<ExecutorCall>>,
    events: mpsc::UnboundedSender<ExecutorCall>,
}

impl MockExecutorEndpoint {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<ExecutorCall>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            std::sync::Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                events,
            }),
            rx,
        )
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: ExecutorCall) {
        self.calls.lock().unwrap().push(call.clone());
        let _ = self.events.send(call);
    }
}

#[async_trait]
impl ExecutorEndpoint for MockExecutorEndpoint {
    async fn run_task(&self, task: &TaskInfo) -> Result<()> {
        self.record(ExecutorCall::RunTask(task.clone()));
        Ok(())
    }

    async fn kill_task(&self, task_id: &TaskId) -> Result<()> {
        self.record(ExecutorCall::KillTask(task_id.clone()));
        Ok(())
    }

    async fn status_update_ack(&self, task_id: &TaskId, update_id: &UpdateId) -> Result<()> {
        self.record(ExecutorCall::StatusUpdateAck {
            task_id: task_id.clone(),
            update_id: *update_id,
        });
        Ok(())
    }

    async fn framework_message(&self, data: &str) -> Result<()> {
        self.record(ExecutorCall::FrameworkMessage(data.to_string()));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.record(ExecutorCall::Shutdown);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskState;
    use crate::resources::Resources;

    #[tokio::test]
    async fn mock_master_streams_calls() {
        let (master, mut rx) = MockMasterEndpoint::new();

        let update = StatusUpdate::new(
            FrameworkId::parse("fw-1").unwrap(),
            ExecutorId::parse("exec-1").unwrap(),
            TaskId::parse("t1").unwrap(),
            TaskState::Running,
        );
        master.status_update(&update).await.unwrap();

        let call = rx.recv().await.unwrap();
        assert!(matches!(call, MasterCall::StatusUpdate(u) if u.update_id == update.update_id));
        assert_eq!(master.status_updates().len(), 1);
    }

    #[tokio::test]
    async fn mock_executor_records_acks() {
        let (executor, mut rx) = MockExecutorEndpoint::new();
        let task_id = TaskId::parse("t1").unwrap();
        let update_id = UpdateId::new();

        executor.status_update_ack(&task_id, &update_id).await.unwrap();

        let call = rx.recv().await.unwrap();
        assert!(matches!(
            call,
            ExecutorCall::StatusUpdateAck { update_id: id, .. } if id == update_id
        ));
    }

    #[test]
    fn inventory_serde_roundtrip() {
        let inventory = AgentInventory {
            executors: vec![ExecutorSummary {
                framework_id: FrameworkId::parse("fw-1").unwrap(),
                executor_id: ExecutorId::parse("exec-1").unwrap(),
                container_id: ContainerId::new(),
                tasks: vec![Task {
                    task_id: TaskId::parse("t1").unwrap(),
                    framework_id: FrameworkId::parse("fw-1").unwrap(),
                    executor_id: ExecutorId::parse("exec-1").unwrap(),
                    name: "t1".to_string(),
                    resources: Resources::new(1.0, 1 << 30, 0),
                    state: TaskState::Running,
                }],
            }],
        };

        let json = serde_json::to_string(&inventory).unwrap();
        let back: AgentInventory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.executors.len(), 1);
        assert_eq!(back.executors[0].tasks[0].name, "t1");
    }
}
