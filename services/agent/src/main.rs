//! armada node agent.
//!
//! Recovers checkpointed state, connects to the configured master, and
//! runs until signalled. Wire transport for inbound master/executor
//! traffic is provided by the deployment (it feeds the agent mailbox);
//! this binary wires the HTTP master link and the lifecycle.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use armada_agent::actors::AgentMessage;
use armada_agent::client::{HttpMasterEndpoint, MasterReply};
use armada_agent::config::Config;
use armada_agent::isolator::PosixIsolator;
use armada_agent::spawn_agent;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting armada node agent");

    let config = Config::from_env()?;
    info!(
        work_dir = %config.work_dir.display(),
        master_url = %config.master_url,
        hostname = %config.hostname,
        recover = ?config.recover,
        strict = config.strict,
        "configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let isolator = Arc::new(PosixIsolator::new());
    let handles = spawn_agent(config.clone(), isolator, shutdown_rx);

    // Registration replies from the HTTP master link flow back into the
    // agent mailbox.
    let (reply_tx, mut reply_rx) = mpsc::channel::<MasterReply>(16);
    let master = Arc::new(HttpMasterEndpoint::new(config.master_url.clone(), reply_tx)?);

    let reply_agent = handles.agent.clone();
    tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let msg = match reply {
                MasterReply::Registered { agent_id } => AgentMessage::Registered { agent_id },
                MasterReply::Reregistered { agent_id } => {
                    AgentMessage::Reregistered { agent_id }
                }
            };
            if reply_agent.send(msg).await.is_err() {
                break;
            }
        }
    });

    handles
        .agent
        .send(AgentMessage::NewMasterDetected { master })
        .await
        .map_err(|e| anyhow::anyhow!("agent unavailable: {e}"))?;

    // Run until SIGTERM/SIGINT, then drain through a graceful shutdown.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("termination signal received"),
    }

    let _ = handles.agent.send(AgentMessage::Shutdown).await;
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    let _ = shutdown_tx.send(true);

    handles.task.await?;
    info!("agent stopped");
    Ok(())
}
