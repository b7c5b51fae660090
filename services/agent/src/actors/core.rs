//! Core actor types.
//!
//! Every component of the agent is a single-threaded actor: it owns its
//! state, processes one message at a time from a serialized mailbox, and
//! interacts with other actors only by message passing. A handler that
//! would wait for something (a timer, an isolator launch, a master ack)
//! schedules a message back to its own mailbox instead of blocking; the
//! re-entry handler must re-validate its preconditions because the world
//! may have moved on in between.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Whether the actor keeps processing after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Errors that terminate or degrade an actor.
#[derive(Debug, Error)]
pub enum ActorError {
    /// The failure is permanent; the actor stops.
    #[error("fatal actor error: {0}")]
    Fatal(String),

    /// The message could not be handled but the actor continues.
    #[error("transient actor error: {0}")]
    Transient(String),
}

/// The Actor trait defines behavior for an actor.
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handles a single message to completion.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext<Self::Message>,
    ) -> Result<Flow, ActorError>;

    /// Called once before the first message. A fatal error here stops the
    /// actor without processing any mail.
    async fn on_start(
        &mut self,
        _ctx: &mut ActorContext<Self::Message>,
    ) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext<Self::Message>) {}
}

/// Context handed to every handler invocation.
pub struct ActorContext<M: Message> {
    /// Sender for this actor's own mailbox.
    self_tx: mpsc::Sender<M>,

    /// Shutdown signal.
    pub shutdown: watch::Receiver<bool>,

    /// Messages handled so far.
    pub messages_processed: u64,
}

impl<M: Message> ActorContext<M> {
    /// A handle to this actor's own mailbox.
    pub fn self_handle(&self) -> ActorHandle<M> {
        ActorHandle {
            tx: self.self_tx.clone(),
        }
    }

    /// Schedules a message back to this actor after a delay. This is how
    /// timers and retries are expressed: the timer fires as an ordinary
    /// message, serialized with everything else.
    pub fn notify_after(&self, delay: Duration, msg: M) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg).await;
        });
    }

    /// Enqueues a message to self at the back of the mailbox.
    pub fn notify(&self, msg: M) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(msg).await;
        });
    }
}

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Sends a message, waiting for mailbox room.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::Fatal("actor stopped".to_string()))
    }

    /// Sends without waiting; fails if the mailbox is full or closed.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .try_send(msg)
            .map_err(|e| ActorError::Transient(e.to_string()))
    }

    /// The raw sender, for wiring into collaborators that deliver inbound
    /// traffic (transport adapters, subscription pumps).
    pub fn sender(&self) -> mpsc::Sender<M> {
        self.tx.clone()
    }
}

/// Spawns an actor with its own mailbox and returns a handle plus the task
/// driving it. The task finishes when the actor stops.
pub fn spawn<A: Actor>(
    mut actor: A,
    mailbox_size: usize,
    shutdown: watch::Receiver<bool>,
) -> (ActorHandle<A::Message>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(mailbox_size);
    let mut ctx = ActorContext {
        self_tx: tx.clone(),
        shutdown,
        messages_processed: 0,
    };

    let name = actor.name().to_string();
    let task = tokio::spawn(async move {
        if let Err(e) = actor.on_start(&mut ctx).await {
            error!(actor = %name, error = %e, "actor failed to start");
            return;
        }
        debug!(actor = %name, "actor started");

        let mut shutdown = ctx.shutdown.clone();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(actor = %name, "actor received shutdown signal");
                        break;
                    }
                }

                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    ctx.messages_processed += 1;

                    match actor.handle(msg, &mut ctx).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => {
                            info!(actor = %name, "actor requested stop");
                            break;
                        }
                        Err(ActorError::Transient(e)) => {
                            error!(actor = %name, error = %e, "handler error");
                        }
                        Err(ActorError::Fatal(e)) => {
                            error!(actor = %name, error = %e, "fatal handler error");
                            break;
                        }
                    }
                }
            }
        }

        actor.on_stop(&mut ctx).await;
        info!(
            actor = %name,
            messages_processed = ctx.messages_processed,
            "actor stopped"
        );
    });

    (ActorHandle { tx }, task)
}

/// Exponential backoff with a cap, used for registration retries and
/// status-update retransmission.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given attempt number, saturating at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let delay = self.base.saturating_mul(1u32 << shift);
        delay.min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        seen: Vec<String>,
        done: Option<tokio::sync::oneshot::Sender<Vec<String>>>,
    }

    #[async_trait]
    impl Actor for Echo {
        type Message = String;

        fn name(&self) -> &str {
            "echo"
        }

        async fn handle(
            &mut self,
            msg: String,
            _ctx: &mut ActorContext<String>,
        ) -> Result<Flow, ActorError> {
            if msg == "stop" {
                if let Some(done) = self.done.take() {
                    let _ = done.send(self.seen.clone());
                }
                return Ok(Flow::Stop);
            }
            self.seen.push(msg);
            Ok(Flow::Continue)
        }
    }

    #[tokio::test]
    async fn messages_are_processed_in_order() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let (_, shutdown_rx) = watch::channel(false);
        let (handle, task) = spawn(
            Echo {
                seen: Vec::new(),
                done: Some(done_tx),
            },
            16,
            shutdown_rx,
        );

        for msg in ["a", "b", "c", "stop"] {
            handle.send(msg.to_string()).await.unwrap();
        }

        let seen = done_rx.await.unwrap();
        assert_eq!(seen, vec!["a", "b", "c"]);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn notify_after_delivers_later() {
        struct Delayed {
            done: Option<tokio::sync::oneshot::Sender<()>>,
        }

        #[async_trait]
        impl Actor for Delayed {
            type Message = &'static str;

            fn name(&self) -> &str {
                "delayed"
            }

            async fn handle(
                &mut self,
                msg: &'static str,
                ctx: &mut ActorContext<&'static str>,
            ) -> Result<Flow, ActorError> {
                match msg {
                    "kick" => {
                        ctx.notify_after(Duration::from_millis(20), "fired");
                        Ok(Flow::Continue)
                    }
                    "fired" => {
                        if let Some(done) = self.done.take() {
                            let _ = done.send(());
                        }
                        Ok(Flow::Stop)
                    }
                    _ => Ok(Flow::Continue),
                }
            }
        }

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let (_, shutdown_rx) = watch::channel(false);
        let (handle, _task) = spawn(Delayed { done: Some(done_tx) }, 16, shutdown_rx);

        handle.send("kick").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), done_rx)
            .await
            .expect("timer message not delivered")
            .unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(8),
        };

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(8));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(8));
    }
}
