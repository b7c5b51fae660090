//! Process reaper: observes termination of arbitrary PIDs.
//!
//! Executors may be reparented away from the agent by a container runtime,
//! so the reaper cannot assume the processes it watches are children. For
//! direct children the non-blocking wait primitive yields a real exit
//! status; for everything else a zero-signal probe detects disappearance
//! and the status is reported as unknown. Exactly one notification fires
//! per monitored PID.

use std::collections::HashSet;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How often monitored PIDs are polled.
const REAP_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// How an observed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal exit with the given code (direct children only).
    Exited(i32),

    /// Killed by the given signal (direct children only).
    Signaled(i32),

    /// The process disappeared but its exit status is unobservable, e.g.
    /// it was reparented away from the agent.
    Unknown,
}

impl Termination {
    /// The exit code, when one was observed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Termination::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    pub pid: i32,
    pub termination: Termination,
}

#[derive(Debug)]
enum ReaperMessage {
    Monitor { pid: i32 },
    Subscribe { tx: mpsc::Sender<ProcessExit> },
}

/// Handle for registering interest with the reaper.
#[derive(Clone)]
pub struct ReaperHandle {
    tx: mpsc::Sender<ReaperMessage>,
}

impl ReaperHandle {
    /// Registers interest in a PID. Monitoring the same PID twice still
    /// yields a single notification.
    pub async fn monitor(&self, pid: i32) {
        let _ = self.tx.send(ReaperMessage::Monitor { pid }).await;
    }

    /// Subscribes to exit notifications for every monitored PID.
    pub async fn subscribe(&self) -> mpsc::Receiver<ProcessExit> {
        let (tx, rx) = mpsc::channel(64);
        let _ = self.tx.send(ReaperMessage::Subscribe { tx }).await;
        rx
    }
}

/// The reaper task. Spawn it once per agent.
pub struct Reaper {
    monitored: HashSet<i32>,
    listeners: Vec<mpsc::Sender<ProcessExit>>,
}

impl Reaper {
    /// Spawns the reaper loop and returns its handle.
    pub fn spawn() -> ReaperHandle {
        let (tx, rx) = mpsc::channel(64);
        let reaper = Reaper {
            monitored: HashSet::new(),
            listeners: Vec::new(),
        };
        tokio::spawn(reaper.run(rx));
        ReaperHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ReaperMessage>) {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(ReaperMessage::Monitor { pid }) => {
                            debug!(pid, "monitoring process");
                            self.monitored.insert(pid);
                        }
                        Some(ReaperMessage::Subscribe { tx }) => {
                            self.listeners.push(tx);
                        }
                        None => break,
                    }
                }
                _ = interval.tick() => {
                    self.poll().await;
                }
            }
        }
    }

    /// One polling pass over all monitored PIDs. Errors are logged and the
    /// PID is retried on the next tick; the reaper never fails.
    async fn poll(&mut self) {
        // Hold notifications until someone is listening: a PID observed
        // dead before the first subscriber would otherwise go unreported.
        self.listeners.retain(|tx| !tx.is_closed());
        if self.listeners.is_empty() {
            return;
        }

        let pids: Vec<i32> = self.monitored.iter().copied().collect();

        for pid in pids {
            if let Some(termination) = check_pid(pid) {
                debug!(pid, ?termination, "process exited");
                self.monitored.remove(&pid);

                let exit = ProcessExit { pid, termination };
                for listener in &self.listeners {
                    if listener.send(exit).await.is_err() {
                        warn!(pid, "exit notification dropped: listener gone");
                    }
                }
            }
        }
    }
}

/// Checks whether a PID is gone, returning its termination if so.
fn check_pid(pid: i32) -> Option<Termination> {
    // Children first: the non-blocking wait also reaps the zombie.
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => return Some(Termination::Exited(code)),
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            return Some(Termination::Signaled(signal as i32))
        }
        Ok(WaitStatus::StillAlive) => return None,
        Ok(_) => return None,
        Err(Errno::ECHILD) => {
            // Not our child; fall through to the liveness probe.
        }
        Err(e) => {
            warn!(pid, error = %e, "waitpid failed; will retry");
            return None;
        }
    }

    // Zero-signal probe for non-children. EPERM means the process exists
    // but belongs to someone else, so it is still alive.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => None,
        Err(Errno::ESRCH) => Some(Termination::Unknown),
        Err(Errno::EPERM) => None,
        Err(e) => {
            warn!(pid, error = %e, "liveness probe failed; will retry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};
    use std::time::Duration;

    use nix::sys::signal::Signal;

    async fn expect_exit(rx: &mut mpsc::Receiver<ProcessExit>, pid: i32) -> ProcessExit {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let exit = rx.recv().await.expect("reaper channel closed");
                if exit.pid == pid {
                    return exit;
                }
            }
        })
        .await
        .expect("timed out waiting for exit notification")
    }

    #[tokio::test]
    async fn reaps_direct_child_with_exit_code() {
        let reaper = Reaper::spawn();
        let mut rx = reaper.subscribe().await;

        let child = Command::new("sh")
            .arg("-c")
            .arg("exit 7")
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        // Do not wait on the child: the reaper owns reaping it.
        std::mem::forget(child);

        reaper.monitor(pid).await;
        let exit = expect_exit(&mut rx, pid).await;
        assert_eq!(exit.termination, Termination::Exited(7));
    }

    #[tokio::test]
    async fn reaps_non_child_process() {
        // The shell backgrounds a sleep and prints its pid, then exits; the
        // sleep is reparented to init and is no longer our child.
        let output = Command::new("sh")
            .arg("-c")
            .arg("sleep 300 >/dev/null 2>&1 & echo $!")
            .output()
            .unwrap();
        let pid: i32 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap();

        let reaper = Reaper::spawn();
        let mut rx = reaper.subscribe().await;
        reaper.monitor(pid).await;

        // Give the reaper a tick to observe the process alive first.
        tokio::time::sleep(Duration::from_millis(150)).await;

        kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();

        let exit = expect_exit(&mut rx, pid).await;
        assert_eq!(exit.termination, Termination::Unknown);
    }

    #[tokio::test]
    async fn duplicate_monitor_yields_one_notification() {
        let reaper = Reaper::spawn();
        let mut rx = reaper.subscribe().await;

        let child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        std::mem::forget(child);

        reaper.monitor(pid).await;
        reaper.monitor(pid).await;

        let _ = expect_exit(&mut rx, pid).await;

        // No second notification for the same pid.
        let second = tokio::time::timeout(Duration::from_millis(400), rx.recv()).await;
        assert!(second.is_err(), "unexpected duplicate notification");
    }

    #[tokio::test]
    async fn notifies_all_subscribers() {
        let reaper = Reaper::spawn();
        let mut rx1 = reaper.subscribe().await;
        let mut rx2 = reaper.subscribe().await;

        let child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        std::mem::forget(child);

        reaper.monitor(pid).await;

        let e1 = expect_exit(&mut rx1, pid).await;
        let e2 = expect_exit(&mut rx2, pid).await;
        assert_eq!(e1.pid, e2.pid);
    }
}
