//! Agent configuration, loaded from `ARMADA_*` environment variables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

/// What to do with checkpointed executors found at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverMode {
    /// Wait for live executors to re-register; shut down the ones that
    /// do not within the reregister timeout.
    Reconnect,

    /// Shut down every recovered executor immediately.
    Cleanup,
}

impl std::str::FromStr for RecoverMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reconnect" => Ok(RecoverMode::Reconnect),
            "cleanup" => Ok(RecoverMode::Cleanup),
            other => bail!("unknown recover mode '{other}' (expected reconnect|cleanup)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of sandboxes and checkpoints.
    pub work_dir: PathBuf,

    /// Directory holding the `armada-executor` helper binary.
    pub launcher_dir: PathBuf,

    /// Base URL of the master.
    pub master_url: String,

    pub hostname: String,

    /// Key/value attributes advertised to the master.
    pub attributes: HashMap<String, String>,

    /// Grace period between the shutdown message and the forced destroy.
    pub executor_shutdown_grace_period: Duration,

    /// How long recovered executors get to re-register.
    pub executor_reregister_timeout: Duration,

    /// Nominal sandbox retention after executor termination.
    pub gc_delay: Duration,

    /// Cadence of the disk-usage control loop.
    pub disk_watch_interval: Duration,

    pub recover: RecoverMode,

    /// Whether recovery errors abort the process.
    pub strict: bool,

    pub max_completed_frameworks: usize,
    pub max_completed_executors_per_framework: usize,
    pub max_completed_tasks_per_executor: usize,

    /// Pending (unacknowledged) status updates per framework above which a
    /// warning is logged. There is no hard cap: pre-terminal updates are
    /// never dropped.
    pub framework_pending_updates_soft_cap: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let work_dir = PathBuf::from(
            std::env::var("ARMADA_WORK_DIR").unwrap_or_else(|_| "/var/lib/armada".to_string()),
        );
        let launcher_dir = PathBuf::from(
            std::env::var("ARMADA_LAUNCHER_DIR")
                .unwrap_or_else(|_| "/usr/libexec/armada".to_string()),
        );

        let master_url = std::env::var("ARMADA_MASTER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:5050".to_string());

        let hostname = match std::env::var("ARMADA_HOSTNAME") {
            Ok(hostname) => hostname,
            Err(_) => nix::unistd::gethostname()?
                .to_string_lossy()
                .into_owned(),
        };

        let attributes = std::env::var("ARMADA_ATTRIBUTES")
            .map(|s| parse_attributes(&s))
            .unwrap_or_default();

        let recover = std::env::var("ARMADA_RECOVER")
            .unwrap_or_else(|_| "reconnect".to_string())
            .parse()?;

        let strict = std::env::var("ARMADA_STRICT")
            .map(|s| s == "1" || s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            work_dir,
            launcher_dir,
            master_url,
            hostname,
            attributes,
            executor_shutdown_grace_period: env_duration_secs(
                "ARMADA_EXECUTOR_SHUTDOWN_GRACE_SECS",
                5,
            ),
            executor_reregister_timeout: env_duration_secs(
                "ARMADA_EXECUTOR_REREGISTER_TIMEOUT_SECS",
                10,
            ),
            gc_delay: env_duration_secs("ARMADA_GC_DELAY_SECS", 7 * 24 * 3600),
            disk_watch_interval: env_duration_secs("ARMADA_DISK_WATCH_INTERVAL_SECS", 60),
            recover,
            strict,
            max_completed_frameworks: env_usize("ARMADA_MAX_COMPLETED_FRAMEWORKS", 50),
            max_completed_executors_per_framework: env_usize(
                "ARMADA_MAX_COMPLETED_EXECUTORS_PER_FRAMEWORK",
                150,
            ),
            max_completed_tasks_per_executor: env_usize(
                "ARMADA_MAX_COMPLETED_TASKS_PER_EXECUTOR",
                1000,
            ),
            framework_pending_updates_soft_cap: env_usize(
                "ARMADA_FRAMEWORK_PENDING_UPDATES_SOFT_CAP",
                10_000,
            ),
        })
    }
}

fn env_duration_secs(var: &str, default: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn env_usize(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parses `key:value;key:value` attribute strings.
fn parse_attributes(s: &str) -> HashMap<String, String> {
    s.split(';')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            pair.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
