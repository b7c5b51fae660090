//! Sandbox garbage collection.
//!
//! Terminated executor sandboxes are scheduled for deletion after a
//! configured delay. A disk-usage control loop in the agent tightens the
//! permitted age as the disk fills, so under pressure old sandboxes go
//! earlier than their nominal deadline.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Permitted age never drops below this, so a directory scheduled a moment
/// ago is not deleted out from under a reader even on a full disk.
const AGE_FLOOR: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct GcEntry {
    path: PathBuf,
    scheduled_at: Instant,
    deadline: Instant,
}

/// Tracks directories pending deletion.
#[derive(Debug, Default)]
pub struct GarbageCollector {
    entries: Vec<GcEntry>,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a directory for deletion after `delay`. Rescheduling the
    /// same path replaces the earlier deadline.
    pub fn schedule(&mut self, path: PathBuf, delay: Duration) {
        let now = Instant::now();
        debug!(path = %path.display(), delay_secs = delay.as_secs(), "scheduled for gc");

        if let Some(entry) = self.entries.iter_mut().find(|e| e.path == path) {
            entry.scheduled_at = now;
            entry.deadline = now + delay;
        } else {
            self.entries.push(GcEntry {
                path,
                scheduled_at: now,
                deadline: now + delay,
            });
        }
    }

    /// Tightens deadlines so nothing scheduled longer than `max_age` ago
    /// remains. Called by the disk-usage control loop.
    pub fn prune(&mut self, max_age: Duration) {
        let now = Instant::now();
        for entry in &mut self.entries {
            if now.duration_since(entry.scheduled_at) >= max_age && entry.deadline > now {
                debug!(path = %entry.path.display(), "pruning gc deadline under disk pressure");
                entry.deadline = now;
            }
        }
    }

    /// Deletes everything whose deadline has passed. Returns the number of
    /// directories removed. Deletion failures are logged and retried on the
    /// next sweep.
    pub async fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        let mut keep = Vec::new();

        for entry in self.entries.drain(..) {
            if entry.deadline > now {
                keep.push(entry);
                continue;
            }

            match tokio::fs::remove_dir_all(&entry.path).await {
                Ok(()) => {
                    info!(path = %entry.path.display(), "deleted sandbox");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "gc deletion failed; will retry");
                    keep.push(entry);
                }
            }
        }

        self.entries = keep;
        removed
    }

    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

/// Permitted sandbox age for a given disk usage fraction: the full
/// `max_age` on an empty disk, decaying linearly to the floor as the disk
/// fills. Monotonically non-increasing in `usage`.
pub fn permitted_age(max_age: Duration, usage: f64) -> Duration {
    let headroom = (1.0 - usage).clamp(0.0, 1.0);
    max_age.mul_f64(headroom).max(AGE_FLOOR.min(max_age))
}

/// Fraction of the filesystem holding `path` that is in use.
pub fn disk_usage(path: &Path) -> std::io::Result<f64> {
    let vfs = nix::sys::statvfs::statvfs(path)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    let total = vfs.blocks() as f64;
    if total <= 0.0 {
        return Ok(0.0);
    }
    let available = vfs.blocks_available() as f64;
    Ok(1.0 - available / total)
}
