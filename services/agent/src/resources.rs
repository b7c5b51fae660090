//! Resource vectors for tasks and executors.
//!
//! The agent only needs a small, additive resource model: what a task
//! declares, what an executor reserves, and what this node advertises.
//! Scheduling arithmetic beyond add/subtract/contains lives in the master.

use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A declared resource footprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU cores (fractional).
    pub cpus: f64,

    /// Memory in bytes.
    pub mem_bytes: i64,

    /// Scratch disk in bytes.
    pub disk_bytes: i64,
}

impl Resources {
    pub const fn new(cpus: f64, mem_bytes: i64, disk_bytes: i64) -> Self {
        Self {
            cpus,
            mem_bytes,
            disk_bytes,
        }
    }

    /// True if `other` fits inside this vector.
    pub fn contains(&self, other: &Resources) -> bool {
        self.cpus >= other.cpus
            && self.mem_bytes >= other.mem_bytes
            && self.disk_bytes >= other.disk_bytes
    }

    /// Measures what this node can advertise, used when the operator does
    /// not configure resources explicitly.
    pub fn measure(work_dir: &Path) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get() as f64)
            .unwrap_or(1.0);

        let mem_bytes = total_memory_bytes();

        let disk_bytes = nix::sys::statvfs::statvfs(work_dir)
            .map(|vfs| (vfs.blocks() as i64) * (vfs.fragment_size() as i64))
            .unwrap_or(0);

        Self {
            cpus,
            mem_bytes,
            disk_bytes,
        }
    }
}

fn total_memory_bytes() -> i64 {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

    if page_size > 0 && total_pages > 0 {
        page_size as i64 * total_pages as i64
    } else {
        8 * 1024 * 1024 * 1024
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpus: self.cpus + rhs.cpus,
            mem_bytes: self.mem_bytes + rhs.mem_bytes,
            disk_bytes: self.disk_bytes + rhs.disk_bytes,
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        *self = *self + rhs;
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(self, rhs: Resources) -> Resources {
        Resources {
            cpus: self.cpus - rhs.cpus,
            mem_bytes: self.mem_bytes - rhs.mem_bytes,
            disk_bytes: self.disk_bytes - rhs.disk_bytes,
        }
    }
}

impl SubAssign for Resources {
    fn sub_assign(&mut self, rhs: Resources) {
        *self = *self - rhs;
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cpus={}; mem={}MB; disk={}MB",
            self.cpus,
            self.mem_bytes / (1024 * 1024),
            self.disk_bytes / (1024 * 1024)
        )
    }
}

/// A point-in-time usage sample for a running executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatistics {
    pub timestamp: DateTime<Utc>,

    /// Applied CPU limit.
    pub cpus_limit: f64,

    /// Applied memory limit in bytes.
    pub mem_limit_bytes: i64,

    /// Resident set size in bytes, when the platform exposes it.
    pub mem_rss_bytes: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_subtract() {
        let a = Resources::new(2.0, 1024, 4096);
        let b = Resources::new(0.5, 512, 0);

        let sum = a + b;
        assert_eq!(sum.cpus, 2.5);
        assert_eq!(sum.mem_bytes, 1536);

        let diff = sum - b;
        assert_eq!(diff.cpus, 2.0);
        assert_eq!(diff.mem_bytes, 1024);
        assert_eq!(diff.disk_bytes, 4096);
    }

    #[test]
    fn accumulate_task_resources() {
        let mut executor = Resources::new(0.1, 32 * 1024 * 1024, 0);
        let task = Resources::new(1.0, 128 * 1024 * 1024, 0);

        executor += task;
        executor += task;
        assert_eq!(executor.cpus, 2.1);

        executor -= task;
        assert_eq!(executor.cpus, 1.1);
    }

    #[test]
    fn contains() {
        let node = Resources::new(8.0, 16 << 30, 100 << 30);
        let task = Resources::new(1.0, 1 << 30, 0);
        assert!(node.contains(&task));
        assert!(!task.contains(&node));
    }

    #[test]
    fn measure_reports_something() {
        let dir = std::env::temp_dir();
        let measured = Resources::measure(&dir);
        assert!(measured.cpus >= 1.0);
        assert!(measured.mem_bytes > 0);
    }
}
