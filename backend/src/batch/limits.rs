use std::path::Path;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};
use walkdir::WalkDir;

const MB: u64 = 1024 * 1024;

/// Source of the process memory figure checked before a batch is admitted.
pub trait MemoryProbe: Send + Sync + 'static {
    /// Resident set size in bytes, or `None` if it cannot be read.
    fn used_bytes(&self) -> Option<u64>;
}

/// RSS of the current process, read through `sysinfo`.
pub struct ProcessMemory {
    system: Mutex<System>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemory {
    fn used_bytes(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory())
    }
}

/// Constant reading, for tests and for disabling the check.
pub struct FixedMemory(pub u64);

impl MemoryProbe for FixedMemory {
    fn used_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}

/// `true` while RSS is below `threshold_mb`. An unreadable probe admits work.
///
/// Blocking: `ProcessMemory` refreshes sysinfo synchronously.
pub fn is_memory_ok(probe: &dyn MemoryProbe, threshold_mb: u64) -> bool {
    match probe.used_bytes() {
        Some(used) => used < threshold_mb.saturating_mul(MB),
        None => {
            tracing::warn!(target: "batch", "process memory unavailable; skipping memory check");
            true
        }
    }
}

/// [`is_memory_ok`] off the async workers.
pub async fn check_memory(probe: std::sync::Arc<dyn MemoryProbe>, threshold_mb: u64) -> bool {
    match tokio::task::spawn_blocking(move || is_memory_ok(probe.as_ref(), threshold_mb)).await {
        Ok(ok) => ok,
        Err(e) => {
            tracing::warn!(target: "batch", error = %e, "memory check task failed; skipping memory check");
            true
        }
    }
}

/// Disk usage of the upload dir, as reported by the storage health check.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StorageHealth {
    /// `None` when the directory could not be walked.
    pub size_bytes: Option<u64>,
    pub threshold_mb: u64,
    pub healthy: bool,
}

impl StorageHealth {
    pub fn unknown(threshold_mb: u64) -> Self {
        Self {
            size_bytes: None,
            threshold_mb,
            healthy: true,
        }
    }
}

/// Total size of the regular files under `dir`. A missing dir is empty.
pub fn dir_size_bytes(dir: &Path) -> walkdir::Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut total = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

pub fn dir_size_mb(dir: &Path) -> walkdir::Result<f64> {
    dir_size_bytes(dir).map(|b| b as f64 / MB as f64)
}

/// Compares the size of `dir` against `threshold_mb`. An unreadable dir is
/// reported healthy with a warning.
pub fn check_storage(dir: &Path, threshold_mb: u64) -> StorageHealth {
    match dir_size_bytes(dir) {
        Ok(size) => {
            let healthy = size < threshold_mb.saturating_mul(MB);
            if !healthy {
                tracing::warn!(
                    target: "batch",
                    size_bytes = size,
                    threshold_mb,
                    "too many module files; consider deleting unneeded ones"
                );
            }
            StorageHealth {
                size_bytes: Some(size),
                threshold_mb,
                healthy,
            }
        }
        Err(e) => {
            tracing::warn!(target: "batch", error = %e, dir = %dir.display(), "upload dir size unavailable");
            StorageHealth::unknown(threshold_mb)
        }
    }
}

/// `true` while the upload dir is below `threshold_mb`.
pub fn is_storage_ok(dir: &Path, threshold_mb: u64) -> bool {
    check_storage(dir, threshold_mb).healthy
}
