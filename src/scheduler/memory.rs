//! Memory and CPU headroom detection for sizing worker pools.
//!
//! # Platform Support
//!
//! - **Linux**: `MemAvailable` from `/proc/meminfo`
//! - **Other platforms**: memory is unknown and pools use the configured ceiling

use tracing::debug;

/// Concurrent I/O-bound attempts allowed per logical CPU.
const IO_TASKS_PER_CPU: usize = 8;

/// Source of live headroom figures.
pub trait HeadroomProbe: Send + Sync {
    /// Available memory in bytes, when known.
    fn available_memory(&self) -> Option<u64>;

    /// Logical CPU count.
    fn cpu_count(&self) -> usize;
}

/// Reads headroom from the running system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl HeadroomProbe for SystemProbe {
    fn available_memory(&self) -> Option<u64> {
        detect_available_memory()
    }

    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4)
    }
}

/// Fixed figures, for tests and for pinning pool sizes.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe {
    pub available_memory: Option<u64>,
    pub cpus: usize,
}

impl HeadroomProbe for FixedProbe {
    fn available_memory(&self) -> Option<u64> {
        self.available_memory
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }
}

/// Configured upper bounds for the three pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub max_workers: usize,
    pub per_task_memory: u64,
    pub long_transfer_slots: usize,
    pub interactive_slots: usize,
}

/// Computed pool capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub general: usize,
    pub long_transfer: usize,
    pub interactive: usize,
}

impl PoolLimits {
    /// Sizes the pools against current headroom.
    ///
    /// `general = min(max_workers, available / per_task, cpus * 8)`, never
    /// below one. The long-transfer and interactive pools are capped by the
    /// general size.
    #[must_use]
    pub fn size_for(&self, probe: &dyn HeadroomProbe) -> PoolSizes {
        let memory_bound = match probe.available_memory() {
            Some(available) if self.per_task_memory > 0 => {
                usize::try_from(available / self.per_task_memory).unwrap_or(usize::MAX)
            }
            _ => usize::MAX,
        };
        let cpu_bound = probe.cpu_count().max(1).saturating_mul(IO_TASKS_PER_CPU);

        let general = self.max_workers.min(memory_bound).min(cpu_bound).max(1);
        let sizes = PoolSizes {
            general,
            long_transfer: self.long_transfer_slots.min(general).max(1),
            interactive: self.interactive_slots.min(general).max(1),
        };
        debug!(
            max_workers = self.max_workers,
            memory_bound, cpu_bound, ?sizes, "computed pool sizes"
        );
        sizes
    }
}

#[cfg(target_os = "linux")]
fn detect_available_memory() -> Option<u64> {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|content| parse_mem_available(&content))
}

#[cfg(not(target_os = "linux"))]
fn detect_available_memory() -> Option<u64> {
    None
}

/// Extracts `MemAvailable` (bytes) from `/proc/meminfo` content.
#[must_use]
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
