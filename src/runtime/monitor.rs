//! Memory pressure sources for batch scaling.

use anyhow::{bail, Context, Result};
use std::fs;

const PROC_STATUS: &str = "/proc/self/status";
const PROC_MEMINFO: &str = "/proc/meminfo";
const CGROUP_MEMORY_MAX: &str = "/sys/fs/cgroup/memory.max";

/// Reports how close the process is to its memory budget.
pub trait ResourceMonitor: Send + Sync {
    /// Used over limit, clamped to `[0, 1]`.
    fn pressure_ratio(&self) -> Result<f64>;
}

/// Resident set size of this process against a configured limit, the cgroup v2 memory
/// limit, or total system memory, in that order.
#[derive(Debug, Clone, Default)]
pub struct ProcessMemoryMonitor {
    limit_bytes: Option<u64>,
}

impl ProcessMemoryMonitor {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        Self { limit_bytes }
    }

    fn resident_bytes(&self) -> Result<u64> {
        let status = fs::read_to_string(PROC_STATUS).context("failed to read process status")?;
        parse_kib_field(&status, "VmRSS")
            .map(|kib| kib.saturating_mul(1024))
            .context("VmRSS missing from process status")
    }

    fn limit(&self) -> Result<u64> {
        if let Some(limit) = self.limit_bytes {
            return Ok(limit);
        }
        if let Ok(raw) = fs::read_to_string(CGROUP_MEMORY_MAX) {
            if let Some(limit) = parse_cgroup_limit(&raw) {
                return Ok(limit);
            }
        }
        let meminfo = fs::read_to_string(PROC_MEMINFO).context("failed to read meminfo")?;
        parse_kib_field(&meminfo, "MemTotal")
            .map(|kib| kib.saturating_mul(1024))
            .context("MemTotal missing from meminfo")
    }
}

impl ResourceMonitor for ProcessMemoryMonitor {
    fn pressure_ratio(&self) -> Result<f64> {
        let limit = self.limit()?;
        if limit == 0 {
            bail!("memory limit resolved to zero");
        }
        let used = self.resident_bytes()?;
        Ok((used as f64 / limit as f64).clamp(0.0, 1.0))
    }
}

/// Reads a `Name:   1234 kB` line.
fn parse_kib_field(contents: &str, field: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// `max` means unlimited.
fn parse_cgroup_limit(raw: &str) -> Option<u64> {
    raw.trim().parse().ok()
}
