// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory probes.
//!
//! [`ProcessMemoryProbe`] reads resident set size from `/proc/self/status`
//! and the limit from the cgroup (v2, then v1), falling back to total system
//! memory. On platforms without procfs it reports nothing and the manager
//! treats usage as unknown (0%).

use std::sync::atomic::{AtomicU64, Ordering};

/// One probe reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub used_bytes: u64,
    /// Limit known to the probe itself (cgroup or physical memory)
    pub limit_bytes: Option<u64>,
}

pub trait MemoryProbe: Send + Sync {
    fn read(&self) -> Option<MemoryReading>;
}

const CGROUP_V2_LIMIT: &str = "/sys/fs/cgroup/memory.max";
const CGROUP_V1_LIMIT: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";

/// Cgroup v1 reports "unlimited" as a huge page-aligned number.
const CGROUP_V1_UNLIMITED: u64 = 1 << 62;

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

impl ProcessMemoryProbe {
    fn limit() -> Option<u64> {
        [CGROUP_V2_LIMIT, CGROUP_V1_LIMIT]
            .iter()
            .find_map(|path| std::fs::read_to_string(path).ok().and_then(|s| parse_cgroup_limit(&s)))
            .or_else(|| {
                std::fs::read_to_string("/proc/meminfo")
                    .ok()
                    .and_then(|s| parse_kb_field(&s, "MemTotal"))
            })
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn read(&self) -> Option<MemoryReading> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let used_bytes = parse_kb_field(&status, "VmRSS")?;
        Some(MemoryReading {
            used_bytes,
            limit_bytes: Self::limit(),
        })
    }
}

/// Parse a `Name:   1234 kB` line into bytes.
#[must_use]
pub fn parse_kb_field(text: &str, field: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse::<u64>().ok())
        .map(|kb| kb.saturating_mul(1024))
}

/// Parse a cgroup limit file. `max` and the v1 sentinel mean no limit.
#[must_use]
pub fn parse_cgroup_limit(text: &str) -> Option<u64> {
    let value = text.trim();
    if value == "max" {
        return None;
    }
    value.parse::<u64>().ok().filter(|&n| n > 0 && n < CGROUP_V1_UNLIMITED)
}

/// Probe with externally controlled values.
#[derive(Debug)]
pub struct FixedMemoryProbe {
    used: AtomicU64,
    limit: AtomicU64,
}

impl FixedMemoryProbe {
    #[must_use]
    pub fn new(used_bytes: u64, limit_bytes: u64) -> Self {
        Self {
            used: AtomicU64::new(used_bytes),
            limit: AtomicU64::new(limit_bytes),
        }
    }

    /// Probe reporting `percent` of a 1 GiB limit.
    #[must_use]
    pub fn at_percent(percent: f64) -> Self {
        let probe = Self::new(0, 1 << 30);
        probe.set_percent(percent);
        probe
    }

    pub fn set_used(&self, used_bytes: u64) {
        self.used.store(used_bytes, Ordering::Relaxed);
    }

    pub fn set_percent(&self, percent: f64) {
        let limit = self.limit.load(Ordering::Relaxed) as f64;
        self.set_used((limit * percent.clamp(0.0, 100.0) / 100.0) as u64);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn read(&self) -> Option<MemoryReading> {
        let limit = self.limit.load(Ordering::Relaxed);
        Some(MemoryReading {
            used_bytes: self.used.load(Ordering::Relaxed),
            limit_bytes: (limit > 0).then_some(limit),
        })
    }
}
