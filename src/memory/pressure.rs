// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Memory pressure levels.
//!
//! Three-tier cascade relative to the configured thresholds:
//! - **Normal** (< soft): fetch at full speed, batch size may grow back
//! - **Elevated** (soft - critical): shrink batches, hint the allocator to reclaim
//! - **Critical** (>= critical): stop fetching, `check_threshold` fails
//!
//! # Example
//!
//! ```
//! use crm_sync::memory::MemoryPressure;
//!
//! assert_eq!(MemoryPressure::from_usage(0.50, 0.80, 0.95), MemoryPressure::Normal);
//! assert_eq!(MemoryPressure::from_usage(0.85, 0.80, 0.95), MemoryPressure::Elevated);
//! assert!(!MemoryPressure::from_usage(0.96, 0.80, 0.95).allows_fetch());
//! ```

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Normal = 0,
    Elevated = 1,
    Critical = 2,
}

impl MemoryPressure {
    /// Level for a usage ratio (0.0 → 1.0) against soft and critical thresholds.
    #[must_use]
    pub fn from_usage(usage: f64, soft: f64, critical: f64) -> Self {
        match usage {
            u if u >= critical => Self::Critical,
            u if u >= soft => Self::Elevated,
            _ => Self::Normal,
        }
    }

    /// Whether another page may be fetched at this level
    #[must_use]
    pub fn allows_fetch(&self) -> bool {
        !matches!(self, Self::Critical)
    }

    /// Whether batch sizes should shrink at this level
    #[must_use]
    pub fn should_shrink(&self) -> bool {
        !matches!(self, Self::Normal)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Elevated => "Elevated - shrinking batches",
            Self::Critical => "Critical - fetching stopped",
        }
    }
}

impl std::fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
