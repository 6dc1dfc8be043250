// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the sync engine.
//!
//! # Example
//!
//! ```
//! use crm_sync::SyncEngineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncEngineConfig::default();
//! assert_eq!(config.daily_token_budget, 10_000);
//!
//! // Tuned config
//! let config = SyncEngineConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     daily_token_budget: 80_000,
//!     max_batch_size: 200,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SyncError;
use crate::merge::MigrationStrategy;

/// Configuration for the sync engine.
///
/// All fields have sensible defaults. Configure `redis_url` when several
/// processes share one token budget and circuit state.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEngineConfig {
    /// Redis connection string for shared counters (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every shared counter key (`<prefix>:<category>:<suffix>`)
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Token budget
    #[serde(default = "default_daily_token_budget")]
    pub daily_token_budget: u64,
    #[serde(default = "default_endpoint_costs")]
    pub endpoint_costs: HashMap<String, u64>,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Circuit breaker
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_window_secs")]
    pub circuit_window_secs: u64,
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,

    /// Memory limits (0 = derive percent from the probe's own limit)
    #[serde(default)]
    pub memory_limit_bytes: u64,
    #[serde(default = "default_memory_soft_threshold")]
    pub memory_soft_threshold: f64,
    #[serde(default = "default_memory_critical_threshold")]
    pub memory_critical_threshold: f64,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_reclaim_every_pages")]
    pub reclaim_every_pages: u32,

    /// Health checks
    #[serde(default = "default_health_cache_ttl_secs")]
    pub health_cache_ttl_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_history_size")]
    pub health_history_size: usize,
    #[serde(default = "default_health_degraded_ms")]
    pub health_degraded_ms: u64,
    #[serde(default = "default_health_probe_entity")]
    pub health_probe_entity: String,

    /// Merge detection
    #[serde(default = "default_merge_detection_enabled")]
    pub merge_detection_enabled: bool,
    #[serde(default = "default_merge_window_secs")]
    pub merge_window_secs: u64,
    #[serde(default)]
    pub merge_migration: MigrationStrategy,

    /// Pagination
    #[serde(default = "default_page_size_cap")]
    pub page_size_cap: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Max entity types synced at once by `sync_many`
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,
}

fn default_key_prefix() -> String { "crm_sync".to_string() }
fn default_daily_token_budget() -> u64 { 10_000 }
fn default_endpoint_costs() -> HashMap<String, u64> {
    HashMap::from([("files".to_string(), 2)])
}
fn default_max_backoff_secs() -> u64 { 16 }
fn default_circuit_failure_threshold() -> u32 { 5 }
fn default_circuit_window_secs() -> u64 { 600 } // 10 minutes
fn default_circuit_cooldown_secs() -> u64 { 300 }
fn default_memory_soft_threshold() -> f64 { 0.80 }
fn default_memory_critical_threshold() -> f64 { 0.95 }
fn default_min_batch_size() -> usize { 10 }
fn default_max_batch_size() -> usize { 500 }
fn default_reclaim_every_pages() -> u32 { 10 }
fn default_health_cache_ttl_secs() -> u64 { 60 }
fn default_health_interval_secs() -> u64 { 60 }
fn default_health_history_size() -> usize { 50 }
fn default_health_degraded_ms() -> u64 { 1000 }
fn default_health_probe_entity() -> String { "users".to_string() }
fn default_merge_detection_enabled() -> bool { true }
fn default_merge_window_secs() -> u64 { 30 }
fn default_page_size_cap() -> usize { 500 }
fn default_max_pages() -> u32 { 100 }
fn default_sync_concurrency() -> usize { 4 }

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            daily_token_budget: default_daily_token_budget(),
            endpoint_costs: default_endpoint_costs(),
            max_backoff_secs: default_max_backoff_secs(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_window_secs: default_circuit_window_secs(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            memory_limit_bytes: 0,
            memory_soft_threshold: default_memory_soft_threshold(),
            memory_critical_threshold: default_memory_critical_threshold(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            reclaim_every_pages: default_reclaim_every_pages(),
            health_cache_ttl_secs: default_health_cache_ttl_secs(),
            health_interval_secs: default_health_interval_secs(),
            health_history_size: default_health_history_size(),
            health_degraded_ms: default_health_degraded_ms(),
            health_probe_entity: default_health_probe_entity(),
            merge_detection_enabled: default_merge_detection_enabled(),
            merge_window_secs: default_merge_window_secs(),
            merge_migration: MigrationStrategy::default(),
            page_size_cap: default_page_size_cap(),
            max_pages: default_max_pages(),
            sync_concurrency: default_sync_concurrency(),
        }
    }
}

impl SyncEngineConfig {
    /// Reject combinations the components cannot work with.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err(SyncError::Config(format!(
                "min_batch_size ({}) must be in 1..=max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.max_batch_size > self.page_size_cap {
            return Err(SyncError::Config(format!(
                "max_batch_size ({}) exceeds page_size_cap ({})",
                self.max_batch_size, self.page_size_cap
            )));
        }
        if !(0.0 < self.memory_soft_threshold && self.memory_soft_threshold < self.memory_critical_threshold
            && self.memory_critical_threshold <= 1.0)
        {
            return Err(SyncError::Config(format!(
                "memory thresholds must satisfy 0 < soft ({}) < critical ({}) <= 1",
                self.memory_soft_threshold, self.memory_critical_threshold
            )));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(SyncError::Config("circuit_failure_threshold must be > 0".into()));
        }
        if self.health_history_size == 0 {
            return Err(SyncError::Config("health_history_size must be > 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            key_prefix: self.key_prefix.clone(),
            daily_limit: self.daily_token_budget,
            endpoint_costs: self.endpoint_costs.clone(),
            max_delay: Duration::from_secs(self.max_backoff_secs),
        }
    }

    #[must_use]
    pub fn circuit(&self) -> CircuitConfig {
        CircuitConfig {
            key_prefix: self.key_prefix.clone(),
            failure_threshold: self.circuit_failure_threshold,
            window: Duration::from_secs(self.circuit_window_secs),
            cooldown: Duration::from_secs(self.circuit_cooldown_secs),
        }
    }

    #[must_use]
    pub fn memory(&self) -> MemoryConfig {
        MemoryConfig {
            limit_bytes: (self.memory_limit_bytes > 0).then_some(self.memory_limit_bytes),
            soft_threshold: self.memory_soft_threshold,
            critical_threshold: self.memory_critical_threshold,
            min_batch_size: self.min_batch_size,
            max_batch_size: self.max_batch_size,
            reclaim_every_pages: self.reclaim_every_pages,
        }
    }

    #[must_use]
    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            cache_ttl: Duration::from_secs(self.health_cache_ttl_secs),
            interval: Duration::from_secs(self.health_interval_secs),
            history_size: self.health_history_size,
            degraded_threshold: Duration::from_millis(self.health_degraded_ms),
            degraded_window: 5,
            probe_entity: self.health_probe_entity.clone(),
        }
    }

    #[must_use]
    pub fn merge(&self) -> MergeConfig {
        MergeConfig {
            enabled: self.merge_detection_enabled,
            window: Duration::from_secs(self.merge_window_secs),
            strategy: self.merge_migration,
        }
    }

    #[must_use]
    pub fn pagination(&self) -> PaginationConfig {
        PaginationConfig {
            page_size_cap: self.page_size_cap,
            max_pages: self.max_pages,
        }
    }
}

/// Token budget settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub key_prefix: String,
    pub daily_limit: u64,
    /// Cost per endpoint; unlisted endpoints cost 1
    pub endpoint_costs: HashMap<String, u64>,
    /// Cap for both retry-after hints and exponential backoff
    pub max_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        SyncEngineConfig::default().rate_limit()
    }
}

/// Circuit breaker settings, shared by every error kind.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub key_prefix: String,
    /// Failures within `window` that trip the circuit
    pub failure_threshold: u32,
    pub window: Duration,
    /// How long a tripped circuit stays open
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        SyncEngineConfig::default().circuit()
    }
}

impl CircuitConfig {
    /// Fast trip and recovery for tests
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            key_prefix: "test".into(),
            failure_threshold: 2,
            window: Duration::from_secs(60),
            cooldown: Duration::from_millis(50),
        }
    }
}

/// Memory manager settings. Thresholds are fractions (0.0 - 1.0).
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub limit_bytes: Option<u64>,
    pub soft_threshold: f64,
    pub critical_threshold: f64,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub reclaim_every_pages: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        SyncEngineConfig::default().memory()
    }
}

/// Health checker settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub cache_ttl: Duration,
    pub interval: Duration,
    pub history_size: usize,
    pub degraded_threshold: Duration,
    /// Number of most recent checks averaged for `is_degraded`
    pub degraded_window: usize,
    pub probe_entity: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        SyncEngineConfig::default().health()
    }
}

/// Merge detector settings.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub enabled: bool,
    pub window: Duration,
    pub strategy: MigrationStrategy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        SyncEngineConfig::default().merge()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationConfig {
    /// Hard cap on any requested page size
    pub page_size_cap: usize,
    /// Safety stop for full scans
    pub max_pages: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        SyncEngineConfig::default().pagination()
    }
}
