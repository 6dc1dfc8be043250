// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the CRM sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `crm_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `entity_type`: deals, persons, ...
//! - `kind`: error class (server, connection, rate_limit, ...)
//! - `outcome`: success, error, rejected, created, updated, skipped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE CALLS
// ═══════════════════════════════════════════════════════════════════════════

/// Record one remote call attempt
pub fn record_remote_call(entity_type: &str, outcome: &str) {
    counter!(
        "crm_sync_remote_calls_total",
        "entity_type" => entity_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record remote call latency
pub fn record_remote_latency(entity_type: &str, duration: Duration) {
    histogram!(
        "crm_sync_remote_call_seconds",
        "entity_type" => entity_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the number of records in a fetched page
pub fn record_page_size(entity_type: &str, count: usize) {
    histogram!(
        "crm_sync_page_records",
        "entity_type" => entity_type.to_string()
    )
    .record(count as f64);
}

/// Record a retry scheduled for an error kind
pub fn record_retry(kind: &str) {
    counter!(
        "crm_sync_retries_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// TOKEN BUDGET
// ═══════════════════════════════════════════════════════════════════════════

/// Record tokens consumed by a successful call
pub fn record_tokens_consumed(endpoint: &str, cost: u64) {
    counter!(
        "crm_sync_tokens_consumed_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(cost);
}

/// Record a call refused by local admission control
pub fn record_admission_denied(endpoint: &str) {
    counter!(
        "crm_sync_admission_denied_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Set tokens used today
pub fn set_tokens_used(used: u64) {
    gauge!("crm_sync_tokens_used").set(used as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state change (0 = closed, 1 = open)
pub fn set_circuit_state(kind: &str, state: u8) {
    gauge!(
        "crm_sync_circuit_breaker_state",
        "kind" => kind.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call
pub fn record_circuit_breaker_call(kind: &str, outcome: &str) {
    counter!(
        "crm_sync_circuit_breaker_calls_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY
// ═══════════════════════════════════════════════════════════════════════════

/// Set memory usage (0.0 - 100.0)
pub fn set_memory_usage_percent(percent: f64) {
    gauge!("crm_sync_memory_usage_percent").set(percent);
}

/// Set memory pressure level (0 = Normal, 1 = Elevated, 2 = Critical)
pub fn set_memory_pressure_level(level: u8) {
    gauge!("crm_sync_memory_pressure_level").set(level as f64);
}

/// Set the current adaptive batch size
pub fn set_batch_size(size: usize) {
    gauge!("crm_sync_adaptive_batch_size").set(size as f64);
}

/// Record a reclaim hint
pub fn record_reclaim(reason: &str) {
    counter!(
        "crm_sync_reclaim_hints_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// HEALTH
// ═══════════════════════════════════════════════════════════════════════════

/// Set remote health status
pub fn set_remote_healthy(healthy: bool) {
    gauge!("crm_sync_remote_healthy").set(if healthy { 1.0 } else { 0.0 });
}

/// Record health probe latency
pub fn record_health_probe(duration: Duration) {
    histogram!("crm_sync_health_probe_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// RECORDS & EVENTS
// ═══════════════════════════════════════════════════════════════════════════

/// Record processed records by outcome (created, updated, skipped, error)
pub fn record_records(entity_type: &str, outcome: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "crm_sync_records_total",
        "entity_type" => entity_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(count as u64);
}

/// Record an emitted event
pub fn record_event(event: &str, success: bool) {
    counter!(
        "crm_sync_events_total",
        "event" => event.to_string(),
        "status" => if success { "success" } else { "error" }.to_string()
    )
    .increment(1);
}

/// Record an inbound webhook notification
pub fn record_webhook(entity_type: &str, action: &str) {
    counter!(
        "crm_sync_webhooks_total",
        "entity_type" => entity_type.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record an inferred merge
pub fn record_merge_inferred(entity_type: &str, migrated: usize) {
    counter!(
        "crm_sync_merges_inferred_total",
        "entity_type" => entity_type.to_string()
    )
    .increment(1);
    counter!(
        "crm_sync_relations_migrated_total",
        "entity_type" => entity_type.to_string()
    )
    .increment(migrated as u64);
}

/// Set number of open correlation groups
pub fn set_merge_groups(count: usize) {
    gauge!("crm_sync_merge_groups").set(count as f64);
}

/// Record a finished entity-type sync
pub fn record_sync_duration(entity_type: &str, duration: Duration) {
    histogram!(
        "crm_sync_sync_seconds",
        "entity_type" => entity_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records remote latency on drop
pub struct LatencyTimer {
    entity_type: String,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_remote_latency(&self.entity_type, self.start.elapsed());
    }
}
