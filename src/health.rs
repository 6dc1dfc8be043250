// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote API health probing.
//!
//! A probe is a one-record list call on a cheap entity type. Every probe,
//! failed or not, lands in a bounded history; statistics are computed from
//! that history on read.
//!
//! - [`HealthChecker::check`] always probes.
//! - [`HealthChecker::is_healthy`] answers from the last probe while it is
//!   younger than the cache TTL. Concurrent callers with a stale cache wait
//!   for one shared probe instead of each hitting the remote.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use crm_sync::config::HealthConfig;
//! use crm_sync::health::HealthChecker;
//! use crm_sync::transport::{ApiResponse, CallOptions, RemoteTransport, TransportError};
//!
//! struct Up;
//!
//! #[async_trait]
//! impl RemoteTransport for Up {
//!     async fn call(&self, _: &str, _: &CallOptions) -> Result<ApiResponse, TransportError> {
//!         Ok(ApiResponse::ok(vec![]))
//!     }
//! }
//!
//! let checker = HealthChecker::new(Arc::new(Up), HealthConfig::default());
//! assert!(checker.is_healthy().await);
//! assert_eq!(checker.stats().total_checks, 1);
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::transport::{CallOptions, RemoteTransport, SortOrder};

/// Upper bound for a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Rolling statistics over the probe history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStats {
    pub total_checks: usize,
    pub healthy_checks: usize,
    /// 0.0 - 1.0; 0 with no history
    pub success_rate: f64,
    pub min_response_ms: Option<u64>,
    pub avg_response_ms: Option<f64>,
    pub max_response_ms: Option<u64>,
    pub consecutive_failures: usize,
    pub last_check: Option<DateTime<Utc>>,
}

pub struct HealthChecker {
    transport: Arc<dyn RemoteTransport>,
    config: HealthConfig,
    history: Mutex<VecDeque<HealthRecord>>,
    cached: Mutex<Option<(HealthRecord, Instant)>>,
    /// Lock for probing (prevent thundering herd)
    checking: tokio::sync::Mutex<()>,
}

impl HealthChecker {
    pub fn new(transport: Arc<dyn RemoteTransport>, config: HealthConfig) -> Self {
        let capacity = config.history_size.max(1);
        Self {
            transport,
            config,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            cached: Mutex::new(None),
            checking: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe now.
    pub async fn check(&self) -> HealthRecord {
        let _guard = self.checking.lock().await;
        self.probe().await
    }

    /// Cached health, probing only when the cache is stale.
    pub async fn is_healthy(&self) -> bool {
        if let Some(healthy) = self.fresh_cached() {
            return healthy;
        }
        let _guard = self.checking.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(healthy) = self.fresh_cached() {
            return healthy;
        }
        self.probe().await.healthy
    }

    fn fresh_cached(&self) -> Option<bool> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|(_, at)| at.elapsed() < self.config.cache_ttl)
            .map(|(record, _)| record.healthy)
    }

    async fn probe(&self) -> HealthRecord {
        let options = CallOptions {
            limit: 1,
            sort: SortOrder::NewestFirst,
            start: 0,
        };
        let started = Instant::now();
        let outcome = tokio::time::timeout(PROBE_TIMEOUT, self.transport.call(&self.config.probe_entity, &options)).await;
        let elapsed = started.elapsed();

        let (healthy, status_code, error) = match outcome {
            Ok(Ok(response)) => {
                let status = response.status_code;
                match response.into_result() {
                    Ok(_) => (true, Some(status), None),
                    Err(e) => (false, Some(status), Some(e.to_string())),
                }
            }
            Ok(Err(e)) => (false, e.status, Some(e.to_string())),
            Err(_) => (false, None, Some(format!("probe timed out after {}s", PROBE_TIMEOUT.as_secs()))),
        };

        let record = HealthRecord {
            healthy,
            response_time_ms: elapsed.as_millis() as u64,
            status_code,
            error,
            checked_at: Utc::now(),
        };
        self.store(record.clone());

        crate::metrics::set_remote_healthy(healthy);
        crate::metrics::record_health_probe(elapsed);
        if healthy {
            debug!(response_ms = record.response_time_ms, "Health probe ok");
        } else {
            warn!(
                status = ?record.status_code,
                error = record.error.as_deref().unwrap_or_default(),
                consecutive_failures = self.consecutive_failures(),
                "Health probe failed"
            );
        }
        record
    }

    fn store(&self, record: HealthRecord) {
        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_size.max(1) {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        *self.cached.lock() = Some((record, Instant::now()));
    }

    /// Average latency of the last few probes exceeds the degradation threshold.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        let history = self.history.lock();
        let window = self.config.degraded_window.max(1);
        let recent: Vec<u64> = history.iter().rev().take(window).map(|r| r.response_time_ms).collect();
        if recent.is_empty() {
            return false;
        }
        let avg = recent.iter().sum::<u64>() as f64 / recent.len() as f64;
        avg > self.config.degraded_threshold.as_millis() as f64
    }

    /// Failed probes since the last healthy one.
    #[must_use]
    pub fn consecutive_failures(&self) -> usize {
        self.history.lock().iter().rev().take_while(|r| !r.healthy).count()
    }

    /// Probe history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<HealthRecord> {
        self.history.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn last_check(&self) -> Option<HealthRecord> {
        self.history.lock().back().cloned()
    }

    #[must_use]
    pub fn stats(&self) -> HealthStats {
        let history = self.history.lock();
        let total = history.len();
        let healthy = history.iter().filter(|r| r.healthy).count();
        let latencies = || history.iter().map(|r| r.response_time_ms);
        HealthStats {
            total_checks: total,
            healthy_checks: healthy,
            success_rate: if total == 0 { 0.0 } else { healthy as f64 / total as f64 },
            min_response_ms: latencies().min(),
            avg_response_ms: (total > 0).then(|| latencies().sum::<u64>() as f64 / total as f64),
            max_response_ms: latencies().max(),
            consecutive_failures: history.iter().rev().take_while(|r| !r.healthy).count(),
            last_check: history.back().map(|r| r.checked_at),
        }
    }

    /// Probe every `interval` until `cancel` fires.
    pub fn spawn_periodic(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = self.config.interval.as_secs(), "Health monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check().await;
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }
}
