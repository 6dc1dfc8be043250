// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-error-kind circuit breaker backed by the shared counter store.
//!
//! Each [`ErrorKind`] has its own circuit. Failures are counted in a rolling
//! window (`<prefix>:circuit_failures:<kind>`, TTL = window). Reaching the
//! threshold writes an open marker (`<prefix>:circuit_open:<kind>`, TTL =
//! cooldown).
//!
//! States:
//! - Closed: attempts allowed
//! - Open: every retry for that kind is refused until the marker expires or
//!   a success for that kind is recorded
//!
//! There is no half-open probe. Expiry is purely time based, and instances
//! see each other's trips through the shared store (eventually consistent,
//! no distributed lock).
//!
//! Store errors never propagate: the breaker logs them and treats the
//! circuit as closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::classifier::ErrorKind;
use crate::config::CircuitConfig;
use crate::counters::{counter_key, CounterStore};

/// Circuit state; the discriminant is the value of the state gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// In-process counters for this breaker instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub failures: u64,
    pub successes: u64,
    pub trips: u64,
    pub rejections: u64,
}

pub struct CircuitBreaker {
    store: Arc<dyn CounterStore>,
    config: CircuitConfig,

    // Metrics
    failures: AtomicU64,
    successes: AtomicU64,
    trips: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CounterStore>, config: CircuitConfig) -> Self {
        Self {
            store,
            config,
            failures: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            trips: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn failures_key(&self, kind: ErrorKind) -> String {
        counter_key(&self.config.key_prefix, "circuit_failures", kind.as_str())
    }

    fn open_key(&self, kind: ErrorKind) -> String {
        counter_key(&self.config.key_prefix, "circuit_open", kind.as_str())
    }

    /// Count a failure for `kind`, tripping the circuit at the threshold.
    pub async fn record_failure(&self, kind: ErrorKind) -> CircuitState {
        self.failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_breaker_call(kind.as_str(), "failure");

        let count = match self
            .store
            .increment(&self.failures_key(kind), 1, self.config.window)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Circuit failure count unavailable, leaving circuit closed");
                return CircuitState::Closed;
            }
        };

        if count < i64::from(self.config.failure_threshold) {
            debug!(kind = %kind, count, threshold = self.config.failure_threshold, "Circuit failure recorded");
            return CircuitState::Closed;
        }

        match self.store.put(&self.open_key(kind), 1, self.config.cooldown).await {
            Ok(()) => {
                self.trips.fetch_add(1, Ordering::Relaxed);
                crate::metrics::set_circuit_state(kind.as_str(), CircuitState::Open as u8);
                warn!(
                    kind = %kind,
                    failures = count,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit breaker opened"
                );
                CircuitState::Open
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to persist open circuit marker");
                CircuitState::Closed
            }
        }
    }

    /// Close the circuit for `kind` and clear its failure window.
    pub async fn record_success(&self, kind: ErrorKind) {
        self.successes.fetch_add(1, Ordering::Relaxed);

        let was_open = self.is_open_quiet(kind).await;
        for key in [self.open_key(kind), self.failures_key(kind)] {
            if let Err(e) = self.store.delete(&key).await {
                warn!(kind = %kind, key = %key, error = %e, "Failed to reset circuit key");
            }
        }
        if was_open {
            crate::metrics::set_circuit_state(kind.as_str(), CircuitState::Closed as u8);
            info!(kind = %kind, "Circuit breaker closed after success");
        }
    }

    async fn is_open_quiet(&self, kind: ErrorKind) -> bool {
        match self.store.exists(&self.open_key(kind)).await {
            Ok(open) => open,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Circuit state unavailable, assuming closed");
                false
            }
        }
    }

    /// Whether the circuit for `kind` is open. Does not count a rejection.
    pub async fn is_open(&self, kind: ErrorKind) -> bool {
        self.is_open_quiet(kind).await
    }

    pub async fn state(&self, kind: ErrorKind) -> CircuitState {
        if self.is_open_quiet(kind).await {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Failures currently inside the window for `kind`.
    pub async fn failure_count(&self, kind: ErrorKind) -> u64 {
        match self.store.get(&self.failures_key(kind)).await {
            Ok(count) => count.unwrap_or(0).max(0) as u64,
            Err(_) => 0,
        }
    }

    /// Count an attempt that was refused because the circuit was open.
    pub fn record_rejection(&self, kind: ErrorKind) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_breaker_call(kind.as_str(), "rejected");
        debug!(kind = %kind, "Circuit breaker rejected attempt (open)");
    }

    /// First open circuit among `kinds`, counting it as a rejection.
    pub async fn first_open(&self, kinds: &[ErrorKind]) -> Option<ErrorKind> {
        for &kind in kinds {
            if self.is_open_quiet(kind).await {
                self.record_rejection(kind);
                return Some(kind);
            }
        }
        None
    }

    #[must_use]
    pub fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            failures: self.failures.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset in-process metrics (shared circuit state is untouched)
    pub fn reset_metrics(&self) {
        self.failures.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.trips.store(0, Ordering::Relaxed);
        self.rejections.store(0, Ordering::Relaxed);
    }
}
