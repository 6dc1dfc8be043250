// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure handling: classification, per-kind circuit breaking and backoff.

pub mod circuit_breaker;
pub mod classifier;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitMetrics, CircuitState};
pub use classifier::{ClassifiedError, ErrorClassifier, ErrorKind};
pub use retry::RetryConfig;
