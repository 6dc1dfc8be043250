// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Failure classification and per-class retry policy.
//!
//! Every transport failure is turned into a [`ClassifiedError`] before the
//! engine decides whether to retry it. Status codes win when present;
//! otherwise the message is matched against keyword lists.
//!
//! | Kind | Source | Retryable | Max retries | Base delay |
//! |---|---|---|---|---|
//! | `auth` | 401 | yes | 1 | 5s |
//! | `auth` | 403 | no | 1 | - |
//! | `quota` | 402 | yes | 1 | 60s |
//! | `rate_limit` | 429 | yes | 5 | retry-after or 2s |
//! | `server` | 5xx | yes | 5 | 1s, exponential |
//! | `not_found` | 404, "item not found" | no | 0 | - |
//! | `connection` | 408, network keywords | yes | 3 | 2s, exponential |
//! | `memory` | memory keywords | no | 0 | - |
//! | `generic` | anything else | no | 0 | - |
//!
//! # Example
//!
//! ```
//! use crm_sync::resilience::classifier::{ErrorClassifier, ErrorKind};
//! use crm_sync::transport::TransportError;
//!
//! let err = ErrorClassifier::classify(&TransportError::status(503, "unavailable"), &[("entity_type", "deals")]);
//! assert_eq!(err.kind, ErrorKind::Server);
//! assert!(err.retryable);
//! assert_eq!(err.context.get("entity_type").map(String::as_str), Some("deals"));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::retry::{exponential_delay, spread_jitter};
use crate::transport::TransportError;

/// Cap for exponential retry delays.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Jitter applied to every retry delay (±10%).
pub const RETRY_JITTER: f64 = 0.10;

const CONNECTION_KEYWORDS: &[&str] = &[
    "connection", "timeout", "timed out", "dns", "ssl", "tls", "refused", "reset", "network", "broken pipe",
];
const MEMORY_KEYWORDS: &[&str] = &["memory", "allocation", "fatal"];
const RATE_LIMIT_KEYWORDS: &[&str] = &["rate limit", "too many requests"];

/// Failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Auth,
    Quota,
    RateLimit,
    Server,
    Memory,
    NotFound,
    Generic,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        Self::Connection,
        Self::Auth,
        Self::Quota,
        Self::RateLimit,
        Self::Server,
        Self::Memory,
        Self::NotFound,
        Self::Generic,
    ];

    /// Kinds that mean "the remote side is struggling". An open circuit on
    /// any of them stops new calls before they reach the transport.
    pub const UPSTREAM: [ErrorKind; 4] = [Self::Server, Self::Connection, Self::RateLimit, Self::Quota];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Memory => "memory",
            Self::NotFound => "not_found",
            Self::Generic => "generic",
        }
    }

    /// Kinds whose retry delay grows exponentially with the attempt number.
    #[must_use]
    pub fn backs_off_exponentially(&self) -> bool {
        matches!(self, Self::Server | Self::Connection | Self::RateLimit)
    }

    /// `(retryable, max_retries, base retry delay in seconds)`
    fn policy(&self) -> (bool, u32, u64) {
        match self {
            Self::Connection => (true, 3, 2),
            Self::Auth => (true, 1, 5),
            Self::Quota => (true, 1, 60),
            Self::RateLimit => (true, 5, 2),
            Self::Server => (true, 5, 1),
            Self::Memory | Self::NotFound | Self::Generic => (false, 0, 0),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure with its retry metadata.
///
/// `retryable == false` means never retry, whatever the attempt count.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub retry_after_secs: u64,
    pub max_retries: u32,
    /// Status code of the remote failure, if any
    pub status: Option<u16>,
    /// `retry-after` sent by the remote side
    pub remote_retry_after: Option<u64>,
    pub context: BTreeMap<String, String>,
    /// Actionable hint for operators
    pub suggestion: Option<String>,
}

impl ClassifiedError {
    /// Error of `kind` with that kind's default policy.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let (retryable, max_retries, retry_after_secs) = kind.policy();
        Self {
            kind,
            message: message.into(),
            retryable,
            retry_after_secs,
            max_retries,
            status: None,
            remote_retry_after: None,
            context: BTreeMap::new(),
            suggestion: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    #[must_use]
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Local rate-limit refusal: the daily budget will not refill before tomorrow.
    pub fn budget_exhausted(endpoint: &str, used: u64, limit: u64) -> Self {
        Self::new(ErrorKind::RateLimit, format!("daily token budget exhausted ({used}/{limit})"))
            .non_retryable()
            .with_context("endpoint", endpoint)
            .with_suggestion("raise the daily token budget or resume the sync tomorrow")
    }

    /// Fail-fast error while the circuit for `kind` is open.
    pub fn circuit_open(kind: ErrorKind) -> Self {
        Self::new(kind, format!("circuit open for {kind} errors, call skipped"))
            .non_retryable()
            .with_context("circuit", CircuitState::Open.to_string())
    }

    /// Memory hard stop.
    pub fn out_of_memory(operation: &str, usage_percent: f64) -> Self {
        Self::new(ErrorKind::Memory, format!("memory usage {usage_percent:.1}% reached critical threshold"))
            .with_context("operation", operation)
            .with_suggestion("lower max_batch_size or raise the memory limit")
    }
}

/// Classifier and retry gate.
///
/// Classification itself is pure ([`ErrorClassifier::classify`]); the retry
/// decision consults the shared [`CircuitBreaker`].
pub struct ErrorClassifier {
    breaker: Arc<CircuitBreaker>,
}

impl ErrorClassifier {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Classify a transport failure.
    #[must_use]
    pub fn classify(err: &TransportError, context: &[(&str, &str)]) -> ClassifiedError {
        let mut classified = match err.status {
            Some(status) if status >= 400 => Self::from_status(status, &err.message),
            _ => Self::from_message(&err.message),
        };
        classified.status = err.status;
        if let Some(hint) = err.retry_after() {
            classified.remote_retry_after = Some(hint.as_secs());
            if classified.kind == ErrorKind::RateLimit {
                classified.retry_after_secs = hint.as_secs();
            }
        }
        for (key, value) in context {
            classified.context.insert((*key).to_string(), (*value).to_string());
        }
        classified
    }

    /// Classify any error by its message.
    #[must_use]
    pub fn classify_error(err: &(dyn std::error::Error + 'static), context: &[(&str, &str)]) -> ClassifiedError {
        let mut classified = Self::from_message(&err.to_string());
        for (key, value) in context {
            classified.context.insert((*key).to_string(), (*value).to_string());
        }
        classified
    }

    fn from_status(status: u16, message: &str) -> ClassifiedError {
        match status {
            401 => ClassifiedError::new(ErrorKind::Auth, message)
                .with_suggestion("check the API token; it may have been revoked or expired"),
            403 => ClassifiedError::new(ErrorKind::Auth, message)
                .non_retryable()
                .with_suggestion("the API token lacks permission for this entity type"),
            402 => ClassifiedError::new(ErrorKind::Quota, message)
                .with_suggestion("the remote plan quota is exhausted; upgrade the plan or wait for the next period"),
            404 => Self::not_found(message),
            408 => ClassifiedError::new(ErrorKind::Connection, message),
            429 => ClassifiedError::new(ErrorKind::RateLimit, message),
            500..=599 => ClassifiedError::new(ErrorKind::Server, message),
            _ => Self::from_message(message),
        }
    }

    fn from_message(message: &str) -> ClassifiedError {
        let lower = message.to_ascii_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if lower.contains("item not found") || lower.contains("not found") {
            Self::not_found(message)
        } else if has(RATE_LIMIT_KEYWORDS) {
            ClassifiedError::new(ErrorKind::RateLimit, message)
        } else if has(CONNECTION_KEYWORDS) {
            ClassifiedError::new(ErrorKind::Connection, message)
        } else if has(MEMORY_KEYWORDS) {
            ClassifiedError::new(ErrorKind::Memory, message)
        } else {
            ClassifiedError::new(ErrorKind::Generic, message)
        }
    }

    fn not_found(message: &str) -> ClassifiedError {
        ClassifiedError::new(ErrorKind::NotFound, message)
            .with_suggestion("the entity type is not available for this account; remove it from the sync list")
    }

    /// Whether attempt number `attempt` (0-based count of attempts already
    /// retried) may be followed by another one.
    pub async fn should_retry(&self, error: &ClassifiedError, attempt: u32) -> bool {
        if !error.retryable || attempt >= error.max_retries {
            return false;
        }
        if self.breaker.is_open(error.kind).await {
            self.breaker.record_rejection(error.kind);
            return false;
        }
        true
    }

    /// Delay before retry number `attempt` (1-based), ±10% jitter.
    #[must_use]
    pub fn retry_delay(&self, error: &ClassifiedError, attempt: u32) -> Duration {
        let base = Duration::from_secs(error.retry_after_secs);
        let delay = if error.kind.backs_off_exponentially() {
            exponential_delay(base, attempt, MAX_RETRY_DELAY)
        } else {
            base
        };
        spread_jitter(delay, RETRY_JITTER)
    }

    pub async fn record_failure(&self, error: &ClassifiedError) -> CircuitState {
        self.breaker.record_failure(error.kind).await
    }

    pub async fn record_success(&self, kind: ErrorKind) {
        self.breaker.record_success(kind).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use crate::counters::InMemoryCounterStore;

    fn classifier() -> ErrorClassifier {
        let breaker = CircuitBreaker::new(Arc::new(InMemoryCounterStore::new()), CircuitConfig::test());
        ErrorClassifier::new(Arc::new(breaker))
    }

    fn status(code: u16) -> ClassifiedError {
        ErrorClassifier::classify(&TransportError::status(code, "boom"), &[])
    }

    fn message(text: &str) -> ClassifiedError {
        ErrorClassifier::classify(&TransportError::network(text), &[])
    }

    #[test]
    fn test_status_codes_take_precedence() {
        assert_eq!(status(401).kind, ErrorKind::Auth);
        assert!(status(401).retryable);
        assert!(!status(403).retryable);
        assert_eq!(status(402).kind, ErrorKind::Quota);
        assert_eq!(status(402).max_retries, 1);
        assert_eq!(status(429).kind, ErrorKind::RateLimit);
        assert_eq!(status(429).max_retries, 5);
        assert_eq!(status(501).kind, ErrorKind::Server);
        assert_eq!(status(503).max_retries, 5);
        assert_eq!(status(408).kind, ErrorKind::Connection);

        // Status wins over misleading text
        let err = ErrorClassifier::classify(&TransportError::status(500, "connection refused"), &[]);
        assert_eq!(err.kind, ErrorKind::Server);
    }

    #[test]
    fn test_not_found_is_fatal_with_suggestion() {
        for err in [status(404), message("Item not found")] {
            assert_eq!(err.kind, ErrorKind::NotFound);
            assert!(!err.retryable);
            assert!(err.suggestion.as_deref().unwrap().contains("remove it from the sync list"));
        }
    }

    #[test]
    fn test_message_heuristics() {
        assert_eq!(message("Connection reset by peer").kind, ErrorKind::Connection);
        assert_eq!(message("DNS lookup failed").kind, ErrorKind::Connection);
        assert_eq!(message("operation timed out").kind, ErrorKind::Connection);
        assert_eq!(message("SSL handshake failed").kind, ErrorKind::Connection);
        assert_eq!(message("memory allocation of 8GB failed").kind, ErrorKind::Memory);
        assert!(!message("fatal: out of memory").retryable);
        assert_eq!(message("unexpected token in JSON").kind, ErrorKind::Generic);
        assert!(!message("unexpected token in JSON").retryable);
    }

    #[test]
    fn test_unmapped_4xx_uses_message() {
        let err = ErrorClassifier::classify(&TransportError::status(400, "bad filter"), &[]);
        assert_eq!(err.kind, ErrorKind::Generic);
        assert_eq!(err.status, Some(400));
    }

    #[test]
    fn test_retry_after_header_is_kept() {
        let err = ErrorClassifier::classify(
            &TransportError::status(429, "slow down").with_header("Retry-After", "5"),
            &[("entity_type", "deals")],
        );
        assert_eq!(err.retry_after_secs, 5);
        assert_eq!(err.remote_retry_after, Some(5));
        assert_eq!(err.context["entity_type"], "deals");
    }

    #[test]
    fn test_classify_arbitrary_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = ErrorClassifier::classify_error(&io, &[("remote_id", "9")]);
        assert_eq!(err.kind, ErrorKind::Connection);
        assert_eq!(err.context["remote_id"], "9");
    }

    #[tokio::test]
    async fn test_should_retry_respects_budget_and_flag() {
        let c = classifier();
        let server = status(500);
        assert!(c.should_retry(&server, 0).await);
        assert!(c.should_retry(&server, 4).await);
        assert!(!c.should_retry(&server, 5).await);
        assert!(!c.should_retry(&server, 50).await);

        assert!(!c.should_retry(&status(404), 0).await);
    }

    #[tokio::test]
    async fn test_open_circuit_blocks_retry() {
        let c = classifier();
        let server = status(502);
        c.record_failure(&server).await;
        c.record_failure(&server).await;

        assert!(!c.should_retry(&server, 0).await);
        assert_eq!(c.breaker().metrics().rejections, 1);

        c.record_success(ErrorKind::Server).await;
        assert!(c.should_retry(&server, 0).await);
    }

    #[test]
    fn test_retry_delay_exponential_kinds() {
        let c = classifier();
        let server = status(500);
        let d1 = c.retry_delay(&server, 1);
        let d4 = c.retry_delay(&server, 4);
        assert!(d1 >= Duration::from_millis(900) && d1 <= Duration::from_millis(1100));
        assert!(d4 >= Duration::from_millis(7200) && d4 <= Duration::from_millis(8800));

        let capped = c.retry_delay(&server, 20);
        assert!(capped <= Duration::from_secs(66));
    }

    #[test]
    fn test_retry_delay_fixed_kinds() {
        let c = classifier();
        let quota = status(402);
        for attempt in 1..4 {
            let d = c.retry_delay(&quota, attempt);
            assert!(d >= Duration::from_secs(54) && d <= Duration::from_secs(66));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(status(500).to_string(), "server error: boom");
        assert_eq!(ErrorKind::RateLimit.to_string(), "rate_limit");
    }
}
