// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Daily token budget and backoff.
//!
//! Every remote call costs tokens (1 by default, more for heavy endpoints).
//! The day's usage lives in the shared counter store under
//! `<prefix>:tokens:<YYYY-MM-DD>` with a TTL running to the end of the UTC
//! day, so the budget resets lazily: the first call of a new day simply finds
//! a fresh key.
//!
//! Admission is advisory local throttling. A store outage admits everything
//! rather than stalling the sync.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use crm_sync::config::RateLimitConfig;
//! use crm_sync::counters::InMemoryCounterStore;
//! use crm_sync::rate_limit::RateLimitManager;
//!
//! let limiter = RateLimitManager::new(Arc::new(InMemoryCounterStore::new()), RateLimitConfig {
//!     daily_limit: 3,
//!     ..Default::default()
//! });
//!
//! assert!(limiter.can_admit("deals", 1).await);
//! limiter.consume("files", limiter.cost("files")).await;
//! assert!(!limiter.can_admit("deals", 2).await);
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::counters::{counter_key, CounterStore};
use crate::resilience::retry::{add_jitter, exponential_delay};
use crate::transport::RateLimitHeaders;

/// Jitter added on top of every wait (up to +10%).
pub const WAIT_JITTER: f64 = 0.10;

/// Remote snapshot TTL when the remote does not say when its window resets.
const DEFAULT_REMOTE_WINDOW: Duration = Duration::from_secs(2);

/// One day's token usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenBudget {
    pub used: u64,
    pub daily_limit: u64,
    pub window_start: DateTime<Utc>,
}

impl TokenBudget {
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.daily_limit.saturating_sub(self.used)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.daily_limit
    }
}

/// Start of the UTC day containing `now`.
fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Time left until the next UTC midnight, never zero.
fn until_end_of_day(now: DateTime<Utc>) -> Duration {
    let tomorrow = day_start(now).checked_add_days(Days::new(1)).unwrap_or(now);
    (tomorrow - now).to_std().unwrap_or(Duration::ZERO).max(Duration::from_secs(1))
}

pub struct RateLimitManager {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimitManager {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Token cost of one call to `endpoint`.
    #[must_use]
    pub fn cost(&self, endpoint: &str) -> u64 {
        self.config.endpoint_costs.get(endpoint).copied().unwrap_or(1)
    }

    fn tokens_key(&self, day: NaiveDate) -> String {
        counter_key(&self.config.key_prefix, "tokens", &day.format("%Y-%m-%d").to_string())
    }

    fn remote_key(&self) -> String {
        counter_key(&self.config.key_prefix, "remote", "remaining")
    }

    async fn used_at(&self, now: DateTime<Utc>) -> Result<u64, crate::counters::CounterError> {
        let used = self.store.get(&self.tokens_key(now.date_naive())).await?;
        Ok(used.unwrap_or(0).max(0) as u64)
    }

    /// Whether a call costing `cost` fits in today's budget.
    pub async fn can_admit(&self, endpoint: &str, cost: u64) -> bool {
        self.can_admit_at(endpoint, cost, Utc::now()).await
    }

    pub async fn can_admit_at(&self, endpoint: &str, cost: u64, now: DateTime<Utc>) -> bool {
        match self.used_at(now).await {
            Ok(used) => {
                let admitted = used.saturating_add(cost) <= self.config.daily_limit;
                if !admitted {
                    crate::metrics::record_admission_denied(endpoint);
                    debug!(endpoint, used, cost, limit = self.config.daily_limit, "Token budget denies call");
                }
                admitted
            }
            Err(e) => {
                warn!(endpoint, error = %e, "Token budget unavailable, admitting call");
                true
            }
        }
    }

    /// Charge a successful call. Returns the day's new total, or `None` if the
    /// store could not be updated.
    pub async fn consume(&self, endpoint: &str, cost: u64) -> Option<u64> {
        self.consume_at(endpoint, cost, Utc::now()).await
    }

    pub async fn consume_at(&self, endpoint: &str, cost: u64, now: DateTime<Utc>) -> Option<u64> {
        let key = self.tokens_key(now.date_naive());
        let by = i64::try_from(cost).unwrap_or(i64::MAX);
        match self.store.increment(&key, by, until_end_of_day(now)).await {
            Ok(used) => {
                let used = used.max(0) as u64;
                crate::metrics::record_tokens_consumed(endpoint, cost);
                crate::metrics::set_tokens_used(used);
                Some(used)
            }
            Err(e) => {
                warn!(endpoint, cost, error = %e, "Failed to record token usage");
                None
            }
        }
    }

    /// Wait before retry number `attempt` (1-based).
    ///
    /// A remote `retry-after` hint wins (capped at `max_delay`); otherwise
    /// `min(2^(attempt-1) s, max_delay)`. Up to 10% jitter is added either way.
    #[must_use]
    pub fn wait_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base = match retry_after {
            Some(hint) => hint.min(self.config.max_delay),
            None => exponential_delay(Duration::from_secs(1), attempt, self.config.max_delay),
        };
        add_jitter(base, WAIT_JITTER)
    }

    /// Inspect rate-limit headers from a response.
    ///
    /// Stores the remote `remaining` count (TTL = the remote reset window) and
    /// returns how long to wait before the next call, if at all.
    pub async fn handle_rate_limit_response(&self, headers: &RateLimitHeaders) -> Option<Duration> {
        if headers.is_empty() {
            return None;
        }
        let window = headers.reset.map_or(DEFAULT_REMOTE_WINDOW, Duration::from_secs);

        if let Some(remaining) = headers.remaining {
            let remaining = i64::try_from(remaining).unwrap_or(i64::MAX);
            if let Err(e) = self.store.put(&self.remote_key(), remaining, window).await {
                warn!(error = %e, "Failed to store remote rate-limit snapshot");
            }
        }

        let wait = match (headers.retry_after, headers.remaining) {
            (Some(secs), _) => Some(Duration::from_secs(secs)),
            (None, Some(0)) => Some(window),
            _ => None,
        }
        .map(|d| d.min(self.config.max_delay));

        if let Some(wait) = wait {
            debug!(
                remaining = ?headers.remaining,
                limit = ?headers.limit,
                wait_ms = wait.as_millis() as u64,
                "Remote rate limit reached"
            );
        }
        wait
    }

    /// Remote `remaining` from the last response, while its window is open.
    pub async fn remote_remaining(&self) -> Option<u64> {
        match self.store.get(&self.remote_key()).await {
            Ok(value) => value.map(|v| v.max(0) as u64),
            Err(e) => {
                warn!(error = %e, "Remote rate-limit snapshot unavailable");
                None
            }
        }
    }

    /// Today's usage. Store errors read as zero usage.
    pub async fn budget(&self) -> TokenBudget {
        self.budget_at(Utc::now()).await
    }

    pub async fn budget_at(&self, now: DateTime<Utc>) -> TokenBudget {
        let used = self.used_at(now).await.unwrap_or_else(|e| {
            warn!(error = %e, "Token budget unavailable");
            0
        });
        TokenBudget {
            used,
            daily_limit: self.config.daily_limit,
            window_start: day_start(now),
        }
    }
}
