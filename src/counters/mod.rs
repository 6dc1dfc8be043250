// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared counter stores.
//!
//! Token budgets and circuit state live here rather than in process memory,
//! so several engine instances share one view. Values expire by TTL; nothing
//! runs in the background to reset them.
//!
//! Keys follow `<prefix>:<category>:<suffix>`, see [`counter_key`].

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::InMemoryCounterStore;
pub use self::redis::RedisCounterStore;

#[derive(Error, Debug)]
pub enum CounterError {
    #[error("Counter backend error: {0}")]
    Backend(String),
    #[error("Counter '{key}' holds a non-integer value")]
    NotAnInteger { key: String },
}

/// Get / put-with-TTL / atomic increment over a shared key-value store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterError>;

    /// Set `key` to `value`, expiring after `ttl`.
    async fn put(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterError>;

    /// Atomically add `by` and return the new value.
    ///
    /// `ttl` applies only when the key is created; later increments keep the
    /// original expiry so a window does not slide forward.
    async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CounterError>;

    async fn delete(&self, key: &str) -> Result<(), CounterError>;

    async fn exists(&self, key: &str) -> Result<bool, CounterError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Build a `<prefix>:<category>:<suffix>` key.
#[must_use]
pub fn counter_key(prefix: &str, category: &str, suffix: &str) -> String {
    format!("{prefix}:{category}:{suffix}")
}
