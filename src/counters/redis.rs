// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed counter store, shared by every engine instance.
//!
//! - `put` → `SET key value EX ttl`
//! - `increment` → `MULTI; INCRBY key by; EXPIRE key ttl NX; EXEC`
//!
//! `EXPIRE ... NX` (Redis 7+) only sets a TTL on keys that have none, which
//! keeps the window anchored at the first increment.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, pipe, Client};
use tracing::debug;

use super::{CounterError, CounterStore};
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect, retrying with the startup policy so a bad URL fails fast.
    pub async fn new(connection_string: &str) -> Result<Self, CounterError> {
        let client = Client::open(connection_string)
            .map_err(|e| CounterError::Backend(e.to_string()))?;

        let connection = retry("redis_counter_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| CounterError::Backend(e.to_string()))?;

        debug!("Redis counter store connected");
        Ok(Self { connection })
    }

    /// Wrap an existing connection (shared with other Redis users).
    #[must_use]
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Get a clone of the connection manager
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn backend(e: redis::RedisError) -> CounterError {
    if e.kind() == redis::ErrorKind::TypeError {
        CounterError::NotAnInteger { key: e.detail().unwrap_or_default().to_string() }
    } else {
        CounterError::Backend(e.to_string())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterError> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = cmd("GET").arg(key).query_async(&mut conn).await.map_err(backend)?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterError> {
        let mut conn = self.connection.clone();
        let _: () = cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CounterError> {
        let mut conn = self.connection.clone();
        let (value,): (i64,) = pipe()
            .atomic()
            .cmd("INCRBY").arg(key).arg(by)
            .cmd("EXPIRE").arg(key).arg(ttl_secs(ttl)).arg("NX").ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), CounterError> {
        let mut conn = self.connection.clone();
        let _: () = cmd("DEL").arg(key).query_async(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CounterError> {
        let mut conn = self.connection.clone();
        let exists: bool = cmd("EXISTS").arg(key).query_async(&mut conn).await.map_err(backend)?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_never_rounds_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(300)), 300);
    }

    #[tokio::test]
    async fn test_invalid_url_is_backend_error() {
        let result = RedisCounterStore::new("not-a-redis-url").await;
        assert!(matches!(result, Err(CounterError::Backend(_))));
    }
}
