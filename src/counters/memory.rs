// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local counter store.
//!
//! Used for single-instance deployments and tests. Expiry is checked lazily
//! on access against `tokio::time::Instant`, so paused-clock tests can step
//! through windows deterministically.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CounterError, CounterStore};

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: Instant,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

pub struct InMemoryCounterStore {
    data: DashMap<String, Slot>,
}

impl InMemoryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Number of keys, expired ones included until next touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop expired keys.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.data.retain(|_, slot| slot.live(now));
    }

    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, CounterError> {
        let now = Instant::now();
        let live = self.data.get(key).map(|slot| *slot).filter(|slot| slot.live(now));
        if live.is_none() {
            self.data.remove_if(key, |_, slot| !slot.live(now));
        }
        Ok(live.map(|slot| slot.value))
    }

    async fn put(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CounterError> {
        self.data.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CounterError> {
        let now = Instant::now();
        // The entry guard holds the shard lock, so read-modify-write is atomic.
        let value = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.live(now) {
                    slot.value += by;
                } else {
                    *slot = Slot { value: by, expires_at: now + ttl };
                }
                slot.value
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot { value: by, expires_at: now + ttl });
                by
            }
        };
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), CounterError> {
        self.data.remove(key);
        Ok(())
    }
}
