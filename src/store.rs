// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local record store boundary.
//!
//! The engine only needs lookup / upsert / delete by remote id, plus relation
//! re-pointing for merges. Persistence itself belongs to the host.
//! [`InMemoryRecordStore`] is the reference implementation used in tests and
//! single-process setups.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),
    #[error("Record {entity_type}/{remote_id} rejected: {reason}")]
    Rejected {
        entity_type: String,
        remote_id: String,
        reason: String,
    },
}

/// A record as held by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub entity_type: String,
    pub remote_id: String,
    pub fields: Map<String, Value>,
    /// Bumped on every upsert
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn find_by_remote_id(&self, entity_type: &str, remote_id: &str) -> Result<Option<LocalRecord>, StoreError>;

    /// Insert or replace. Returns the stored record and whether it was created.
    async fn upsert(
        &self,
        entity_type: &str,
        remote_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(LocalRecord, bool), StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, entity_type: &str, remote_id: &str) -> Result<bool, StoreError>;
}

/// Re-points dependent records after a merge.
#[async_trait]
pub trait RelationMigrator: Send + Sync {
    /// Rewrite `link_field == from` to `to` on every record. Returns how many changed.
    async fn migrate_relations(&self, link_field: &str, from: &str, to: &str) -> Result<usize, StoreError>;

    /// Remember that `merged_id` now lives on as `surviving_id`.
    async fn record_alias(&self, entity_type: &str, merged_id: &str, surviving_id: &str) -> Result<(), StoreError>;
}

type Key = (String, String);

fn key(entity_type: &str, remote_id: &str) -> Key {
    (entity_type.to_string(), remote_id.to_string())
}

/// Does a link field value point at `id`? Remote ids arrive both as numbers and strings.
fn links_to(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Number(n) => n.to_string() == id,
        _ => false,
    }
}

/// Keep numeric links numeric.
fn link_value(previous: &Value, id: &str) -> Value {
    match (previous, id.parse::<i64>()) {
        (Value::Number(_), Ok(n)) => Value::from(n),
        _ => Value::String(id.to_string()),
    }
}

pub struct InMemoryRecordStore {
    records: DashMap<Key, LocalRecord>,
    aliases: DashMap<Key, String>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            aliases: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of one entity type.
    #[must_use]
    pub fn count(&self, entity_type: &str) -> usize {
        self.records.iter().filter(|r| r.key().0 == entity_type).count()
    }

    /// Surviving id recorded for a merged record.
    #[must_use]
    pub fn alias_of(&self, entity_type: &str, merged_id: &str) -> Option<String> {
        self.aliases.get(&key(entity_type, merged_id)).map(|r| r.value().clone())
    }

    /// Snapshot of every record, keyed by `(entity_type, remote_id)`.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Key, LocalRecord> {
        self.records.iter().map(|r| (r.key().clone(), r.value().clone())).collect()
    }

    pub fn clear(&self) {
        self.records.clear();
        self.aliases.clear();
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for InMemoryRecordStore {
    async fn find_by_remote_id(&self, entity_type: &str, remote_id: &str) -> Result<Option<LocalRecord>, StoreError> {
        Ok(self.records.get(&key(entity_type, remote_id)).map(|r| r.value().clone()))
    }

    async fn upsert(
        &self,
        entity_type: &str,
        remote_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<(LocalRecord, bool), StoreError> {
        let now = Utc::now();
        let mut created = false;
        let record = self
            .records
            .entry(key(entity_type, remote_id))
            .and_modify(|existing| {
                existing.fields = fields.clone();
                existing.version += 1;
                existing.updated_at = now;
            })
            .or_insert_with(|| {
                created = true;
                LocalRecord {
                    entity_type: entity_type.to_string(),
                    remote_id: remote_id.to_string(),
                    fields: fields.clone(),
                    version: 1,
                    created_at: now,
                    updated_at: now,
                }
            })
            .value()
            .clone();
        Ok((record, created))
    }

    async fn delete(&self, entity_type: &str, remote_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.remove(&key(entity_type, remote_id)).is_some())
    }
}

#[async_trait]
impl RelationMigrator for InMemoryRecordStore {
    async fn migrate_relations(&self, link_field: &str, from: &str, to: &str) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut migrated = 0;
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            let Some(current) = record.fields.get(link_field) else {
                continue;
            };
            if !links_to(current, from) {
                continue;
            }
            let replacement = link_value(current, to);
            record.fields.insert(link_field.to_string(), replacement);
            record.version += 1;
            record.updated_at = now;
            migrated += 1;
        }
        Ok(migrated)
    }

    async fn record_alias(&self, entity_type: &str, merged_id: &str, surviving_id: &str) -> Result<(), StoreError> {
        self.aliases.insert(key(entity_type, merged_id), surviving_id.to_string());
        Ok(())
    }
}
