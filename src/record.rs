// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Records and per-sync value types.
//!
//! A [`RemoteRecord`] is one entity as returned by the CRM: an opaque field
//! map plus its mandatory remote identifier. It lives only as long as the page
//! being processed.
//!
//! # Example
//!
//! ```
//! use crm_sync::{RemoteRecord, SyncOptions};
//! use serde_json::json;
//!
//! let record = RemoteRecord::from_value(json!({"id": 42, "title": "Big deal"})).unwrap();
//! assert_eq!(record.id, "42");
//!
//! let opts = SyncOptions::new("deals").with_full_scan(true);
//! let resync = opts.with_overwrite(true);
//! assert!(!opts.overwrite_existing());
//! assert!(resync.overwrite_existing());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hard cap for any requested page size.
pub const MAX_PAGE_SIZE: usize = 500;

/// One entity returned by the remote API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Remote identifier (numeric ids are stringified)
    pub id: String,
    /// Every field of the remote payload, `id` included
    pub fields: Map<String, Value>,
}

impl RemoteRecord {
    /// Build a record from a JSON object.
    ///
    /// Returns `None` for non-objects and objects without a usable `id`.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(fields) = value else {
            return None;
        };
        let id = match fields.get("id")? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(Self { id, fields })
    }

    /// Get a single field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Approximate in-memory footprint, used for page-size accounting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.id.len()
            + serde_json::to_vec(&self.fields).map(|v| v.len()).unwrap_or(0)
    }
}

/// How a sync pulls records from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// One bounded page, newest first. Routine syncs.
    LatestModifications,
    /// Oldest first, paginated to completion. Backfills.
    FullScan,
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LatestModifications => write!(f, "latest_modifications"),
            Self::FullScan => write!(f, "full_scan"),
        }
    }
}

/// Partial update for [`SyncOptions::with_changes`]. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct OptionChanges {
    pub entity_type: Option<String>,
    pub page_size: Option<usize>,
    pub full_scan: Option<bool>,
    pub overwrite_existing: Option<bool>,
}

/// Options for one entity-type sync.
///
/// Immutable: every `with_*` method returns a modified copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    entity_type: String,
    page_size: usize,
    full_scan: bool,
    overwrite_existing: bool,
}

impl SyncOptions {
    /// Latest-modifications sync with the maximum page size.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            page_size: MAX_PAGE_SIZE,
            full_scan: false,
            overwrite_existing: false,
        }
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn full_scan(&self) -> bool {
        self.full_scan
    }

    #[must_use]
    pub fn overwrite_existing(&self) -> bool {
        self.overwrite_existing
    }

    #[must_use]
    pub fn fetch_mode(&self) -> FetchMode {
        if self.full_scan {
            FetchMode::FullScan
        } else {
            FetchMode::LatestModifications
        }
    }

    /// Copy with the given changes applied. Page size is clamped to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn with_changes(&self, changes: OptionChanges) -> Self {
        Self {
            entity_type: changes.entity_type.unwrap_or_else(|| self.entity_type.clone()),
            page_size: changes
                .page_size
                .map_or(self.page_size, |n| n.clamp(1, MAX_PAGE_SIZE)),
            full_scan: changes.full_scan.unwrap_or(self.full_scan),
            overwrite_existing: changes.overwrite_existing.unwrap_or(self.overwrite_existing),
        }
    }

    #[must_use]
    pub fn with_page_size(&self, page_size: usize) -> Self {
        self.with_changes(OptionChanges { page_size: Some(page_size), ..Default::default() })
    }

    #[must_use]
    pub fn with_full_scan(&self, full_scan: bool) -> Self {
        self.with_changes(OptionChanges { full_scan: Some(full_scan), ..Default::default() })
    }

    #[must_use]
    pub fn with_overwrite(&self, overwrite_existing: bool) -> Self {
        self.with_changes(OptionChanges {
            overwrite_existing: Some(overwrite_existing),
            ..Default::default()
        })
    }

    #[must_use]
    pub fn for_entity(&self, entity_type: impl Into<String>) -> Self {
        self.with_changes(OptionChanges {
            entity_type: Some(entity_type.into()),
            ..Default::default()
        })
    }
}

/// Outcome of one entity-type sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SyncResult {
    /// Records that went through processing, whatever the outcome.
    #[must_use]
    pub fn total(&self) -> usize {
        self.created + self.updated + self.skipped + self.errors
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors == 0 && self.error_message.is_none()
    }

    /// Count a failure and keep the first message.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors += 1;
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
    }

    /// Fold another page's counts into this one.
    pub fn absorb(&mut self, other: SyncResult) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors += other.errors;
        if self.error_message.is_none() {
            self.error_message = other.error_message;
        }
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created={} updated={} skipped={} errors={}",
            self.created, self.updated, self.skipped, self.errors
        )
    }
}
