// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Merge detection from webhook notifications.
//!
//! The CRM has no "merged" notification. A merge of record 7 into record 5
//! arrives as independent events sharing a correlation id: `updated` for 5
//! (possibly several) and `deleted` for 7. The detector groups events by
//! correlation id for a short window and, when exactly one id of a type was
//! deleted while at least one other id of that type was updated, infers that
//! the deleted record was merged into the first updated one.
//!
//! This is a heuristic. Simultaneous unrelated edits that happen to share a
//! correlation id can produce a false merge, so detection can be switched
//! off ([`MergeDetector::set_enabled`]) and relation migration is a separate
//! [`MigrationStrategy`] choice.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use std::sync::Arc;
//! use crm_sync::config::MergeConfig;
//! use crm_sync::events::TracingEventSink;
//! use crm_sync::merge::{MergeDetector, WebhookAction, WebhookEvent};
//!
//! let detector = MergeDetector::new(MergeConfig::default(), Arc::new(TracingEventSink));
//!
//! let update = WebhookEvent::new(WebhookAction::Update, "deals", "5").with_correlation_id("req-1");
//! let delete = WebhookEvent::new(WebhookAction::Delete, "deals", "7").with_correlation_id("req-1");
//!
//! assert!(detector.observe(&update).await.is_none());
//! let outcome = detector.observe(&delete).await.unwrap();
//! assert_eq!(outcome.inference.merged_id, "7");
//! assert_eq!(outcome.inference.surviving_id, "5");
//! # }
//! ```

pub mod window;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MergeConfig;
use crate::events::{emit_logged, EventSink, SyncEvent};
use crate::registry::EntityRegistry;
use crate::store::RelationMigrator;

pub use window::CorrelationWindow;

/// What to do with relations pointing at a merged record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStrategy {
    /// Re-point dependent records to the surviving id
    #[default]
    Migrate,
    /// Leave relations alone; only report the merge
    Skip,
    /// Re-point relations and keep a merged → surviving alias
    Both,
}

impl MigrationStrategy {
    #[must_use]
    pub fn migrates_relations(&self) -> bool {
        matches!(self, Self::Migrate | Self::Both)
    }

    #[must_use]
    pub fn records_alias(&self) -> bool {
        matches!(self, Self::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Migrate => "migrate",
            Self::Skip => "skip",
            Self::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookAction {
    #[serde(alias = "added", alias = "create", alias = "created")]
    Add,
    #[serde(alias = "updated", alias = "change", alias = "changed")]
    Update,
    #[serde(alias = "deleted", alias = "remove", alias = "removed")]
    Delete,
}

impl WebhookAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Inbound notification about one remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub action: WebhookAction,
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(action: WebhookAction, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            action,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// "`merged_id` was merged into `surviving_id`".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeInference {
    pub entity_type: String,
    pub merged_id: String,
    pub surviving_id: String,
    pub correlation_id: String,
}

/// An inference and what was done about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inference: MergeInference,
    pub strategy: MigrationStrategy,
    pub relations_migrated: usize,
    pub alias_recorded: bool,
}

pub struct MergeDetector {
    config: MergeConfig,
    window: CorrelationWindow,
    sink: Arc<dyn EventSink>,
    migrator: Option<Arc<dyn RelationMigrator>>,
    registry: Arc<EntityRegistry>,
    enabled: AtomicBool,
    inferred: AtomicU64,
}

impl MergeDetector {
    pub fn new(config: MergeConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            window: CorrelationWindow::new(config.window),
            enabled: AtomicBool::new(config.enabled),
            config,
            sink,
            migrator: None,
            registry: Arc::new(EntityRegistry::with_defaults()),
            inferred: AtomicU64::new(0),
        }
    }

    /// Re-point relations through `migrator` when a merge is inferred.
    #[must_use]
    pub fn with_migrator(mut self, migrator: Arc<dyn RelationMigrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    /// Registry used to find the link field of each entity type.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<EntityRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Switch detection on or off. Turning it off drops pending groups.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.window.clear();
        }
        info!(enabled, "Merge detection toggled");
    }

    #[must_use]
    pub fn strategy(&self) -> MigrationStrategy {
        self.config.strategy
    }

    /// Merges inferred since start.
    #[must_use]
    pub fn inferred_count(&self) -> u64 {
        self.inferred.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn window(&self) -> &CorrelationWindow {
        &self.window
    }

    /// Group the event and check for a merge pattern, without acting on it.
    #[must_use]
    pub fn detect(&self, event: &WebhookEvent) -> Option<MergeInference> {
        if !self.is_enabled() {
            return None;
        }
        let inference = self.window.observe(event);
        crate::metrics::set_merge_groups(self.window.len());
        inference
    }

    /// Feed one notification. On an inferred merge, migrate relations per the
    /// strategy and emit a single `merged` event.
    pub async fn observe(&self, event: &WebhookEvent) -> Option<MergeOutcome> {
        let inference = self.detect(event)?;
        self.inferred.fetch_add(1, Ordering::Relaxed);
        info!(
            entity_type = %inference.entity_type,
            merged_id = %inference.merged_id,
            surviving_id = %inference.surviving_id,
            correlation_id = %inference.correlation_id,
            "Merge inferred"
        );
        Some(self.apply(inference).await)
    }

    async fn apply(&self, inference: MergeInference) -> MergeOutcome {
        let strategy = self.config.strategy;
        let mut relations_migrated = 0;
        let mut alias_recorded = false;

        if let Some(migrator) = &self.migrator {
            if strategy.migrates_relations() {
                relations_migrated = self.migrate(migrator.as_ref(), &inference).await;
            }
            if strategy.records_alias() {
                match migrator
                    .record_alias(&inference.entity_type, &inference.merged_id, &inference.surviving_id)
                    .await
                {
                    Ok(()) => alias_recorded = true,
                    Err(e) => warn!(merged_id = %inference.merged_id, error = %e, "Failed to record merge alias"),
                }
            }
        }

        crate::metrics::record_merge_inferred(&inference.entity_type, relations_migrated);
        let event = SyncEvent::RecordsMerged {
            entity_type: inference.entity_type.clone(),
            merged_id: inference.merged_id.clone(),
            surviving_id: inference.surviving_id.clone(),
            correlation_id: inference.correlation_id.clone(),
            strategy,
            relations_migrated,
        };
        emit_logged(self.sink.as_ref(), &event).await;

        MergeOutcome {
            inference,
            strategy,
            relations_migrated,
            alias_recorded,
        }
    }

    async fn migrate(&self, migrator: &dyn RelationMigrator, inference: &MergeInference) -> usize {
        let Some(link_field) = self
            .registry
            .get(&inference.entity_type)
            .and_then(|d| d.link_field())
        else {
            debug!(entity_type = %inference.entity_type, "No link field, nothing to migrate");
            return 0;
        };
        match migrator
            .migrate_relations(link_field, &inference.merged_id, &inference.surviving_id)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    entity_type = %inference.entity_type,
                    merged_id = %inference.merged_id,
                    error = %e,
                    "Relation migration failed"
                );
                0
            }
        }
    }
}
