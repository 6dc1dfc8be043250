// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Applies inbound webhook notifications.
//!
//! Deletions remove the local record and emit `deleted`. Every notification,
//! whatever its action, is also offered to the [`MergeDetector`]. Creates and
//! updates carry no payload the engine maps, so picking them up is left to
//! the next sync.

use std::sync::Arc;

use tracing::debug;

use crate::error::SyncError;
use crate::events::{emit_logged, EventSink, SyncEvent};
use crate::merge::{MergeDetector, MergeOutcome, WebhookAction, WebhookEvent};
use crate::store::LocalStore;

/// What handling one notification did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookOutcome {
    /// A local record was removed
    pub deleted: bool,
    pub merge: Option<MergeOutcome>,
}

pub struct WebhookRouter {
    store: Arc<dyn LocalStore>,
    sink: Arc<dyn EventSink>,
    detector: Arc<MergeDetector>,
}

impl WebhookRouter {
    pub fn new(store: Arc<dyn LocalStore>, sink: Arc<dyn EventSink>, detector: Arc<MergeDetector>) -> Self {
        Self { store, sink, detector }
    }

    #[must_use]
    pub fn detector(&self) -> &Arc<MergeDetector> {
        &self.detector
    }

    pub async fn handle(&self, event: &WebhookEvent) -> Result<WebhookOutcome, SyncError> {
        crate::metrics::record_webhook(&event.entity_type, event.action.as_str());
        debug!(
            entity_type = %event.entity_type,
            remote_id = %event.entity_id,
            action = event.action.as_str(),
            correlation_id = event.correlation_id.as_deref().unwrap_or_default(),
            "Webhook received"
        );

        let mut outcome = WebhookOutcome::default();
        if event.action == WebhookAction::Delete {
            outcome.deleted = self.store.delete(&event.entity_type, &event.entity_id).await?;
            if outcome.deleted {
                let deleted = SyncEvent::RecordDeleted {
                    entity_type: event.entity_type.clone(),
                    remote_id: event.entity_id.clone(),
                };
                emit_logged(self.sink.as_ref(), &deleted).await;
            }
        }

        outcome.merge = self.detector.observe(event).await;
        Ok(outcome)
    }

    /// Decode a JSON notification and handle it.
    pub async fn handle_json(&self, body: &str) -> Result<WebhookOutcome, SyncError> {
        let event: WebhookEvent = serde_json::from_str(body)
            .map_err(|e| SyncError::Event(crate::events::EventError::Serialize(e)))?;
        self.handle(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeConfig;
    use crate::events::{EventOp, RecordingEventSink};
    use crate::store::InMemoryRecordStore;
    use serde_json::{json, Map};

    fn router() -> (WebhookRouter, Arc<InMemoryRecordStore>, Arc<RecordingEventSink>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let sink = Arc::new(RecordingEventSink::new());
        let detector = Arc::new(MergeDetector::new(MergeConfig::default(), sink.clone()).with_migrator(store.clone()));
        (WebhookRouter::new(store.clone(), sink.clone(), detector), store, sink)
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_emits() {
        let (router, store, sink) = router();
        store.upsert("deals", "7", &Map::new()).await.unwrap();

        let outcome = router.handle(&WebhookEvent::new(WebhookAction::Delete, "deals", "7")).await.unwrap();
        assert!(outcome.deleted);
        assert!(outcome.merge.is_none());
        assert!(store.is_empty());
        assert_eq!(sink.count(EventOp::Deleted), 1);

        // Unknown record: nothing to delete, no event
        let outcome = router.handle(&WebhookEvent::new(WebhookAction::Delete, "deals", "8")).await.unwrap();
        assert!(!outcome.deleted);
        assert_eq!(sink.count(EventOp::Deleted), 1);
    }

    #[tokio::test]
    async fn test_merge_pattern_through_router() {
        let (router, store, sink) = router();
        store.upsert("deals", "7", &Map::new()).await.unwrap();
        store
            .upsert("activities", "a1", &json!({"deal_id": 7}).as_object().cloned().unwrap())
            .await
            .unwrap();

        let update = WebhookEvent::new(WebhookAction::Update, "deals", "5").with_correlation_id("r1");
        let delete = WebhookEvent::new(WebhookAction::Delete, "deals", "7").with_correlation_id("r1");
        assert!(router.handle(&update).await.unwrap().merge.is_none());
        let outcome = router.handle(&delete).await.unwrap();

        assert!(outcome.deleted);
        let merge = outcome.merge.unwrap();
        assert_eq!(merge.inference.surviving_id, "5");
        assert_eq!(merge.relations_migrated, 1);
        assert_eq!(sink.count(EventOp::Merged), 1);
    }

    #[tokio::test]
    async fn test_handle_json() {
        let (router, _, _) = router();
        let body = r#"{"action":"updated","entity_type":"persons","entity_id":"3","correlation_id":"x"}"#;
        let outcome = router.handle_json(body).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::default());
        assert_eq!(router.detector().window().pending("x"), 1);

        assert!(matches!(router.handle_json("not json").await, Err(SyncError::Event(_))));
    }
}
