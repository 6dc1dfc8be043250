// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Time-boxed grouping of webhook events by correlation id.
//!
//! Each group lives for `window` from its first event. Reads and writes for
//! one correlation id go through a single map entry, so two handlers
//! observing the same id at once cannot lose each other's events.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{MergeInference, WebhookAction, WebhookEvent};

#[derive(Debug, Clone)]
struct Seen {
    entity_type: String,
    entity_id: String,
    action: WebhookAction,
}

#[derive(Debug)]
struct Group {
    opened_at: Instant,
    events: Vec<Seen>,
}

impl Group {
    fn new(now: Instant) -> Self {
        Self {
            opened_at: now,
            events: Vec::new(),
        }
    }

    fn expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.opened_at) >= window
    }

    /// Look for "one deleted id + updated siblings" within `entity_type`.
    fn detect(&self, entity_type: &str, correlation_id: &str) -> Option<MergeInference> {
        // Distinct ids in first-seen order with the actions seen for each
        let mut ids: Vec<(&str, Vec<WebhookAction>)> = Vec::new();
        for seen in self.events.iter().filter(|s| s.entity_type == entity_type) {
            match ids.iter_mut().find(|(id, _)| *id == seen.entity_id) {
                Some((_, actions)) if !actions.contains(&seen.action) => actions.push(seen.action),
                Some(_) => {}
                None => ids.push((seen.entity_id.as_str(), vec![seen.action])),
            }
        }

        let mut deleted = ids.iter().filter(|(_, a)| a.contains(&WebhookAction::Delete));
        let merged_id = deleted.next()?.0;
        if deleted.next().is_some() {
            return None;
        }
        let surviving_id = ids
            .iter()
            .find(|(id, a)| *id != merged_id && a.contains(&WebhookAction::Update) && !a.contains(&WebhookAction::Delete))?
            .0;

        Some(MergeInference {
            entity_type: entity_type.to_string(),
            merged_id: merged_id.to_string(),
            surviving_id: surviving_id.to_string(),
            correlation_id: correlation_id.to_string(),
        })
    }
}

pub struct CorrelationWindow {
    groups: DashMap<String, Group>,
    window: Duration,
}

impl CorrelationWindow {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            window,
        }
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Add an event to its group and check the group for a merge.
    ///
    /// A group that produced an inference is discarded. Events without a
    /// correlation id are ignored.
    pub fn observe(&self, event: &WebhookEvent) -> Option<MergeInference> {
        let correlation_id = event.correlation_id.as_deref().filter(|c| !c.is_empty())?;
        let now = Instant::now();
        let seen = Seen {
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            action: event.action,
        };

        match self.groups.entry(correlation_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let group = occupied.get_mut();
                if group.expired(now, self.window) {
                    *group = Group::new(now);
                }
                group.events.push(seen);
                let inference = group.detect(&event.entity_type, correlation_id);
                if inference.is_some() {
                    occupied.remove();
                }
                inference
            }
            Entry::Vacant(vacant) => {
                let mut group = Group::new(now);
                group.events.push(seen);
                // A lone event never matches
                vacant.insert(group);
                None
            }
        }
    }

    /// Drop expired groups. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.groups.len();
        self.groups.retain(|_, group| !group.expired(now, self.window));
        before.saturating_sub(self.groups.len())
    }

    /// Open groups, expired ones included until purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Events held for a correlation id.
    #[must_use]
    pub fn pending(&self, correlation_id: &str) -> usize {
        self.groups.get(correlation_id).map_or(0, |g| g.events.len())
    }

    pub fn clear(&self) {
        self.groups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(cid: &str, action: WebhookAction, entity_type: &str, id: &str) -> WebhookEvent {
        WebhookEvent::new(action, entity_type, id).with_correlation_id(cid)
    }

    #[test]
    fn test_update_update_delete_infers_once() {
        let window = CorrelationWindow::new(Duration::from_secs(30));
        assert!(window.observe(&event("c1", WebhookAction::Update, "deals", "5")).is_none());
        assert!(window.observe(&event("c1", WebhookAction::Update, "deals", "5")).is_none());
        let inference = window.observe(&event("c1", WebhookAction::Delete, "deals", "7")).unwrap();

        assert_eq!(inference.merged_id, "7");
        assert_eq!(inference.surviving_id, "5");
        assert_eq!(inference.correlation_id, "c1");
        assert!(window.is_empty(), "group discarded after inference");
    }

    #[test]
    fn test_delete_first_then_update() {
        let window = CorrelationWindow::new(Duration::from_secs(30));
        window.observe(&event("c", WebhookAction::Delete, "persons", "7"));
        let inference = window.observe(&event("c", WebhookAction::Update, "persons", "5")).unwrap();
        assert_eq!((inference.merged_id.as_str(), inference.surviving_id.as_str()), ("7", "5"));
    }

    #[test]
    fn test_first_seen_survivor_wins() {
        let window = CorrelationWindow::new(Duration::from_secs(30));
        window.observe(&event("c", WebhookAction::Update, "deals", "3"));
        window.observe(&event("c", WebhookAction::Update, "deals", "4"));
        let inference = window.observe(&event("c", WebhookAction::Delete, "deals", "9")).unwrap();
        assert_eq!(inference.surviving_id, "3");
    }

    #[test]
    fn test_split_correlation_ids_never_match() {
        let window = CorrelationWindow::new(Duration::from_secs(30));
        window.observe(&event("a", WebhookAction::Update, "deals", "5"));
        window.observe(&event("a", WebhookAction::Update, "deals", "5"));
        assert!(window.observe(&event("b", WebhookAction::Delete, "deals", "7")).is_none());
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_types_are_partitioned() {
        let window = CorrelationWindow::new(Duration::from_secs(30));
        window.observe(&event("c", WebhookAction::Update, "persons", "5"));
        assert!(window.observe(&event("c", WebhookAction::Delete, "deals", "7")).is_none());
    }

    #[test]
    fn test_two_deletes_or_added_only_do_not_match() {
        let window = CorrelationWindow::new(Duration::from_secs(30));
        window.observe(&event("c", WebhookAction::Delete, "deals", "1"));
        window.observe(&event("c", WebhookAction::Delete, "deals", "2"));
        assert!(window.observe(&event("c", WebhookAction::Update, "deals", "3")).is_none());

        window.observe(&event("d", WebhookAction::Add, "deals", "5"));
        assert!(window.observe(&event("d", WebhookAction::Delete, "deals", "7")).is_none());
    }

    #[test]
    fn test_uncorrelated_events_are_ignored() {
        let window = CorrelationWindow::new(Duration::from_secs(30));
        assert!(window.observe(&WebhookEvent::new(WebhookAction::Delete, "deals", "7")).is_none());
        assert!(window.observe(&event("", WebhookAction::Delete, "deals", "7")).is_none());
        assert!(window.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_expire_after_window() {
        let window = CorrelationWindow::new(Duration::from_secs(30));
        window.observe(&event("c", WebhookAction::Update, "deals", "5"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(window.observe(&event("c", WebhookAction::Delete, "deals", "7")).is_none());
        assert_eq!(window.pending("c"), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(window.purge_expired(), 1);
        assert!(window.is_empty());
    }
}
