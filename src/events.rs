// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change notifications emitted by the engine.
//!
//! The engine calls [`EventSink::emit`] for every created, updated, deleted
//! or merged record. Delivery guarantees belong to the sink; a failing sink
//! is logged and never fails a sync.
//!
//! # Redis stream format
//!
//! ```text
//! XADD {prefix}:events MAXLEN ~ 100000 *
//!   event        "deals.updated"
//!   entity_type  "deals"
//!   remote_id    "42"
//!   payload      '{"event":"record_updated","entity_type":"deals","remote_id":"42","version":3}'
//!   event_id     "5f0c…"   (uuid v4)
//!   emitted_at   "2026-01-05T10:00:00+00:00"
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::cmd;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::merge::MigrationStrategy;
use crate::resilience::retry::{retry, RetryConfig};

/// Stream key suffix (appended to the key prefix).
pub const EVENT_STREAM_SUFFIX: &str = "events";

/// Default approximate stream length cap.
pub const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Event backend error: {0}")]
    Backend(String),
}

/// Record operation carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    Created,
    Updated,
    Deleted,
    Merged,
}

impl EventOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOp::Created => "created",
            EventOp::Updated => "updated",
            EventOp::Deleted => "deleted",
            EventOp::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    RecordCreated {
        entity_type: String,
        remote_id: String,
        version: u64,
    },
    RecordUpdated {
        entity_type: String,
        remote_id: String,
        version: u64,
    },
    RecordDeleted {
        entity_type: String,
        remote_id: String,
    },
    RecordsMerged {
        entity_type: String,
        merged_id: String,
        surviving_id: String,
        correlation_id: String,
        strategy: MigrationStrategy,
        relations_migrated: usize,
    },
}

impl SyncEvent {
    #[must_use]
    pub fn op(&self) -> EventOp {
        match self {
            Self::RecordCreated { .. } => EventOp::Created,
            Self::RecordUpdated { .. } => EventOp::Updated,
            Self::RecordDeleted { .. } => EventOp::Deleted,
            Self::RecordsMerged { .. } => EventOp::Merged,
        }
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        match self {
            Self::RecordCreated { entity_type, .. }
            | Self::RecordUpdated { entity_type, .. }
            | Self::RecordDeleted { entity_type, .. }
            | Self::RecordsMerged { entity_type, .. } => entity_type,
        }
    }

    /// Id of the record the event is about (the surviving one for merges).
    #[must_use]
    pub fn remote_id(&self) -> &str {
        match self {
            Self::RecordCreated { remote_id, .. }
            | Self::RecordUpdated { remote_id, .. }
            | Self::RecordDeleted { remote_id, .. } => remote_id,
            Self::RecordsMerged { surviving_id, .. } => surviving_id,
        }
    }

    /// `<entity_type>.<op>`, e.g. `deals.created`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.entity_type(), self.op().as_str())
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &SyncEvent) -> Result<(), EventError>;
}

/// Emit to a sink, logging and counting failures instead of propagating them.
pub async fn emit_logged(sink: &dyn EventSink, event: &SyncEvent) -> bool {
    let name = event.name();
    match sink.emit(event).await {
        Ok(()) => {
            crate::metrics::record_event(&name, true);
            true
        }
        Err(e) => {
            crate::metrics::record_event(&name, false);
            tracing::warn!(event = %name, remote_id = %event.remote_id(), error = %e, "Event sink failed");
            false
        }
    }
}

/// In-process fan-out over a tokio broadcast channel.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastEventSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: &SyncEvent) -> Result<(), EventError> {
        // No subscribers is not a failure
        if self.sender.send(event.clone()).is_err() {
            debug!(event = %event.name(), "No event subscribers");
        }
        Ok(())
    }
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: &SyncEvent) -> Result<(), EventError> {
        info!(event = %event.name(), remote_id = %event.remote_id(), "Sync event");
        Ok(())
    }
}

/// Keeps every event in memory. Handy for tests and dry runs.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Number of events with the given op.
    #[must_use]
    pub fn count(&self, op: EventOp) -> usize {
        self.events.lock().iter().filter(|e| e.op() == op).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, event: &SyncEvent) -> Result<(), EventError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Emits to several sinks. Every sink is tried; the first error is returned.
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl EventSink for FanoutEventSink {
    async fn emit(&self, event: &SyncEvent) -> Result<(), EventError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Appends events to a Redis stream for external consumers.
pub struct RedisStreamEventSink {
    connection: ConnectionManager,
    stream_key: String,
    max_len: usize,
}

impl RedisStreamEventSink {
    /// Stream `<key_prefix>:events`, capped at about [`DEFAULT_STREAM_MAX_LEN`] entries.
    #[must_use]
    pub fn new(connection: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            connection,
            stream_key: stream_key(key_prefix),
            max_len: DEFAULT_STREAM_MAX_LEN,
        }
    }

    #[must_use]
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    #[must_use]
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }
}

/// `<prefix>:events`, or just `events` without a prefix.
#[must_use]
pub fn stream_key(key_prefix: &str) -> String {
    if key_prefix.is_empty() {
        EVENT_STREAM_SUFFIX.to_string()
    } else {
        format!("{}:{}", key_prefix.trim_end_matches(':'), EVENT_STREAM_SUFFIX)
    }
}

/// XADD field-value pairs for one event.
///
/// `event_id` is fresh per emit so consumers can drop redelivered entries.
pub fn to_stream_fields(event: &SyncEvent) -> Result<Vec<(&'static str, String)>, EventError> {
    Ok(vec![
        ("event", event.name()),
        ("entity_type", event.entity_type().to_string()),
        ("remote_id", event.remote_id().to_string()),
        ("payload", serde_json::to_string(event)?),
        ("event_id", Uuid::new_v4().to_string()),
        ("emitted_at", Utc::now().to_rfc3339()),
    ])
}

#[async_trait]
impl EventSink for RedisStreamEventSink {
    async fn emit(&self, event: &SyncEvent) -> Result<(), EventError> {
        let fields = to_stream_fields(event)?;
        let mut xadd = cmd("XADD");
        xadd.arg(&self.stream_key).arg("MAXLEN").arg("~").arg(self.max_len).arg("*");
        for (field, value) in &fields {
            xadd.arg(*field).arg(value);
        }
        let _: String = retry("redis_stream_xadd", &RetryConfig::query(), || {
            let mut conn = self.connection.clone();
            let xadd = xadd.clone();
            async move { xadd.query_async::<_, String>(&mut conn).await }
        })
        .await
        .map_err(|e: redis::RedisError| EventError::Backend(e.to_string()))?;
        Ok(())
    }
}
