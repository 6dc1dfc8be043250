// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Crate-level error.

use thiserror::Error;

use crate::counters::CounterError;
use crate::events::EventError;
use crate::record::RemoteRecord;
use crate::resilience::classifier::{ClassifiedError, ErrorKind};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote failure that was not (or no longer) retried.
    #[error(transparent)]
    Classified(#[from] ClassifiedError),

    /// A scan stopped mid-way; `records` holds the pages fetched before it.
    #[error("fetch aborted after {} records: {source}", .records.len())]
    PartialFetch {
        source: ClassifiedError,
        records: Vec<RemoteRecord>,
    },

    #[error("Unsupported entity type '{0}'")]
    UnsupportedEntity(String),

    #[error("Sync cancelled")]
    Cancelled,

    /// Cancelled mid-scan; `records` holds the pages fetched before it.
    #[error("fetch cancelled after {} records", .records.len())]
    CancelledPartial { records: Vec<RemoteRecord> },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Counter(#[from] CounterError),

    #[error(transparent)]
    Event(#[from] EventError),
}

impl SyncError {
    /// The classified cause, for remote failures.
    #[must_use]
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            Self::Classified(e) | Self::PartialFetch { source: e, .. } => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        self.classified().map(|e| e.kind)
    }

    /// Records already fetched when the failure happened.
    #[must_use]
    pub fn partial_records(&self) -> &[RemoteRecord] {
        match self {
            Self::PartialFetch { records, .. } | Self::CancelledPartial { records } => records,
            _ => &[],
        }
    }

    /// Whether the sync stopped because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::CancelledPartial { .. })
    }

    /// Split into (records kept, error), for callers that want to salvage a scan.
    #[must_use]
    pub fn into_partial(self) -> (Vec<RemoteRecord>, SyncError) {
        match self {
            Self::PartialFetch { source, records } => (records, Self::Classified(source)),
            Self::CancelledPartial { records } => (records, Self::Cancelled),
            other => (Vec::new(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_fetch_keeps_records() {
        let record = RemoteRecord::from_value(json!({"id": 1})).unwrap();
        let err = SyncError::PartialFetch {
            source: ClassifiedError::new(ErrorKind::Server, "bad gateway"),
            records: vec![record],
        };
        assert_eq!(err.kind(), Some(ErrorKind::Server));
        assert_eq!(err.partial_records().len(), 1);
        assert_eq!(err.to_string(), "fetch aborted after 1 records: server error: bad gateway");

        let (records, cause) = err.into_partial();
        assert_eq!(records.len(), 1);
        assert!(matches!(cause, SyncError::Classified(_)));
    }

    #[test]
    fn test_cancelled_partial_keeps_records() {
        let record = RemoteRecord::from_value(json!({"id": 7})).unwrap();
        let err = SyncError::CancelledPartial { records: vec![record] };
        assert!(err.is_cancelled());
        assert_eq!(err.kind(), None);
        assert_eq!(err.partial_records().len(), 1);
        assert_eq!(err.to_string(), "fetch cancelled after 1 records");

        let (records, cause) = err.into_partial();
        assert_eq!(records.len(), 1);
        assert!(matches!(cause, SyncError::Cancelled));
    }

    #[test]
    fn test_non_remote_errors_have_no_kind() {
        assert_eq!(SyncError::Cancelled.kind(), None);
        assert!(SyncError::UnsupportedEntity("x".into()).partial_records().is_empty());
        assert_eq!(SyncError::Config("bad".into()).to_string(), "Invalid configuration: bad");
    }
}
