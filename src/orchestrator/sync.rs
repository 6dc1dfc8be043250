// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use super::SyncOrchestrator;
use crate::error::SyncError;
use crate::record::{SyncOptions, SyncResult};

impl SyncOrchestrator {
    /// Fetch and process one entity type, page by page.
    ///
    /// Pages are processed as they arrive, so a scan that fails part-way
    /// keeps what it already stored: the counts are returned with the
    /// failure (or cancellation) in `error_message`. A failure before the
    /// first page is returned as an error. Remote elements without an id
    /// are counted in `errors`.
    #[instrument(skip(self, options), fields(entity_type = %options.entity_type(), mode = %options.fetch_mode()))]
    pub async fn sync(&self, options: &SyncOptions) -> Result<SyncResult, SyncError> {
        let started = Instant::now();
        let mut cursor = self.pages(options)?;
        let mut result = SyncResult::default();

        loop {
            match cursor.next_page().await {
                Ok(Some(page)) => result.absorb(self.process(&page, options).await),
                Ok(None) => break,
                Err(SyncError::Classified(e)) if cursor.progress().pages > 0 => {
                    let progress = cursor.progress();
                    warn!(
                        pages = progress.pages,
                        records = progress.records,
                        kind = e.kind.as_str(),
                        error = %e,
                        "Sync aborted mid-scan"
                    );
                    result.error_message = Some(format!("aborted after {} records: {e}", progress.records));
                    break;
                }
                Err(SyncError::Cancelled) if cursor.progress().pages > 0 => {
                    let progress = cursor.progress();
                    warn!(pages = progress.pages, records = progress.records, "Sync cancelled mid-scan");
                    result.error_message = Some(format!("cancelled after {} records", progress.records));
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Sync failed");
                    return Err(e);
                }
            }
        }

        let dropped = cursor.progress().dropped;
        if dropped > 0 {
            result.errors += dropped;
            result
                .error_message
                .get_or_insert_with(|| format!("{dropped} remote elements had no usable id"));
        }

        let elapsed = started.elapsed();
        crate::metrics::record_sync_duration(options.entity_type(), elapsed);
        info!(
            %result,
            pages = cursor.progress().pages,
            duration_ms = elapsed.as_millis() as u64,
            "Sync finished"
        );
        Ok(result)
    }

    /// Sync several entity types, up to `concurrency` at once.
    ///
    /// Every requested type gets an entry; a failed sync is reported through
    /// its `error_message`.
    pub async fn sync_many(&self, requests: &[SyncOptions]) -> BTreeMap<String, SyncResult> {
        stream::iter(requests)
            .map(|options| async move {
                let result = self.sync(options).await.unwrap_or_else(|e| SyncResult {
                    error_message: Some(e.to_string()),
                    ..SyncResult::default()
                });
                (options.entity_type().to_string(), result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{orchestrator, orchestrator_over, page_of, CancellingTransport, ScriptedTransport};
    use tokio_util::sync::CancellationToken;
    use super::*;
    use crate::events::EventOp;
    use crate::resilience::ErrorKind;
    use crate::transport::TransportError;

    #[tokio::test(start_paused = true)]
    async fn test_full_scan_then_rescan_skips_everything() {
        let transport = ScriptedTransport::paging(12);
        let (orch, store, sink) = orchestrator(transport);
        let options = SyncOptions::new("persons").with_full_scan(true).with_page_size(5);

        let first = orch.sync(&options).await.unwrap();
        assert_eq!(first.created, 12);
        assert_eq!(store.count("persons"), 12);
        assert_eq!(sink.count(EventOp::Created), 12);

        let second = orch.sync(&options).await.unwrap();
        assert_eq!((second.created, second.updated, second.skipped), (0, 0, 12));
        assert_eq!(sink.count(EventOp::Created), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_scan_failure_keeps_processed_pages() {
        let transport = ScriptedTransport::scripted(vec![
            Ok(page_of(0, 3)),
            Err(TransportError::status(401, "token expired")),
            Err(TransportError::status(401, "token expired")),
        ]);
        let (orch, store, _) = orchestrator(transport);

        let options = SyncOptions::new("deals").with_full_scan(true).with_page_size(3);
        let result = orch.sync(&options).await.unwrap();
        assert_eq!(result.created, 3);
        assert!(!result.is_success());
        assert!(result.error_message.unwrap().contains("auth"));
        assert_eq!(store.count("deals"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_scan_reports_stored_pages() {
        let cancel = CancellationToken::new();
        let transport = CancellingTransport::new(9, cancel.clone(), 1);
        let (orch, store, sink) = orchestrator_over(transport);
        let orch = orch.with_cancellation(cancel);

        let options = SyncOptions::new("deals").with_full_scan(true).with_page_size(3);
        let result = orch.sync(&options).await.unwrap();
        assert_eq!(result.created, 3);
        assert_eq!(result.error_message.as_deref(), Some("cancelled after 3 records"));
        assert_eq!(store.count("deals"), 3);
        assert_eq!(sink.count(EventOp::Created), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_page_is_an_error() {
        let cancel = CancellationToken::new();
        let (orch, _, _) = orchestrator_over(CancellingTransport::new(9, cancel.clone(), 0));
        let orch = orch.with_cancellation(cancel.clone());
        cancel.cancel();

        let err = orch.sync(&SyncOptions::new("deals").with_full_scan(true)).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_on_first_page_is_an_error() {
        let transport = ScriptedTransport::scripted(vec![
            Err(TransportError::status(402, "payment required")),
            Err(TransportError::status(402, "payment required")),
        ]);
        let (orch, _, _) = orchestrator(transport.clone());

        let err = orch.sync(&SyncOptions::new("deals")).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Quota));
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_many_reports_every_type() {
        let (orch, _, _) = orchestrator(ScriptedTransport::paging(4));
        let requests = vec![
            SyncOptions::new("deals").with_full_scan(true),
            SyncOptions::new("persons").with_full_scan(true),
            SyncOptions::new("widgets"),
        ];

        let results = orch.sync_many(&requests).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results["deals"].created, 4);
        assert_eq!(results["persons"].created, 4);
        assert!(results["widgets"].error_message.as_deref().unwrap().contains("widgets"));
    }
}
