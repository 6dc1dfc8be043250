// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Paginated fetch with admission, circuit checks and classified retries.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::types::PageProgress;
use super::SyncOrchestrator;
use crate::error::SyncError;
use crate::metrics::LatencyTimer;
use crate::record::{RemoteRecord, SyncOptions};
use crate::registry::EntityDescriptor;
use crate::resilience::{ClassifiedError, ErrorClassifier, ErrorKind};
use crate::transport::{ApiResponse, CallOptions, SortOrder};

/// Walks the pages of one entity type.
///
/// Full scans go oldest first and advance the offset by each page's length
/// until a short page, the page cap, or critical memory. Latest-modification
/// fetches read one newest-first page.
pub struct PageCursor<'a> {
    orchestrator: &'a SyncOrchestrator,
    descriptor: EntityDescriptor,
    options: SyncOptions,
    progress: PageProgress,
}

impl<'a> PageCursor<'a> {
    #[must_use]
    pub fn progress(&self) -> PageProgress {
        self.progress
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        self.descriptor.entity_type()
    }

    fn page_limit(&self) -> usize {
        let batch = self.orchestrator.memory.adaptive_batch_size();
        self.options
            .page_size()
            .min(batch)
            .min(self.orchestrator.pagination.page_size_cap)
            .max(1)
    }

    /// Fetch the next page. `Ok(None)` once the walk is finished.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RemoteRecord>>, SyncError> {
        if self.progress.done {
            return Ok(None);
        }
        self.orchestrator.check_cancelled()?;

        let full_scan = self.options.full_scan();
        let entity_type = self.descriptor.entity_type().to_string();
        if full_scan && self.progress.pages >= self.orchestrator.pagination.max_pages {
            warn!(
                entity_type = %entity_type,
                pages = self.progress.pages,
                records = self.progress.records,
                "Full scan hit the page cap, stopping"
            );
            self.progress.done = true;
            return Ok(None);
        }

        if let Err(e) = self.orchestrator.memory.check_threshold(&entity_type, self.progress.records) {
            self.progress.done = true;
            return Err(e.into());
        }

        let limit = self.page_limit();
        let call = CallOptions {
            limit,
            sort: if full_scan { SortOrder::OldestFirst } else { SortOrder::NewestFirst },
            start: self.progress.offset,
        };
        let response = match self.orchestrator.fetch_page(&self.descriptor, call).await {
            Ok(response) => response,
            Err(e) => {
                self.progress.done = true;
                return Err(e);
            }
        };

        // The offset and the end of the scan follow what the remote sent,
        // so elements dropped during decoding do not end the scan early.
        let page_len = response.page_len.max(response.data.len());
        let dropped = response.dropped();
        if dropped > 0 {
            warn!(
                entity_type = %entity_type,
                offset = self.progress.offset,
                dropped,
                "Remote page contained elements without an id"
            );
            crate::metrics::record_records(&entity_type, "invalid", dropped);
        }
        let records = response.data;

        self.orchestrator.memory.on_page_fetched();
        crate::metrics::record_page_size(&entity_type, page_len);
        self.progress.pages += 1;
        self.progress.records += records.len();
        self.progress.dropped += dropped;
        self.progress.offset += page_len;
        if !full_scan || page_len < limit {
            self.progress.done = true;
        }

        debug!(
            entity_type = %entity_type,
            page = self.progress.pages,
            count = records.len(),
            page_len,
            limit,
            next_offset = self.progress.offset,
            "Fetched page"
        );
        Ok(Some(records))
    }
}

impl SyncOrchestrator {
    /// Start a page walk for `options`.
    pub fn pages(&self, options: &SyncOptions) -> Result<PageCursor<'_>, SyncError> {
        let descriptor = self.descriptor(options.entity_type())?.clone();
        Ok(PageCursor {
            orchestrator: self,
            descriptor,
            options: options.clone(),
            progress: PageProgress::default(),
        })
    }

    /// Fetch every record `options` selects.
    ///
    /// A failure after at least one page returns [`SyncError::PartialFetch`]
    /// carrying the records already fetched; a cancellation at that point
    /// returns [`SyncError::CancelledPartial`].
    #[instrument(skip(self, options), fields(entity_type = %options.entity_type(), mode = %options.fetch_mode()))]
    pub async fn fetch(&self, options: &SyncOptions) -> Result<Vec<RemoteRecord>, SyncError> {
        let mut cursor = self.pages(options)?;
        let mut records = Vec::new();
        loop {
            match cursor.next_page().await {
                Ok(Some(page)) => records.extend(page),
                Ok(None) => break,
                Err(SyncError::Classified(source)) if !records.is_empty() => {
                    warn!(
                        records = records.len(),
                        pages = cursor.progress().pages,
                        error = %source,
                        "Fetch aborted, keeping partial results"
                    );
                    return Err(SyncError::PartialFetch { source, records });
                }
                Err(SyncError::Cancelled) if !records.is_empty() => {
                    warn!(records = records.len(), pages = cursor.progress().pages, "Fetch cancelled");
                    return Err(SyncError::CancelledPartial { records });
                }
                Err(e) => return Err(e),
            }
        }
        info!(records = records.len(), pages = cursor.progress().pages, "Fetch complete");
        Ok(records)
    }

    /// One page, retried per the classifier until it succeeds or gives up.
    pub(super) async fn fetch_page(
        &self,
        descriptor: &EntityDescriptor,
        call: CallOptions,
    ) -> Result<ApiResponse, SyncError> {
        let entity_type = descriptor.entity_type();
        let endpoint = descriptor.endpoint();
        let cost = self.rate_limiter.cost(endpoint);
        let start = call.start.to_string();
        let mut attempt: u32 = 0;

        loop {
            self.check_cancelled()?;

            if let Some(kind) = self.classifier.breaker().first_open(&ErrorKind::UPSTREAM).await {
                crate::metrics::record_remote_call(entity_type, "rejected");
                return Err(ClassifiedError::circuit_open(kind)
                    .with_context("entity_type", entity_type)
                    .into());
            }

            if !self.rate_limiter.can_admit(endpoint, cost).await {
                let budget = self.rate_limiter.budget().await;
                return Err(ClassifiedError::budget_exhausted(endpoint, budget.used, budget.daily_limit)
                    .with_context("entity_type", entity_type)
                    .into());
            }

            let outcome = {
                let _timer = LatencyTimer::new(entity_type);
                descriptor
                    .fetch_page(Arc::clone(&self.transport), call)
                    .await
                    .and_then(ApiResponse::into_result)
            };

            match outcome {
                Ok(response) => {
                    crate::metrics::record_remote_call(entity_type, "success");
                    self.rate_limiter.consume(endpoint, cost).await;
                    for kind in ErrorKind::UPSTREAM {
                        self.classifier.record_success(kind).await;
                    }
                    if let Some(wait) = self
                        .rate_limiter
                        .handle_rate_limit_response(&response.rate_limit_headers())
                        .await
                    {
                        self.pause(wait).await?;
                    }
                    return Ok(response);
                }
                Err(raw) => {
                    crate::metrics::record_remote_call(entity_type, "error");
                    let attempt_label = attempt.to_string();
                    let error = ErrorClassifier::classify(
                        &raw,
                        &[
                            ("entity_type", entity_type),
                            ("endpoint", endpoint),
                            ("start", start.as_str()),
                            ("attempt", attempt_label.as_str()),
                        ],
                    );
                    self.classifier.record_failure(&error).await;

                    if !self.classifier.should_retry(&error, attempt).await {
                        warn!(
                            entity_type,
                            kind = error.kind.as_str(),
                            attempt,
                            error = %error,
                            "Remote call failed, not retrying"
                        );
                        return Err(error.into());
                    }

                    attempt += 1;
                    let delay = self.retry_delay(&error, attempt);
                    crate::metrics::record_retry(error.kind.as_str());
                    warn!(
                        entity_type,
                        kind = error.kind.as_str(),
                        attempt,
                        max_retries = error.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Remote call failed, retrying"
                    );
                    self.pause(delay).await?;
                }
            }
        }
    }

    /// Rate limits follow the remote hint when there is one.
    fn retry_delay(&self, error: &ClassifiedError, attempt: u32) -> Duration {
        if error.kind == ErrorKind::RateLimit {
            self.rate_limiter
                .wait_delay(attempt, error.remote_retry_after.map(Duration::from_secs))
        } else {
            self.classifier.retry_delay(error, attempt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{orchestrator, orchestrator_over, page_of, CancellingTransport, ScriptedTransport};
    use super::*;
    use crate::transport::TransportError;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn test_full_scan_walks_until_short_page() {
        let transport = ScriptedTransport::paging(7);
        let (orch, _, _) = orchestrator(transport.clone());

        let options = SyncOptions::new("deals").with_full_scan(true).with_page_size(3);
        let records = orch.fetch(&options).await.unwrap();

        assert_eq!(records.len(), 7);
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.iter().map(|c| c.start).collect::<Vec<_>>(), vec![0, 3, 6]);
        assert!(calls.iter().all(|c| c.sort == SortOrder::OldestFirst && c.limit == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_needs_one_empty_page() {
        let transport = ScriptedTransport::paging(6);
        let (orch, _, _) = orchestrator(transport.clone());

        let options = SyncOptions::new("deals").with_full_scan(true).with_page_size(3);
        assert_eq!(orch.fetch(&options).await.unwrap().len(), 6);
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_mode_reads_one_newest_page() {
        let transport = ScriptedTransport::paging(50);
        let (orch, _, _) = orchestrator(transport.clone());

        let records = orch.fetch(&SyncOptions::new("deals").with_page_size(10)).await.unwrap();
        assert_eq!(records.len(), 10);
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].sort, SortOrder::NewestFirst);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_cap_stops_scan() {
        let transport = ScriptedTransport::paging(100);
        let (orch, _, _) = orchestrator(transport.clone());
        let mut orch = orch;
        orch.pagination.max_pages = 2;

        let options = SyncOptions::new("deals").with_full_scan(true).with_page_size(5);
        assert_eq!(orch.fetch(&options).await.unwrap().len(), 10);
        assert_eq!(transport.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_is_retried_then_succeeds() {
        let transport = ScriptedTransport::scripted(vec![
            Err(TransportError::status(502, "bad gateway")),
            Ok(page_of(0, 2)),
        ]);
        let (orch, _, _) = orchestrator(transport.clone());

        let records = orch.fetch(&SyncOptions::new("deals")).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(transport.calls().len(), 2);
        assert_eq!(orch.classifier().breaker().failure_count(ErrorKind::Server).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let transport = ScriptedTransport::scripted(vec![Err(TransportError::status(404, "no such endpoint"))]);
        let (orch, _, _) = orchestrator(transport.clone());

        let err = orch.fetch(&SyncOptions::new("deals")).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NotFound));
        assert!(err.classified().unwrap().suggestion.is_some());
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_mid_scan_keeps_partial_records() {
        let transport = ScriptedTransport::scripted(vec![
            Ok(page_of(0, 2)),
            Err(TransportError::status(403, "forbidden")),
        ]);
        let (orch, _, _) = orchestrator(transport);

        let options = SyncOptions::new("deals").with_full_scan(true).with_page_size(2);
        let err = orch.fetch(&options).await.unwrap_err();
        assert!(matches!(err, SyncError::PartialFetch { .. }));
        assert_eq!(err.partial_records().len(), 2);
        assert_eq!(err.kind(), Some(ErrorKind::Auth));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_blocks_call() {
        let transport = ScriptedTransport::paging(5);
        let (orch, _, _) = orchestrator(transport.clone());
        let limit = orch.rate_limiter().config().daily_limit;
        orch.rate_limiter().consume("deals", limit).await;

        let err = orch.fetch(&SyncOptions::new("deals")).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::RateLimit));
        assert!(!err.classified().unwrap().retryable);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_call_charges_endpoint_cost() {
        let transport = ScriptedTransport::paging(1);
        let (orch, _, _) = orchestrator(transport);

        orch.fetch(&SyncOptions::new("files")).await.unwrap();
        assert_eq!(orch.rate_limiter().budget().await.used, orch.rate_limiter().cost("files"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_entity_type() {
        let (orch, _, _) = orchestrator(ScriptedTransport::paging(1));
        let err = orch.fetch(&SyncOptions::new("widgets")).await.unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedEntity(t) if t == "widgets"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_sleep() {
        let transport = ScriptedTransport::scripted(vec![Err(TransportError::status(503, "unavailable"))]);
        let (orch, _, _) = orchestrator(transport);
        let orch = Arc::new(orch);

        let task = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.fetch(&SyncOptions::new("deals")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        orch.cancel();

        assert!(matches!(task.await.unwrap(), Err(SyncError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_scan_keeps_fetched_records() {
        let cancel = CancellationToken::new();
        let transport = CancellingTransport::new(9, cancel.clone(), 1);
        let (orch, _, _) = orchestrator_over(transport.clone());
        let orch = orch.with_cancellation(cancel);

        let options = SyncOptions::new("deals").with_full_scan(true).with_page_size(3);
        let err = orch.fetch(&options).await.unwrap_err();
        assert!(matches!(err, SyncError::CancelledPartial { .. }));
        assert!(err.is_cancelled());
        assert_eq!(err.partial_records().len(), 3);
        assert_eq!(transport.calls(), 1);
    }

    /// Wraps every page in a raw body where the second element has no id.
    struct NullIdRows {
        dataset: usize,
    }

    #[async_trait::async_trait]
    impl crate::transport::RemoteTransport for NullIdRows {
        async fn call(&self, _endpoint: &str, options: &CallOptions) -> Result<ApiResponse, TransportError> {
            let end = (options.start + options.limit).min(self.dataset);
            let rows: Vec<_> = (options.start..end)
                .map(|i| if i == 1 { json!({"id": null}) } else { json!({"id": i}) })
                .collect();
            Ok(ApiResponse::from_json(200, json!({"success": true, "data": rows}), HashMap::new()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_element_without_id_does_not_end_scan() {
        let (orch, _, _) = orchestrator_over(std::sync::Arc::new(NullIdRows { dataset: 9 }));

        let options = SyncOptions::new("deals").with_full_scan(true).with_page_size(3);
        let mut cursor = orch.pages(&options).unwrap();
        let mut records = Vec::new();
        while let Some(page) = cursor.next_page().await.unwrap() {
            records.extend(page);
        }

        assert_eq!(records.len(), 8);
        assert!(records.iter().all(|r| r.id != "1"));
        let progress = cursor.progress();
        assert_eq!(progress.offset, 9);
        assert_eq!(progress.dropped, 1);
        assert_eq!(progress.pages, 4);
    }
}
