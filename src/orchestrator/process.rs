// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use tracing::{debug, trace, warn};

use super::types::RecordOutcome;
use super::SyncOrchestrator;
use crate::error::SyncError;
use crate::events::{emit_logged, SyncEvent};
use crate::record::{RemoteRecord, SyncOptions, SyncResult};

impl SyncOrchestrator {
    /// Upsert fetched records into the local store.
    ///
    /// A record that fails is counted and logged; the rest of the batch
    /// carries on.
    pub async fn process(&self, records: &[RemoteRecord], options: &SyncOptions) -> SyncResult {
        let entity_type = options.entity_type();
        let mut result = SyncResult::default();

        for record in records {
            match self.process_record(entity_type, record, options).await {
                Ok(outcome) => {
                    trace!(entity_type, remote_id = %record.id, outcome = outcome.as_str(), "Processed record");
                    outcome.count_into(&mut result);
                }
                Err(e) => {
                    warn!(entity_type, remote_id = %record.id, error = %e, "Failed to process record");
                    result.record_error(format!("{entity_type}/{}: {e}", record.id));
                }
            }
        }

        for (outcome, count) in [
            ("created", result.created),
            ("updated", result.updated),
            ("skipped", result.skipped),
            ("error", result.errors),
        ] {
            crate::metrics::record_records(entity_type, outcome, count);
        }
        debug!(entity_type, %result, "Processed batch");
        result
    }

    async fn process_record(
        &self,
        entity_type: &str,
        record: &RemoteRecord,
        options: &SyncOptions,
    ) -> Result<RecordOutcome, SyncError> {
        let existing = self.store.find_by_remote_id(entity_type, &record.id).await?;
        if existing.is_some() && !options.overwrite_existing() {
            return Ok(RecordOutcome::Skipped);
        }

        let (stored, created) = self.store.upsert(entity_type, &record.id, &record.fields).await?;
        let event = if created {
            SyncEvent::RecordCreated {
                entity_type: entity_type.to_string(),
                remote_id: record.id.clone(),
                version: stored.version,
            }
        } else {
            SyncEvent::RecordUpdated {
                entity_type: entity_type.to_string(),
                remote_id: record.id.clone(),
                version: stored.version,
            }
        };
        emit_logged(self.sink.as_ref(), &event).await;

        Ok(if created { RecordOutcome::Created } else { RecordOutcome::Updated })
    }
}
