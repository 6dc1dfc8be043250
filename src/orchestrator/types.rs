// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use crate::record::SyncResult;

/// What happened to one record during processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Created,
    Updated,
    /// Already present locally and overwriting was not requested
    Skipped,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
        }
    }

    pub(super) fn count_into(self, result: &mut SyncResult) {
        match self {
            Self::Created => result.created += 1,
            Self::Updated => result.updated += 1,
            Self::Skipped => result.skipped += 1,
        }
    }
}

/// Progress of a paginated fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageProgress {
    /// Pages fetched so far
    pub pages: u32,
    /// Records fetched so far
    pub records: usize,
    /// Remote elements skipped because they had no usable id
    pub dropped: usize,
    /// Offset of the next page
    pub offset: usize,
    /// No more pages will be fetched
    pub done: bool,
}
