//! Resumable backfill progress.
//!
//! # Key Design
//!
//! The checkpoint records which listing page offsets still need to be
//! fetched. An offset is removed only after its page has been fetched and its
//! references handed downstream, so a crash between the fetch and the write
//! re-fetches that page rather than skipping it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Persisted state of the historical backfill.
///
/// Serialized as a flat object with camelCase fields:
/// `{"totalKnownRecords": 2500, "pendingHistoricalOffsets": [0, 1000, 2000]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Total record count last reported by the upstream. `None` until the
    /// first count query has completed.
    pub total_known_records: Option<u64>,

    /// Page offsets not yet successfully fetched.
    #[serde(default)]
    pub pending_historical_offsets: BTreeSet<u64>,
}

impl Checkpoint {
    /// Build the initial checkpoint for a corpus of `total` records.
    pub fn from_total(total: u64, page_size: u64) -> Self {
        Self {
            total_known_records: Some(total),
            pending_historical_offsets: page_offsets(0, total, page_size).collect(),
        }
    }

    /// Whether the total has been learned yet.
    pub fn is_initialized(&self) -> bool {
        self.total_known_records.is_some()
    }

    /// Whether every known page has been fetched.
    pub fn is_complete(&self) -> bool {
        self.pending_historical_offsets.is_empty()
    }

    /// Pending offsets, highest first.
    pub fn offsets_descending(&self) -> impl Iterator<Item = u64> + '_ {
        self.pending_historical_offsets.iter().rev().copied()
    }

    /// Mark a page as fetched. Returns `false` if it was not pending.
    pub fn complete(&mut self, offset: u64) -> bool {
        self.pending_historical_offsets.remove(&offset)
    }

    /// Grow the checkpoint to cover `new_total` records.
    ///
    /// New offsets start at the page that held the old last record, since
    /// that page may have been fetched while it was still partially filled.
    /// Returns the offsets that were newly added.
    pub fn extend_to(&mut self, new_total: u64, page_size: u64) -> Vec<u64> {
        let page_size = page_size.max(1);
        let old_total = self.total_known_records.unwrap_or(0);
        if self.total_known_records.is_some() && new_total <= old_total {
            return Vec::new();
        }

        let start = (old_total / page_size) * page_size;
        let added: Vec<u64> = page_offsets(start, new_total, page_size)
            .filter(|offset| self.pending_historical_offsets.insert(*offset))
            .collect();
        self.total_known_records = Some(new_total);
        added
    }
}

fn page_offsets(start: u64, end: u64, page_size: u64) -> impl Iterator<Item = u64> {
    let page_size = page_size.max(1);
    (0..)
        .map(move |i| start + i * page_size)
        .take_while(move |offset| *offset < end)
}
