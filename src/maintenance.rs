//! Operator maintenance: age-based purge and failed-delivery retry.
//!
//! Only the processing ledger and the quota store are touched. Content
//! records are permanent.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::ledger::ProcessingTable;
use crate::model::record::ProcessingRecord;
use crate::store::quota::QuotaStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    /// Processing ledger rows deleted.
    pub processing_rows: usize,
    /// Quota entries dropped.
    pub quota_entries: usize,
}

/// Delete processing records and quota entries older than `cutoff`.
pub fn purge_older_than(
    processing: &ProcessingTable,
    quota: &QuotaStore,
    cutoff: DateTime<Utc>,
) -> Result<PurgeStats> {
    let removed = processing.purge_older_than(cutoff)?;
    let mut quota_entries = quota.purge_older_than(cutoff);
    quota_entries += forget(quota, &removed);
    let stats = PurgeStats {
        processing_rows: removed.len(),
        quota_entries,
    };
    info!(cutoff = %cutoff, rows = stats.processing_rows, quota = stats.quota_entries, "Purged old records");
    Ok(stats)
}

/// Delete Error records so the next run retries those deliveries.
pub fn purge_failed(processing: &ProcessingTable, quota: &QuotaStore) -> Result<PurgeStats> {
    let removed = processing.purge_failed()?;
    let stats = PurgeStats {
        processing_rows: removed.len(),
        quota_entries: forget(quota, &removed),
    };
    info!(rows = stats.processing_rows, quota = stats.quota_entries, "Purged failed deliveries");
    Ok(stats)
}

/// A purged delivery must also leave the quota, or it would still read as handled.
fn forget(quota: &QuotaStore, removed: &[ProcessingRecord]) -> usize {
    removed
        .iter()
        .filter(|record| quota.remove(&record.delivery_key()))
        .count()
}
