//! Append-only ledgers: the content ledger and the processing ledger.
//!
//! Both are unbounded, write-once logs. Callers only see the traits below,
//! so the linear-scan CSV backing can be replaced by an indexed store
//! without touching the coordinator.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::Result;
use crate::model::record::{ContentKey, DuplicateRecord, ProcessingRecord};

pub mod content;
pub mod processing;
pub mod table;

pub use content::ContentTable;
pub use processing::ProcessingTable;

/// Result of an idempotent append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// A record with the same key already exists; nothing was written.
    AlreadyPresent,
}

impl From<bool> for AppendOutcome {
    fn from(written: bool) -> Self {
        if written {
            Self::Appended
        } else {
            Self::AlreadyPresent
        }
    }
}

/// Every unique content key ever seen, with where its artifacts live.
pub trait ContentLedger: Send + Sync {
    fn lookup(&self, key: &ContentKey) -> Result<Option<DuplicateRecord>>;

    /// Write `record` unless its content key is already present.
    fn append(&self, record: &DuplicateRecord) -> Result<AppendOutcome>;
}

/// Every delivery that completed processing, successfully or not.
pub trait ProcessingLedger: Send + Sync {
    fn lookup(&self, delivery_key: &str) -> Result<Option<ProcessingRecord>>;

    /// Write `record` unless its delivery key is already present.
    fn append(&self, record: &ProcessingRecord) -> Result<AppendOutcome>;
}

/// Canonical timestamp cell: RFC 3339, whole seconds, `Z` suffix.
pub(crate) fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_time(cell: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(cell.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{cell}': {e}"))
}

pub(crate) fn parse_optional_time(
    cell: &str,
) -> std::result::Result<Option<DateTime<Utc>>, String> {
    if cell.trim().is_empty() {
        Ok(None)
    } else {
        parse_time(cell).map(Some)
    }
}
