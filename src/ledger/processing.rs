//! Processing ledger backed by a CSV table.

use std::path::Path;

use chrono::{DateTime, Utc};

use super::table::{join_list, split_list, CsvTable, TableRow};
use super::{format_time, parse_time, AppendOutcome, ProcessingLedger};
use crate::error::Result;
use crate::model::record::{ContentKey, ProcessingRecord, ProcessingStatus};

impl TableRow for ProcessingRecord {
    const COLUMNS: &'static [&'static str] = &[
        "Processed_At",
        "Message_Id",
        "Recipient",
        "Content_Key",
        "Artifact_Locations",
        "Status",
        "Error",
    ];

    fn key(&self) -> String {
        self.delivery_key()
    }

    fn to_fields(&self) -> Vec<String> {
        vec![
            format_time(&self.processed_at),
            self.message_id.clone(),
            self.recipient.clone(),
            self.content_key
                .as_ref()
                .map(|k| k.0.clone())
                .unwrap_or_default(),
            join_list(&self.artifact_locations),
            self.status.to_string(),
            self.error.clone().unwrap_or_default(),
        ]
    }

    fn from_fields(fields: &[String]) -> std::result::Result<Self, String> {
        let [processed_at, message_id, recipient, key, locations, status, error] = fields else {
            return Err(format!(
                "expected {} fields, found {}",
                Self::COLUMNS.len(),
                fields.len()
            ));
        };
        if message_id.is_empty() {
            return Err("empty message id".into());
        }
        Ok(Self {
            message_id: message_id.clone(),
            recipient: recipient.clone(),
            processed_at: parse_time(processed_at)?,
            content_key: (!key.is_empty()).then(|| ContentKey(key.clone())),
            artifact_locations: split_list(locations),
            status: ProcessingStatus::parse(status)
                .ok_or_else(|| format!("unknown status '{status}'"))?,
            error: (!error.is_empty()).then(|| error.clone()),
        })
    }
}

/// The processing ledger as a spreadsheet-readable CSV file.
///
/// Unlike the content ledger, rows may be removed by explicit maintenance.
pub struct ProcessingTable {
    table: CsvTable<ProcessingRecord>,
}

impl ProcessingTable {
    pub fn open(path: impl AsRef<Path>, separator: char) -> Result<Self> {
        Ok(Self {
            table: CsvTable::open(path, separator)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.table.path()
    }

    /// All records in processing order.
    pub fn records(&self) -> Result<Vec<ProcessingRecord>> {
        self.table.rows()
    }

    /// Delete records processed before `cutoff`; returns what was deleted.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessingRecord>> {
        self.table.retain(|r| r.processed_at >= cutoff)
    }

    /// Delete failed records so their deliveries are retried; returns what was deleted.
    pub fn purge_failed(&self) -> Result<Vec<ProcessingRecord>> {
        self.table.retain(|r| r.status != ProcessingStatus::Error)
    }
}

impl ProcessingLedger for ProcessingTable {
    fn lookup(&self, delivery_key: &str) -> Result<Option<ProcessingRecord>> {
        self.table.find(delivery_key)
    }

    fn append(&self, record: &ProcessingRecord) -> Result<AppendOutcome> {
        Ok(self.table.append_unique(record)?.into())
    }
}
