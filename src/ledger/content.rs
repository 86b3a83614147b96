//! Content ledger backed by a CSV table.
//!
//! Rows are permanent: this type deliberately exposes no way to delete them,
//! because a forgotten content key would make the next delivery of the same
//! document store a second copy.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;

use lru::LruCache;
use tracing::debug;

use super::table::{join_list, split_list, CsvTable, TableRow};
use super::{format_time, parse_optional_time, parse_time, AppendOutcome, ContentLedger};
use crate::error::Result;
use crate::model::record::{ContentKey, DuplicateRecord};

impl TableRow for DuplicateRecord {
    const COLUMNS: &'static [&'static str] = &[
        "First_Seen",
        "Content_Key",
        "Sender",
        "Sent_At",
        "Subject",
        "Attachments",
        "Artifact_Locations",
    ];

    fn key(&self) -> String {
        self.content_key.0.clone()
    }

    fn to_fields(&self) -> Vec<String> {
        vec![
            format_time(&self.first_seen_at),
            self.content_key.0.clone(),
            self.sender.clone(),
            self.sent_at.as_ref().map(format_time).unwrap_or_default(),
            self.subject.clone(),
            join_list(&self.attachment_names),
            join_list(&self.artifact_locations),
        ]
    }

    fn from_fields(fields: &[String]) -> std::result::Result<Self, String> {
        let [first_seen, key, sender, sent_at, subject, names, locations] = fields else {
            return Err(format!(
                "expected {} fields, found {}",
                Self::COLUMNS.len(),
                fields.len()
            ));
        };
        if key.is_empty() {
            return Err("empty content key".into());
        }
        Ok(Self {
            content_key: ContentKey(key.clone()),
            sender: sender.clone(),
            sent_at: parse_optional_time(sent_at)?,
            subject: subject.clone(),
            attachment_names: split_list(names),
            artifact_locations: split_list(locations),
            first_seen_at: parse_time(first_seen)?,
        })
    }
}

/// The content ledger as a spreadsheet-readable CSV file.
///
/// Positive lookups are cached: records never change once written, so a hit
/// stays valid forever. Misses are always re-scanned.
pub struct ContentTable {
    table: CsvTable<DuplicateRecord>,
    hits: Option<Mutex<LruCache<ContentKey, DuplicateRecord>>>,
}

impl ContentTable {
    /// Open or create the ledger. `cache_size = 0` disables the hit cache.
    pub fn open(path: impl AsRef<Path>, separator: char, cache_size: usize) -> Result<Self> {
        Ok(Self {
            table: CsvTable::open(path, separator)?,
            hits: NonZeroUsize::new(cache_size).map(|n| Mutex::new(LruCache::new(n))),
        })
    }

    pub fn path(&self) -> &Path {
        self.table.path()
    }

    /// All records in the order they were first seen.
    pub fn records(&self) -> Result<Vec<DuplicateRecord>> {
        self.table.rows()
    }

    fn cached(&self, key: &ContentKey) -> Option<DuplicateRecord> {
        let cache = self.hits.as_ref()?;
        let mut cache = cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(key).cloned()
    }

    fn remember(&self, record: &DuplicateRecord) {
        if let Some(cache) = self.hits.as_ref() {
            let mut cache = cache.lock().unwrap_or_else(|p| p.into_inner());
            cache.put(record.content_key.clone(), record.clone());
        }
    }
}

impl ContentLedger for ContentTable {
    fn lookup(&self, key: &ContentKey) -> Result<Option<DuplicateRecord>> {
        if let Some(hit) = self.cached(key) {
            debug!(key = %key, "Content ledger cache hit");
            return Ok(Some(hit));
        }
        let found = self.table.find(key.as_str())?;
        if let Some(ref record) = found {
            self.remember(record);
        }
        Ok(found)
    }

    fn append(&self, record: &DuplicateRecord) -> Result<AppendOutcome> {
        let outcome = AppendOutcome::from(self.table.append_unique(record)?);
        if outcome == AppendOutcome::Appended {
            self.remember(record);
        }
        Ok(outcome)
    }
}
