//! Ledger and quota record types.

use chrono::{DateTime, Utc};

/// Fixed-length content key derived by the [`Fingerprinter`](crate::fingerprint::Fingerprinter).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ContentKey(pub String);

impl ContentKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of one delivery in the processing ledger and the quota store.
///
/// `message_id` alone when there is no recipient, `message_id#recipient` otherwise.
pub fn delivery_key(message_id: &str, recipient: &str) -> String {
    let recipient = recipient.trim().to_lowercase();
    if recipient.is_empty() {
        message_id.to_string()
    } else {
        format!("{message_id}#{recipient}")
    }
}

/// First sighting of a unique piece of content. Write-once.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DuplicateRecord {
    pub content_key: ContentKey,
    pub sender: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub subject: String,
    /// Attachment names in the order originally supplied.
    pub attachment_names: Vec<String>,
    /// Where each stored attachment lives, in attachment order.
    pub artifact_locations: Vec<String>,
    pub first_seen_at: DateTime<Utc>,
}

/// Outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProcessingStatus {
    Success,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Error => "Error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Success" => Some(Self::Success),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion record of one (message, recipient) delivery. Write-once.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessingRecord {
    pub message_id: String,
    /// Normalized recipient address; empty for messages without recipients.
    pub recipient: String,
    pub processed_at: DateTime<Utc>,
    /// `None` when processing failed before a key was settled.
    pub content_key: Option<ContentKey>,
    pub artifact_locations: Vec<String>,
    pub status: ProcessingStatus,
    pub error: Option<String>,
}

impl ProcessingRecord {
    pub fn delivery_key(&self) -> String {
        delivery_key(&self.message_id, &self.recipient)
    }
}

/// One slot of the bounded fast store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QuotaEntry {
    pub message_id: String,
    pub inserted_at: DateTime<Utc>,
}
