//! Duplicate coordination: decides, per delivery, whether a message is
//! already handled, new content, or a re-delivery of stored content.
//!
//! ```text
//! (message, recipient) ──► quota hit? ──yes──► AlreadyHandled
//!                              │ no
//!                              ▼
//!                      processing ledger hit? ──yes──► re-insert quota ──► AlreadyHandled
//!                              │ no
//!                              ▼
//!            fingerprint ──► content ledger hit? ──yes──► Duplicate (reuse locations)
//!                              │ no
//!                              ▼
//!                    store attachments ──► append DuplicateRecord ──► Novel
//!                              │
//!                              ▼
//!          append ProcessingRecord ──► quota insert ──► notify
//! ```
//!
//! Content resolution runs at most once per message, so every recipient of
//! a fan-out shares one set of artifacts.

use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::fingerprint::Fingerprinter;
use crate::ledger::{AppendOutcome, ContentLedger, ProcessingLedger};
use crate::model::address::EmailAddress;
use crate::model::message::InboundMessage;
use crate::model::record::{
    delivery_key, ContentKey, DuplicateRecord, ProcessingRecord, ProcessingStatus,
};
use crate::notify::{Notification, NotificationSink};
use crate::source::MessageSource;
use crate::store::documents::DocumentStore;
use crate::store::quota::QuotaStore;

/// What happened to one (message, recipient) delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail")]
pub enum Verdict {
    /// Found in the quota store or the processing ledger; nothing written.
    AlreadyHandled,
    /// First sighting of the content; artifacts were stored.
    Novel,
    /// Content seen before; existing artifacts reused.
    Duplicate,
    /// Artifact persistence failed; an Error record was logged.
    Failed(String),
    /// A ledger was unavailable; nothing logged, retried on the next run.
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub message_id: String,
    pub recipient: String,
    pub verdict: Verdict,
    pub content_key: Option<ContentKey>,
    pub artifact_locations: Vec<String>,
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub messages: usize,
    pub deliveries: usize,
    pub already_handled: usize,
    pub novel: usize,
    pub duplicate: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchSummary {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        self.deliveries += 1;
        match outcome.verdict {
            Verdict::AlreadyHandled => self.already_handled += 1,
            Verdict::Novel => self.novel += 1,
            Verdict::Duplicate => self.duplicate += 1,
            Verdict::Failed(_) => self.failed += 1,
            Verdict::Skipped(_) => self.skipped += 1,
        }
    }
}

/// Per-message content decision, shared by every recipient.
#[derive(Debug, Clone)]
enum Resolution {
    Stored {
        key: ContentKey,
        locations: Vec<String>,
        duplicate: bool,
    },
    PersistenceFailed {
        key: ContentKey,
        reason: String,
    },
    Unavailable(String),
}

/// Wires the stores and ledgers together. Holds no state of its own
/// beyond a lock serializing content resolution.
pub struct Coordinator<'a> {
    fingerprinter: Fingerprinter,
    quota: &'a QuotaStore,
    content: &'a dyn ContentLedger,
    processing: &'a dyn ProcessingLedger,
    documents: &'a dyn DocumentStore,
    sink: &'a dyn NotificationSink,
    content_guard: Mutex<()>,
}

impl<'a> Coordinator<'a> {
    pub fn new(
        fingerprinter: Fingerprinter,
        quota: &'a QuotaStore,
        content: &'a dyn ContentLedger,
        processing: &'a dyn ProcessingLedger,
        documents: &'a dyn DocumentStore,
        sink: &'a dyn NotificationSink,
    ) -> Self {
        Self {
            fingerprinter,
            quota,
            content,
            processing,
            documents,
            sink,
            content_guard: Mutex::new(()),
        }
    }

    /// Process every message. Per-message failures never abort the batch.
    pub fn process_batch(
        &self,
        source: &dyn MessageSource,
        messages: &[InboundMessage],
        progress: Option<&dyn Fn(usize, usize)>,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for (idx, message) in messages.iter().enumerate() {
            for outcome in self.process_message(source, message) {
                summary.record(&outcome);
            }
            summary.messages += 1;
            if let Some(cb) = progress {
                cb(idx + 1, messages.len());
            }
        }
        info!(
            messages = summary.messages,
            novel = summary.novel,
            duplicate = summary.duplicate,
            handled = summary.already_handled,
            failed = summary.failed,
            skipped = summary.skipped,
            "Batch complete"
        );
        summary
    }

    /// Process one message, once per distinct recipient.
    pub fn process_message(
        &self,
        source: &dyn MessageSource,
        message: &InboundMessage,
    ) -> Vec<DeliveryOutcome> {
        let recipients = message.distinct_recipients();
        let mut outcomes = Vec::with_capacity(recipients.len());
        let mut resolution: Option<Resolution> = None;

        for (idx, recipient) in recipients.iter().enumerate() {
            let recipient = recipient.normalized();
            let key = delivery_key(&message.message_id, &recipient);

            match self.already_handled(&key) {
                Ok(true) => {
                    debug!(delivery = %key, "Already handled");
                    outcomes.push(outcome(message, &recipient, Verdict::AlreadyHandled));
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    self.skip_rest(message, &recipients[idx..], &e.to_string(), &mut outcomes);
                    return outcomes;
                }
            }

            let resolved = resolution.get_or_insert_with(|| self.resolve_content(source, message));
            let (record, verdict) = match resolved {
                Resolution::Unavailable(reason) => {
                    let reason = reason.clone();
                    self.skip_rest(message, &recipients[idx..], &reason, &mut outcomes);
                    return outcomes;
                }
                Resolution::Stored {
                    key: content_key,
                    locations,
                    duplicate,
                } => (
                    ProcessingRecord {
                        message_id: message.message_id.clone(),
                        recipient: recipient.clone(),
                        processed_at: Utc::now(),
                        content_key: Some(content_key.clone()),
                        artifact_locations: locations.clone(),
                        status: ProcessingStatus::Success,
                        error: None,
                    },
                    if *duplicate {
                        Verdict::Duplicate
                    } else {
                        Verdict::Novel
                    },
                ),
                Resolution::PersistenceFailed {
                    key: content_key,
                    reason,
                } => (
                    ProcessingRecord {
                        message_id: message.message_id.clone(),
                        recipient: recipient.clone(),
                        processed_at: Utc::now(),
                        content_key: Some(content_key.clone()),
                        artifact_locations: Vec::new(),
                        status: ProcessingStatus::Error,
                        error: Some(reason.clone()),
                    },
                    Verdict::Failed(reason.clone()),
                ),
            };

            outcomes.push(self.log_delivery(&key, record, verdict));
        }
        outcomes
    }

    /// Quota first, then the processing ledger. A ledger hit re-warms the quota.
    fn already_handled(&self, key: &str) -> Result<bool, LedgerError> {
        if self.quota.contains(key) {
            return Ok(true);
        }
        match self.processing.lookup(key)? {
            Some(_) => {
                debug!(delivery = %key, "Quota miss confirmed by processing ledger");
                self.quota.try_insert(key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Look the content up and, for new content, store its attachments and
    /// record it. Serialized so two deliveries of the same content in one
    /// process cannot both store artifacts.
    fn resolve_content(&self, source: &dyn MessageSource, message: &InboundMessage) -> Resolution {
        let fingerprint = self.fingerprinter.for_message(message);
        let key = fingerprint.key;
        let _guard = self.content_guard.lock().unwrap_or_else(|p| p.into_inner());

        match self.content.lookup(&key) {
            Ok(Some(existing)) => {
                return Resolution::Stored {
                    key,
                    locations: existing.artifact_locations,
                    duplicate: true,
                }
            }
            Ok(None) => {}
            Err(e) => return Resolution::Unavailable(e.to_string()),
        }

        let mut locations = Vec::with_capacity(message.attachments.len());
        for (idx, attachment) in message.attachments.iter().enumerate() {
            let stored = source
                .attachment(message, idx)
                .and_then(|bytes| self.documents.store(&bytes, &attachment.filename));
            match stored {
                Ok(location) => locations.push(location),
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        attachment = %attachment.filename,
                        size = attachment.size,
                        error = %e,
                        "Artifact persistence failed"
                    );
                    return Resolution::PersistenceFailed {
                        key,
                        reason: e.to_string(),
                    };
                }
            }
        }

        let record = DuplicateRecord {
            content_key: key.clone(),
            sender: message.from.normalized(),
            sent_at: message.sent_at,
            subject: message.subject.clone(),
            attachment_names: message.attachment_names(),
            artifact_locations: locations,
            first_seen_at: Utc::now(),
        };
        match self.content.append(&record) {
            Ok(AppendOutcome::Appended) => {
                info!(
                    content_key = %key,
                    sender = %message.from,
                    fallback = fingerprint.fallback,
                    "New content recorded"
                );
                Resolution::Stored {
                    key,
                    locations: record.artifact_locations,
                    duplicate: false,
                }
            }
            // Another process recorded the same content between lookup and append.
            Ok(AppendOutcome::AlreadyPresent) => match self.content.lookup(&key) {
                Ok(Some(existing)) => Resolution::Stored {
                    key,
                    locations: existing.artifact_locations,
                    duplicate: true,
                },
                Ok(None) => Resolution::Unavailable(format!("content record {key} vanished")),
                Err(e) => Resolution::Unavailable(e.to_string()),
            },
            Err(e) => Resolution::Unavailable(e.to_string()),
        }
    }

    /// Append the processing record, then mark the delivery handled and notify.
    fn log_delivery(&self, key: &str, record: ProcessingRecord, verdict: Verdict) -> DeliveryOutcome {
        match self.processing.append(&record) {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::AlreadyPresent) => {
                debug!(delivery = %key, "Processing record already present");
            }
            Err(e) => {
                warn!(delivery = %key, error = %e, "Could not log delivery, will retry next run");
                return DeliveryOutcome {
                    message_id: record.message_id,
                    recipient: record.recipient,
                    verdict: Verdict::Skipped(e.to_string()),
                    content_key: record.content_key,
                    artifact_locations: Vec::new(),
                };
            }
        }
        self.quota.try_insert(key);

        let notification = Notification {
            message_id: record.message_id.clone(),
            recipient: record.recipient.clone(),
            content_key: record.content_key.as_ref().map(|k| k.to_string()),
            artifact_locations: record.artifact_locations.clone(),
            duplicate: verdict == Verdict::Duplicate,
            status: record.status,
            error: record.error.clone(),
        };
        if let Err(e) = self.sink.notify(&notification) {
            warn!(delivery = %key, error = %e, "Notification failed");
        }

        DeliveryOutcome {
            message_id: record.message_id,
            recipient: record.recipient,
            verdict,
            content_key: record.content_key,
            artifact_locations: record.artifact_locations,
        }
    }

    fn skip_rest(
        &self,
        message: &InboundMessage,
        recipients: &[EmailAddress],
        reason: &str,
        outcomes: &mut Vec<DeliveryOutcome>,
    ) {
        warn!(message_id = %message.message_id, error = reason, "Ledger unavailable, skipping message");
        for recipient in recipients {
            outcomes.push(outcome(
                message,
                &recipient.normalized(),
                Verdict::Skipped(reason.to_string()),
            ));
        }
    }
}

/// Outcome of a delivery that wrote nothing.
fn outcome(message: &InboundMessage, recipient: &str, verdict: Verdict) -> DeliveryOutcome {
    DeliveryOutcome {
        message_id: message.message_id.clone(),
        recipient: recipient.to_string(),
        verdict,
        content_key: None,
        artifact_locations: Vec::new(),
    }
}
