//! Content-key derivation.
//!
//! A content key identifies a document by its metadata rather than by its
//! delivery: the same sender, send-time window, subject and attachment set
//! always produce the same key, no matter how often the document is
//! delivered or to whom.
//!
//! ```text
//! sender   ──► lowercase, keep [a-z0-9@.]          ─┐
//! sent_at  ──► truncate to window, %Y-%m-%dT%H:%M:%SZ ├─► join "|" ─► SHA-256 ─► hex prefix
//! subject  ──► lowercase, keep alphanumerics          │
//! names    ──► trim, lowercase, sort, join ","      ─┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::FingerprintConfig;
use crate::error::LedgerError;
use crate::model::address::EmailAddress;
use crate::model::message::InboundMessage;
use crate::model::record::ContentKey;

/// Separator between the normalized fields.
const FIELD_SEPARATOR: &str = "|";

/// Distinguishes fallback keys minted within the same clock tick.
static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Result of a fingerprint computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub key: ContentKey,
    /// `true` when normalization failed and the key is unique by construction.
    /// Duplicate detection is disabled for such a record.
    pub fallback: bool,
}

/// Derives [`ContentKey`]s with a fixed time window and key length.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    window_secs: u64,
    key_length: usize,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::from_config(&FingerprintConfig::default())
    }
}

impl Fingerprinter {
    pub fn new(window_secs: u64, key_length: usize) -> Self {
        Self {
            window_secs,
            key_length: key_length.clamp(8, 64),
        }
    }

    pub fn from_config(config: &FingerprintConfig) -> Self {
        Self::new(config.window_secs, config.key_length)
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    /// Fingerprint an inbound message.
    pub fn for_message(&self, message: &InboundMessage) -> Fingerprint {
        self.fingerprint(
            &message.from.address,
            message.sent_at,
            &message.subject,
            &message.attachment_names(),
        )
    }

    /// Compute the content key for one document.
    ///
    /// Never fails: when the inputs cannot be normalized the returned key is
    /// derived from the current instant and flagged as a fallback.
    pub fn fingerprint<S: AsRef<str>>(
        &self,
        sender: &str,
        sent_at: Option<DateTime<Utc>>,
        subject: &str,
        attachment_names: &[S],
    ) -> Fingerprint {
        match self.canonical_form(sender, sent_at, subject, attachment_names) {
            Ok(canonical) => Fingerprint {
                key: ContentKey(digest_prefix(&canonical, self.key_length)),
                fallback: false,
            },
            Err(e) => {
                warn!(error = %e, sender, subject, "Using unique fallback content key");
                Fingerprint {
                    key: self.fallback_key(),
                    fallback: true,
                }
            }
        }
    }

    /// Build the string that gets hashed.
    fn canonical_form<S: AsRef<str>>(
        &self,
        sender: &str,
        sent_at: Option<DateTime<Utc>>,
        subject: &str,
        attachment_names: &[S],
    ) -> Result<String, LedgerError> {
        let sender = normalize_sender(sender);
        if sender.is_empty() {
            return Err(LedgerError::FingerprintFallback("empty sender".into()));
        }
        let sent_at = sent_at
            .ok_or_else(|| LedgerError::FingerprintFallback("missing timestamp".into()))?;
        let window = truncate_timestamp(sent_at, self.window_secs).ok_or_else(|| {
            LedgerError::FingerprintFallback(format!("timestamp out of range: {sent_at}"))
        })?;

        Ok([
            sender,
            window.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            normalize_subject(subject),
            normalize_attachment_names(attachment_names),
        ]
        .join(FIELD_SEPARATOR))
    }

    fn fallback_key(&self) -> ContentKey {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
        ContentKey(digest_prefix(
            &format!("fallback{FIELD_SEPARATOR}{nanos}{FIELD_SEPARATOR}{seq}"),
            self.key_length,
        ))
    }
}

/// Lowercase the bare address and drop everything outside `[a-z0-9@.]`.
pub fn normalize_sender(raw: &str) -> String {
    EmailAddress::parse(raw)
        .address
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '@' || *c == '.')
        .collect()
}

/// Lowercase and keep only alphanumeric characters.
pub fn normalize_subject(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Trim, lowercase and sort, so order and case do not matter.
///
/// Commas and backslashes inside a name are backslash-escaped so that
/// `["a,b"]` and `["a", "b"]` never collapse to the same string.
pub fn normalize_attachment_names<S: AsRef<str>>(names: &[S]) -> String {
    let mut normalized: Vec<String> = names
        .iter()
        .map(|n| {
            n.as_ref()
                .trim()
                .to_lowercase()
                .replace('\\', "\\\\")
                .replace(',', "\\,")
        })
        .collect();
    normalized.sort();
    normalized.join(",")
}

/// Round `ts` down to a multiple of `window_secs` since the epoch.
///
/// A zero window keeps whole-second resolution.
pub fn truncate_timestamp(ts: DateTime<Utc>, window_secs: u64) -> Option<DateTime<Utc>> {
    let secs = ts.timestamp();
    let window = i64::try_from(window_secs).ok()?;
    let floored = if window == 0 {
        secs
    } else {
        secs - secs.rem_euclid(window)
    };
    DateTime::from_timestamp(floored, 0)
}

/// Hex SHA-256 of `input`, cut to `len` characters.
fn digest_prefix(input: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(len);
    hex
}
