//! Inbound message metadata.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::address::EmailAddress;

/// Metadata about one attachment of an inbound message.
///
/// The payload is NOT held here; it is fetched from the message source
/// only when the content turns out to be novel.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AttachmentMeta {
    /// Filename as supplied by the sender.
    pub filename: String,

    /// MIME content type (e.g. `"application/pdf"`).
    pub content_type: String,

    /// Decoded size in bytes, when known.
    pub size: u64,
}

/// One delivered message as supplied by a [`MessageSource`](crate::source::MessageSource).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InboundMessage {
    /// Stable, unique identifier of this delivery.
    pub message_id: String,

    /// Sender (first `From:` address).
    pub from: EmailAddress,

    /// Send time, if the message carried a parseable date.
    pub sent_at: Option<DateTime<Utc>>,

    /// Decoded subject line.
    pub subject: String,

    /// `To:` and `Cc:` recipients, in header order.
    pub recipients: Vec<EmailAddress>,

    /// Attachments, in the order the message lists them.
    pub attachments: Vec<AttachmentMeta>,

    /// Where the source read this message from, if it is file backed.
    pub origin: Option<PathBuf>,
}

impl InboundMessage {
    /// Attachment file names in original order.
    pub fn attachment_names(&self) -> Vec<String> {
        self.attachments.iter().map(|a| a.filename.clone()).collect()
    }

    /// Distinct recipients (case-insensitive), first occurrence wins.
    ///
    /// A message without any recipient yields a single empty address so it
    /// still produces exactly one delivery.
    pub fn distinct_recipients(&self) -> Vec<EmailAddress> {
        let mut seen = std::collections::HashSet::new();
        let mut out: Vec<EmailAddress> = self
            .recipients
            .iter()
            .filter(|r| !r.address.trim().is_empty())
            .filter(|r| seen.insert(r.normalized()))
            .cloned()
            .collect();
        if out.is_empty() {
            out.push(EmailAddress::default());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(recipients: &[&str]) -> InboundMessage {
        InboundMessage {
            message_id: "<m1@x>".into(),
            from: EmailAddress::bare("a@x.com"),
            sent_at: None,
            subject: "Hi".into(),
            recipients: recipients.iter().map(|r| EmailAddress::parse(r)).collect(),
            attachments: Vec::new(),
            origin: None,
        }
    }

    #[test]
    fn test_distinct_recipients_case_insensitive() {
        let msg = message(&["Bob <bob@y.com>", "BOB@y.com", "carol@z.com"]);
        let r = msg.distinct_recipients();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].address, "bob@y.com");
        assert_eq!(r[1].address, "carol@z.com");
    }

    #[test]
    fn test_no_recipients_yields_single_delivery() {
        let r = message(&[]).distinct_recipients();
        assert_eq!(r, vec![EmailAddress::default()]);
    }
}
