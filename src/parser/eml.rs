//! Parser for individual `.eml` files (RFC 5322 messages without MBOX framing).

use std::path::{Path, PathBuf};

use mail_parser::{Addr, Address, MessageParser, MimeHeaders};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};
use crate::model::address::EmailAddress;
use crate::model::message::{AttachmentMeta, InboundMessage};
use crate::parser::date::parse_date;

/// Parse a single `.eml` file into an [`InboundMessage`].
pub fn parse_eml(path: impl AsRef<Path>) -> Result<InboundMessage> {
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| LedgerError::io(path, e))?;
    parse_message(&data, Some(path.to_path_buf()))
}

/// Parse raw message bytes.
///
/// The message id is the `Message-ID` header; messages without one get a
/// stable id derived from their bytes, so re-reading the same file yields
/// the same delivery.
pub fn parse_message(raw: &[u8], origin: Option<PathBuf>) -> Result<InboundMessage> {
    let raw = skip_bom(raw);
    let msg = MessageParser::default().parse(raw).ok_or_else(|| {
        LedgerError::Source(format!(
            "Unparseable message{}",
            origin
                .as_ref()
                .map(|p| format!(" '{}'", p.display()))
                .unwrap_or_default()
        ))
    })?;

    let message_id = match msg.message_id() {
        Some(id) if !id.trim().is_empty() => format!("<{}>", id.trim().trim_matches(['<', '>'])),
        _ => format!("sha256:{}", hex_digest(raw)),
    };

    let from = addresses(msg.from()).into_iter().next().unwrap_or_default();
    let sent_at = msg.date().and_then(|d| parse_date(&d.to_rfc3339()));
    let mut recipients = addresses(msg.to());
    recipients.extend(addresses(msg.cc()));

    let attachments = msg
        .attachments()
        .enumerate()
        .map(|(idx, part)| AttachmentMeta {
            filename: part
                .attachment_name()
                .map(String::from)
                .unwrap_or_else(|| format!("attachment_{idx}")),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: part.contents().len() as u64,
        })
        .collect();

    Ok(InboundMessage {
        message_id,
        from,
        sent_at,
        subject: msg.subject().unwrap_or("").trim().to_string(),
        recipients,
        attachments,
        origin,
    })
}

/// Decode the bytes of the `index`-th attachment.
pub fn extract_attachment(raw: &[u8], index: usize) -> Result<Vec<u8>> {
    let msg = MessageParser::default()
        .parse(skip_bom(raw))
        .ok_or_else(|| LedgerError::Source("Failed to parse message for attachment".into()))?;
    msg.attachments()
        .nth(index)
        .map(|part| part.contents().to_vec())
        .ok_or_else(|| LedgerError::Source(format!("Attachment #{index} not found in message")))
}

/// Flatten an address header (plain list or RFC 5322 groups).
fn addresses(header: Option<&Address<'_>>) -> Vec<EmailAddress> {
    let addrs: Vec<&Addr<'_>> = match header {
        None => Vec::new(),
        Some(Address::List(list)) => list.iter().collect(),
        Some(Address::Group(groups)) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    addrs
        .into_iter()
        .filter_map(|a| {
            let address = a.address.as_deref()?.trim();
            (!address.is_empty()).then(|| EmailAddress {
                display_name: a.name.as_deref().unwrap_or("").trim().to_string(),
                address: address.to_string(),
            })
        })
        .collect()
}

fn skip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data)
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "From: Loan Desk <Desk@Bank.example>\r\n\
To: bob@y.com, \"Carol, C\" <carol@z.com>\r\n\
Cc: bob@y.com\r\n\
Subject: Loan Agreement\r\n\
Date: Sat, 22 Jun 2024 10:30:00 +0000\r\n\
Message-ID: <loan-1@bank.example>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
Please sign.\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"loan.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQ=\r\n\
--XX--\r\n";

    #[test]
    fn test_parse_message_fields() {
        let msg = parse_message(SAMPLE.as_bytes(), None).unwrap();
        assert_eq!(msg.message_id, "<loan-1@bank.example>");
        assert_eq!(msg.from.address, "Desk@Bank.example");
        assert_eq!(msg.subject, "Loan Agreement");
        assert_eq!(
            msg.sent_at.unwrap().format("%Y-%m-%dT%H:%M:%S").to_string(),
            "2024-06-22T10:30:00"
        );
        assert_eq!(msg.recipients.len(), 3);
        assert_eq!(msg.distinct_recipients().len(), 2);
        assert_eq!(msg.attachment_names(), vec!["loan.pdf"]);
        assert_eq!(msg.attachments[0].content_type, "application/pdf");
    }

    #[test]
    fn test_extract_attachment_decodes_base64() {
        let bytes = extract_attachment(SAMPLE.as_bytes(), 0).unwrap();
        assert_eq!(bytes, b"%PDF-1.4");
        assert!(extract_attachment(SAMPLE.as_bytes(), 1).is_err());
    }

    #[test]
    fn test_missing_message_id_is_content_derived() {
        let raw = b"From: a@x.com\r\nSubject: Hi\r\n\r\nBody\r\n";
        let a = parse_message(raw, None).unwrap();
        let b = parse_message(raw, None).unwrap();
        assert!(a.message_id.starts_with("sha256:"));
        assert_eq!(a.message_id, b.message_id);
        assert!(a.sent_at.is_none());
    }
}
