//! Inbound message sources.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{LedgerError, Result};
use crate::model::message::InboundMessage;
use crate::parser::eml;

/// Supplies messages to ingest and, on demand, their attachment bytes.
pub trait MessageSource {
    /// Enumerate the messages available for this run.
    fn fetch(&self) -> Result<Vec<InboundMessage>>;

    /// Bytes of `message.attachments[index]`.
    fn attachment(&self, message: &InboundMessage, index: usize) -> Result<Vec<u8>>;
}

/// Every `*.eml` file in a directory (non-recursive), in file-name order.
pub struct EmlDirectory {
    root: PathBuf,
}

impl EmlDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl MessageSource for EmlDirectory {
    fn fetch(&self) -> Result<Vec<InboundMessage>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| LedgerError::io(&self.root, e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("eml"))
            })
            .collect();
        paths.sort();

        let mut messages = Vec::with_capacity(paths.len());
        for path in paths {
            match eml::parse_eml(&path) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unparseable message"),
            }
        }
        debug!(root = %self.root.display(), count = messages.len(), "Fetched messages");
        Ok(messages)
    }

    fn attachment(&self, message: &InboundMessage, index: usize) -> Result<Vec<u8>> {
        let path = message.origin.as_deref().ok_or_else(|| {
            LedgerError::Source(format!("Message {} has no backing file", message.message_id))
        })?;
        let raw = std::fs::read(path).map_err(|e| LedgerError::io(path, e))?;
        eml::extract_attachment(&raw, index)
    }
}
