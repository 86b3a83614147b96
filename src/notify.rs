//! Notification sinks: told about every logged delivery.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tracing::info;

use crate::error::{LedgerError, Result};
use crate::model::record::ProcessingStatus;

/// What a downstream consumer learns about one (message, recipient) delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message_id: String,
    pub recipient: String,
    pub content_key: Option<String>,
    /// New or reused artifact locations.
    pub artifact_locations: Vec<String>,
    /// `true` when the content had been stored before.
    pub duplicate: bool,
    pub status: ProcessingStatus,
    pub error: Option<String>,
}

/// Receives a [`Notification`] after each delivery is logged.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

impl<W: Write + Send> NotificationSink for JsonLinesSink<W> {
    fn notify(&self, notification: &Notification) -> Result<()> {
        let line = serde_json::to_string(notification)
            .map_err(|e| LedgerError::Source(format!("Could not encode notification: {e}")))?;
        let mut out = self.out.lock().unwrap_or_else(|p| p.into_inner());
        writeln!(out, "{line}")?;
        out.flush()?;
        Ok(())
    }
}

/// Emits notifications as structured log events.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, n: &Notification) -> Result<()> {
        info!(
            message_id = %n.message_id,
            recipient = %n.recipient,
            duplicate = n.duplicate,
            status = %n.status,
            locations = n.artifact_locations.len(),
            "Delivery logged"
        );
        Ok(())
    }
}
