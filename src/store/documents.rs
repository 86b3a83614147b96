//! Document store: where novel attachments are persisted.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{LedgerError, Result};

/// Persists attachment bytes and returns a location string.
///
/// Only invoked for content the coordinator has not seen before.
pub trait DocumentStore: Send + Sync {
    fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<String>;
}

/// Stores each artifact as a file in a directory.
///
/// Names are sanitized and never overwrite an existing file; the returned
/// location is the absolute-or-relative path as given at construction.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DocumentStore for DirectoryStore {
    fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<String> {
        let fail = |reason: String| LedgerError::ArtifactPersistence {
            name: suggested_name.to_string(),
            reason,
        };
        std::fs::create_dir_all(&self.root)
            .map_err(|e| fail(format!("{}: {e}", self.root.display())))?;

        let filename = sanitize_filename_part(suggested_name, 150);
        let path = unique_path(&self.root.join(filename));
        std::fs::write(&path, bytes).map_err(|e| fail(format!("{}: {e}", path.display())))?;

        debug!(path = %path.display(), size = bytes.len(), "Artifact stored");
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Sanitize a string for use in filenames.
///
/// Replaces invalid characters with `_` and truncates to `max_len`.
pub fn sanitize_filename_part(s: &str, max_len: usize) -> String {
    let sanitized: String = s
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '.' | '_' | '@') {
                c
            } else {
                '_'
            }
        })
        .take(max_len)
        .collect();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "attachment".to_string()
    } else {
        sanitized
    }
}

/// If `path` already exists, append a counter to make it unique.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = path.parent().unwrap_or(Path::new("."));

    (1..)
        .map(|i| {
            if ext.is_empty() {
                parent.join(format!("{stem}_{i}"))
            } else {
                parent.join(format!("{stem}_{i}.{ext}"))
            }
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| parent.join(format!("{stem}_dup.{ext}")))
}
