//! Binary snapshot format of the bounded fast store.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ HEADER (64 bytes, fixed)             │
//! │  magic: [u8; 8] = b"MLQUOTA\0"      │
//! │  version: u32                        │
//! │  capacity: u64                       │
//! │  entry_count: u64                    │
//! │  payload_sha256: [u8; 32]           │
//! │  (padding to 64 bytes)               │
//! ├──────────────────────────────────────┤
//! │ ENTRIES (variable)                   │
//! │  bincode-serialized Vec<QuotaEntry>  │
//! └──────────────────────────────────────┘
//! ```

use sha2::{Digest, Sha256};

/// Magic bytes identifying a quota snapshot.
pub const MAGIC: &[u8; 8] = b"MLQUOTA\0";

/// Current snapshot format version.
pub const VERSION: u32 = 1;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Serializable snapshot header.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct SnapshotHeader {
    /// Magic bytes (must equal [`MAGIC`]).
    pub magic: [u8; 8],
    /// Format version (must equal [`VERSION`]).
    pub version: u32,
    /// Capacity the store had when the snapshot was written.
    pub capacity: u64,
    /// Number of entries in the payload.
    pub entry_count: u64,
    /// SHA-256 of the payload bytes.
    pub payload_sha256: [u8; 32],
}

impl SnapshotHeader {
    pub fn new(capacity: usize, entry_count: usize, payload: &[u8]) -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
            capacity: capacity as u64,
            entry_count: entry_count as u64,
            payload_sha256: payload_digest(payload),
        }
    }

    /// Validate that the header is well-formed and matches the payload.
    pub fn validate(&self, payload: &[u8]) -> std::result::Result<(), String> {
        if self.magic != *MAGIC {
            return Err("Invalid magic bytes".into());
        }
        if self.version != VERSION {
            return Err(format!(
                "Incompatible version: expected {VERSION}, found {}",
                self.version
            ));
        }
        if self.payload_sha256 != payload_digest(payload) {
            return Err("Payload checksum mismatch".into());
        }
        Ok(())
    }
}

fn payload_digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}
