//! Bounded fast store: a small FIFO membership cache of handled deliveries.
//!
//! The store only answers "recently handled?" cheaply. It is allowed to
//! forget: a miss means "maybe not processed", and callers must confirm
//! against the processing ledger.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::QuotaConfig;
use crate::error::{LedgerError, Result};
use crate::model::record::QuotaEntry;
use crate::store::format::{SnapshotHeader, HEADER_SIZE};

/// Result of [`QuotaStore::try_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertOutcome {
    /// `false` when the id was already present.
    pub inserted: bool,
    /// Number of oldest entries dropped to make room.
    pub evicted: usize,
}

#[derive(Debug, Default)]
struct Slots {
    /// Oldest first.
    order: VecDeque<QuotaEntry>,
    ids: HashSet<String>,
    /// Ids inserted since open; protected from eviction when merging snapshots.
    fresh: HashSet<String>,
    /// Ids removed since open; not resurrected when merging snapshots.
    removed: HashSet<String>,
}

impl Slots {
    fn from_entries(mut entries: Vec<QuotaEntry>) -> Self {
        entries.sort_by_key(|e| e.inserted_at);
        let mut slots = Self::default();
        for entry in entries {
            if slots.ids.insert(entry.message_id.clone()) {
                slots.order.push_back(entry);
            }
        }
        slots
    }

    fn pop_oldest(&mut self) -> Option<QuotaEntry> {
        let entry = self.order.pop_front()?;
        self.ids.remove(&entry.message_id);
        Some(entry)
    }
}

/// Fixed-capacity FIFO store of delivery keys.
pub struct QuotaStore {
    path: Option<PathBuf>,
    capacity: usize,
    safety_margin: usize,
    eviction_batch: usize,
    slots: Mutex<Slots>,
}

impl QuotaStore {
    /// Create an empty, non-persistent store.
    pub fn in_memory(config: &QuotaConfig) -> Self {
        Self {
            path: None,
            capacity: config.capacity.max(1),
            safety_margin: config.safety_margin,
            eviction_batch: config.eviction_batch.max(1),
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Open a store backed by a snapshot file.
    ///
    /// A missing or unreadable snapshot yields an empty store: losing the
    /// cache only costs extra ledger lookups.
    pub fn open(path: impl AsRef<Path>, config: &QuotaConfig) -> Self {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            path: Some(path.clone()),
            ..Self::in_memory(config)
        };
        let entries = match read_snapshot(&path) {
            Ok(Some(snapshot)) => {
                debug!(path = %path.display(), count = snapshot.entries.len(), "Loaded quota snapshot");
                if snapshot.capacity != store.capacity as u64 {
                    info!(
                        previous = snapshot.capacity,
                        current = store.capacity,
                        "Quota capacity changed since last save"
                    );
                }
                snapshot.entries
            }
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable quota snapshot");
                Vec::new()
            }
        };
        let mut slots = Slots::from_entries(entries);
        // A snapshot written under a larger capacity keeps only its newest ids.
        store.trim_preserving(&mut slots, &HashSet::new());
        *store.lock() = slots;
        store
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Membership test. `false` is never definitive.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().ids.contains(id)
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<QuotaEntry> {
        self.lock().order.iter().cloned().collect()
    }

    /// Insert `id`, evicting a batch of the oldest entries first when the
    /// store is within `safety_margin` of its capacity.
    pub fn try_insert(&self, id: &str) -> InsertOutcome {
        self.try_insert_at(id, Utc::now())
    }

    /// [`try_insert`](Self::try_insert) with an explicit insertion time.
    pub fn try_insert_at(&self, id: &str, now: DateTime<Utc>) -> InsertOutcome {
        let mut slots = self.lock();
        if slots.ids.contains(id) {
            return InsertOutcome::default();
        }

        let evicted = self.make_room(&mut slots);
        slots.ids.insert(id.to_string());
        slots.order.push_back(QuotaEntry {
            message_id: id.to_string(),
            inserted_at: now,
        });
        slots.fresh.insert(id.to_string());
        slots.removed.remove(id);

        if evicted > 0 {
            debug!(evicted, size = slots.order.len(), "Evicted oldest quota entries");
        }
        InsertOutcome {
            inserted: true,
            evicted,
        }
    }

    /// Drop `id` if present.
    pub fn remove(&self, id: &str) -> bool {
        let mut slots = self.lock();
        if !slots.ids.remove(id) {
            return false;
        }
        slots.order.retain(|e| e.message_id != id);
        slots.fresh.remove(id);
        slots.removed.insert(id.to_string());
        true
    }

    /// Drop every entry inserted before `cutoff`. Returns the number removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut slots = self.lock();
        let (expired, kept): (Vec<QuotaEntry>, Vec<QuotaEntry>) =
            slots.order.drain(..).partition(|e| e.inserted_at < cutoff);
        slots.order = kept.into();
        for entry in &expired {
            slots.ids.remove(&entry.message_id);
            slots.fresh.remove(&entry.message_id);
            slots.removed.insert(entry.message_id.clone());
        }
        expired.len()
    }

    /// Write the snapshot, merging entries another process saved meanwhile.
    ///
    /// Entries inserted through this handle survive the merge even when the
    /// combined set exceeds capacity; older foreign entries are evicted
    /// instead. No-op for in-memory stores.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let on_disk = read_snapshot(path)
            .ok()
            .flatten()
            .map(|snapshot| snapshot.entries)
            .unwrap_or_default();

        let mut slots = self.lock();
        let mut combined: Vec<QuotaEntry> = slots.order.iter().cloned().collect();
        for entry in on_disk {
            if !slots.ids.contains(&entry.message_id) && !slots.removed.contains(&entry.message_id)
            {
                combined.push(entry);
            }
        }
        let fresh = std::mem::take(&mut slots.fresh);
        let removed = std::mem::take(&mut slots.removed);
        let mut merged = Slots::from_entries(combined);
        self.trim_preserving(&mut merged, &fresh);
        merged.fresh = fresh;
        merged.removed = removed;
        *slots = merged;

        write_snapshot(path, self.capacity, &slots.order)?;
        info!(path = %path.display(), count = slots.order.len(), "Quota snapshot written");
        Ok(())
    }

    /// Size at which eviction kicks in.
    fn threshold(&self) -> usize {
        self.capacity.saturating_sub(self.safety_margin).max(1)
    }

    fn make_room(&self, slots: &mut Slots) -> usize {
        let mut evicted = 0;
        while slots.order.len() >= self.threshold() {
            for _ in 0..self.eviction_batch {
                if slots.pop_oldest().is_none() {
                    break;
                }
                evicted += 1;
            }
        }
        evicted
    }

    /// Bring a merged set back under the threshold without dropping `fresh` ids.
    fn trim_preserving(&self, slots: &mut Slots, fresh: &HashSet<String>) {
        let limit = self.threshold();
        let mut kept = VecDeque::with_capacity(slots.order.len());
        let mut excess = slots.order.len().saturating_sub(limit);
        while let Some(entry) = slots.order.pop_front() {
            if excess > 0 {
                if fresh.contains(&entry.message_id) {
                    // A concurrent writer pushed our own insert out; keep it.
                    debug!(
                        error = %LedgerError::QuotaEvictionRace(entry.message_id.clone()),
                        "Re-inserting quota entry lost to a concurrent eviction"
                    );
                } else {
                    slots.ids.remove(&entry.message_id);
                    excess -= 1;
                    continue;
                }
            }
            kept.push_back(entry);
        }
        slots.order = kept;
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // The slot state stays consistent even if a holder panicked.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decoded snapshot file.
struct Snapshot {
    /// Capacity of the store that wrote it.
    capacity: u64,
    entries: Vec<QuotaEntry>,
}

/// Read a snapshot. `Ok(None)` when the file does not exist.
fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path).map_err(|e| LedgerError::io(path, e))?;
    let invalid = |reason: String| LedgerError::InvalidSnapshot {
        path: path.to_path_buf(),
        reason,
    };

    if data.len() < HEADER_SIZE {
        return Err(invalid("File too small".into()));
    }
    let header: SnapshotHeader = bincode::deserialize(&data[..HEADER_SIZE])
        .map_err(|e| invalid(format!("Header deserialization failed: {e}")))?;
    let payload = &data[HEADER_SIZE..];
    header.validate(payload).map_err(invalid)?;

    let entries: Vec<QuotaEntry> = bincode::deserialize(payload)
        .map_err(|e| invalid(format!("Entry deserialization failed: {e}")))?;
    if entries.len() as u64 != header.entry_count {
        return Err(invalid("Entry count mismatch".into()));
    }
    Ok(Some(Snapshot {
        capacity: header.capacity,
        entries,
    }))
}

/// Write header + entries through a temporary file, then rename into place.
fn write_snapshot(path: &Path, capacity: usize, entries: &VecDeque<QuotaEntry>) -> Result<()> {
    let entries: Vec<&QuotaEntry> = entries.iter().collect();
    let payload = bincode::serialize(&entries).map_err(|e| LedgerError::InvalidSnapshot {
        path: path.to_path_buf(),
        reason: format!("Entry serialization failed: {e}"),
    })?;
    let header = SnapshotHeader::new(capacity, entries.len(), &payload);
    let header_bytes = bincode::serialize(&header).map_err(|e| LedgerError::InvalidSnapshot {
        path: path.to_path_buf(),
        reason: format!("Header serialization failed: {e}"),
    })?;

    // Pad header to HEADER_SIZE
    let mut padded_header = vec![0u8; HEADER_SIZE];
    let copy_len = header_bytes.len().min(HEADER_SIZE);
    padded_header[..copy_len].copy_from_slice(&header_bytes[..copy_len]);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
    }
    let tmp = path.with_extension("bin.tmp");
    let mut file = File::create(&tmp).map_err(|e| LedgerError::io(&tmp, e))?;
    file.write_all(&padded_header)
        .map_err(|e| LedgerError::io(&tmp, e))?;
    file.write_all(&payload).map_err(|e| LedgerError::io(&tmp, e))?;
    file.flush().map_err(|e| LedgerError::io(&tmp, e))?;
    drop(file);
    std::fs::rename(&tmp, path).map_err(|e| LedgerError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn config(capacity: usize, safety_margin: usize, eviction_batch: usize) -> QuotaConfig {
        QuotaConfig {
            capacity,
            safety_margin,
            eviction_batch,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 22, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_insert_and_contains() {
        let store = QuotaStore::in_memory(&config(10, 0, 1));
        assert!(store.try_insert("a").inserted);
        assert!(!store.try_insert("a").inserted);
        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_batch_eviction_is_fifo() {
        // threshold = 10 - 2 = 8, batch of 3
        let store = QuotaStore::in_memory(&config(10, 2, 3));
        for i in 0..8 {
            store.try_insert_at(&format!("m{i}"), t0() + Duration::seconds(i));
        }
        let outcome = store.try_insert_at("m8", t0() + Duration::seconds(8));
        assert_eq!(
            outcome,
            InsertOutcome {
                inserted: true,
                evicted: 3
            }
        );
        for i in 0..3 {
            assert!(!store.contains(&format!("m{i}")));
        }
        for i in 3..9 {
            assert!(store.contains(&format!("m{i}")));
        }
    }

    #[test]
    fn test_capacity_plus_one_only_recent_ids_present() {
        let cap = 12;
        let store = QuotaStore::in_memory(&config(cap, 2, 4));
        let ids: Vec<String> = (0..=cap).map(|i| format!("id{i}")).collect();
        for id in &ids {
            let outcome = store.try_insert(id);
            assert!(outcome.inserted);
            assert!(store.contains(id), "inserted id must never be evicted");
            assert!(store.len() <= cap);
        }
        let recent = &ids[ids.len() - cap..];
        for id in &ids {
            if store.contains(id) {
                assert!(recent.contains(id), "{id} is too old to be present");
            }
        }
    }

    #[test]
    fn test_purge_older_than() {
        let store = QuotaStore::in_memory(&config(50, 5, 10));
        store.try_insert_at("old", t0());
        store.try_insert_at("new", t0() + Duration::days(10));
        assert_eq!(store.purge_older_than(t0() + Duration::days(1)), 1);
        assert!(!store.contains("old"));
        assert!(store.contains("new"));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.bin");
        let cfg = config(50, 5, 10);

        let store = QuotaStore::open(&path, &cfg);
        store.try_insert_at("first", t0());
        store.try_insert_at("second", t0() + Duration::seconds(1));
        store.save().unwrap();

        let reopened = QuotaStore::open(&path, &cfg);
        let ids: Vec<String> = reopened.entries().into_iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_reopen_with_smaller_capacity_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.bin");

        let large = QuotaStore::open(&path, &config(50, 5, 10));
        for i in 0..20 {
            large.try_insert_at(&format!("m{i}"), t0() + Duration::seconds(i));
        }
        large.save().unwrap();

        // threshold = 4 - 1 = 3
        let small = QuotaStore::open(&path, &config(4, 1, 1));
        assert!(small.len() <= 3);
        for i in 17..20 {
            assert!(small.contains(&format!("m{i}")));
        }
        assert!(!small.contains("m0"));

        let outcome = small.try_insert_at("next", t0() + Duration::seconds(30));
        assert!(outcome.inserted);
        assert!(small.len() <= 4);
    }

    #[test]
    fn test_corrupt_snapshot_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.bin");
        std::fs::write(&path, b"definitely not a snapshot").unwrap();
        let store = QuotaStore::open(&path, &config(50, 5, 10));
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_merges_concurrent_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.bin");
        let cfg = config(50, 5, 10);

        let a = QuotaStore::open(&path, &cfg);
        let b = QuotaStore::open(&path, &cfg);
        a.try_insert_at("from-a", t0());
        b.try_insert_at("from-b", t0() + Duration::seconds(1));
        a.save().unwrap();
        b.save().unwrap();

        let merged = QuotaStore::open(&path, &cfg);
        assert!(merged.contains("from-a"));
        assert!(merged.contains("from-b"));
    }

    #[test]
    fn test_save_keeps_own_inserts_over_foreign_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.bin");
        // threshold = 3
        let cfg = config(4, 1, 1);

        let other = QuotaStore::open(&path, &cfg);
        let mine = QuotaStore::open(&path, &cfg);
        for i in 0..2 {
            other.try_insert_at(&format!("foreign{i}"), t0() + Duration::seconds(10 + i));
        }
        other.save().unwrap();
        mine.try_insert_at("mine0", t0());
        mine.try_insert_at("mine1", t0() + Duration::seconds(1));
        mine.save().unwrap();

        assert!(mine.contains("mine0"));
        assert!(mine.contains("mine1"));
        assert!(mine.len() <= 3);
    }

    #[test]
    fn test_removed_ids_are_not_resurrected_by_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.bin");
        let cfg = config(50, 5, 10);

        let store = QuotaStore::open(&path, &cfg);
        store.try_insert_at("gone", t0());
        store.save().unwrap();

        let again = QuotaStore::open(&path, &cfg);
        assert!(again.remove("gone"));
        again.save().unwrap();
        assert!(!QuotaStore::open(&path, &cfg).contains("gone"));
    }
}
