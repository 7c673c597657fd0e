//! In-memory position index
//!
//! Maps `(collection, id)` to the byte locations of an entry in the content and
//! embedding logs. It is rebuilt at open by replaying the index log from offset
//! zero; later records for the same key win, and tombstones delete the key.
//!
//! Concurrency: one writer (holding the store's I/O lock) mutates the index by
//! inserting or removing whole entries. Readers take short `RwLock` read
//! guards, copy what they need and release them, so a long search never holds
//! the writer up.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::format::{scan_index_log, IndexLogScan, IndexOp, IndexRecord, Position};

/// Entries of one collection, ordered by id
#[derive(Default)]
pub struct CollectionIndex {
    entries: RwLock<BTreeMap<u64, Position>>,
}

impl CollectionIndex {
    pub fn get(&self, id: u64) -> Option<Position> {
        self.entries.read().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of every `(id, position)` pair, ascending by id
    pub fn positions(&self) -> Vec<(u64, Position)> {
        self.entries.read().iter().map(|(id, p)| (*id, *p)).collect()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.read().keys().copied().collect()
    }
}

/// Summary of an index-log replay
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: usize,
    pub tombstones: usize,
    /// Bytes of the log covered by complete records
    pub valid_len: u64,
    /// Bytes after the last complete record (torn or malformed tail)
    pub ignored_tail: u64,
}

#[derive(Default)]
pub struct PositionIndex {
    collections: RwLock<HashMap<String, Arc<CollectionIndex>>>,
    /// Highest id ever seen, live or tombstoned
    max_id: AtomicU64,
}

impl PositionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the raw bytes of an index log
    pub fn replay(bytes: &[u8]) -> (Self, ReplayStats) {
        let scan = scan_index_log(bytes);
        Self::from_scan(&scan, bytes.len())
    }

    /// Rebuild from an already decoded index log of `total_len` bytes
    pub fn from_scan(scan: &IndexLogScan, total_len: usize) -> (Self, ReplayStats) {
        let stats = ReplayStats {
            records: scan.records.len(),
            tombstones: scan
                .records
                .iter()
                .filter(|r| r.op == IndexOp::Tombstone)
                .count(),
            valid_len: scan.valid_len as u64,
            ignored_tail: scan.trailing_bytes(total_len) as u64,
        };

        if let Some(reason) = &scan.malformed {
            tracing::warn!(
                "index log replay stopped at offset {}: {reason}",
                scan.valid_len
            );
        } else if stats.ignored_tail > 0 {
            tracing::warn!(
                "ignoring {} trailing bytes of an incomplete index record",
                stats.ignored_tail
            );
        }

        (Self::from_records(&scan.records), stats)
    }

    /// Apply `records` in log order to an empty index
    pub fn from_records(records: &[IndexRecord]) -> Self {
        let index = Self::new();
        for record in records {
            index.apply(record);
        }
        index
    }

    /// Apply one record: upsert or delete the key, and advance the id mark
    pub fn apply(&self, record: &IndexRecord) {
        self.max_id.fetch_max(record.id, Ordering::AcqRel);
        match record.op {
            IndexOp::Upsert(position) => {
                let collection = self.collection_or_insert(&record.collection);
                collection.entries.write().insert(record.id, position);
            }
            IndexOp::Tombstone => {
                if let Some(collection) = self.collection(&record.collection) {
                    collection.entries.write().remove(&record.id);
                }
            }
        }
    }

    /// Drop a key without writing anything; used for entries that fail
    /// verification at open
    pub fn forget(&self, collection: &str, id: u64) -> Option<Position> {
        self.collection(collection)?.entries.write().remove(&id)
    }

    fn collection_or_insert(&self, name: &str) -> Arc<CollectionIndex> {
        if let Some(existing) = self.collections.read().get(name) {
            return Arc::clone(existing);
        }
        let mut collections = self.collections.write();
        Arc::clone(collections.entry(name.to_string()).or_default())
    }

    pub fn collection(&self, name: &str) -> Option<Arc<CollectionIndex>> {
        self.collections.read().get(name).cloned()
    }

    pub fn get(&self, collection: &str, id: u64) -> Option<Position> {
        self.collection(collection)?.get(id)
    }

    /// Names of collections holding at least one live entry, sorted
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .iter()
            .filter(|(_, c)| !c.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Live entries across all collections
    pub fn len(&self) -> usize {
        self.collections.read().values().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest id recorded so far (0 when nothing was ever written)
    #[inline]
    pub fn max_id(&self) -> u64 {
        self.max_id.load(Ordering::Acquire)
    }

    /// Ordered copy of the whole mapping
    pub fn snapshot(&self) -> BTreeMap<(String, u64), Position> {
        let collections = self.collections.read();
        let mut out = BTreeMap::new();
        for (name, collection) in collections.iter() {
            for (id, pos) in collection.positions() {
                out.insert((name.clone(), id), pos);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(offset: u64) -> Position {
        Position {
            content_offset: offset,
            embedding_offset: offset * 2,
            dimensions: 4,
            content_len: 3,
        }
    }

    fn log(records: &[IndexRecord]) -> Vec<u8> {
        let mut buf = Vec::new();
        for r in records {
            r.encode_into(&mut buf);
        }
        buf
    }

    #[test]
    fn test_replay_last_write_wins() {
        let bytes = log(&[
            IndexRecord::upsert(1, "a", pos(0)),
            IndexRecord::upsert(2, "a", pos(11)),
            IndexRecord::upsert(1, "a", pos(22)),
        ]);
        let (index, stats) = PositionIndex::replay(&bytes);

        assert_eq!(stats.records, 3);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("a", 1), Some(pos(22)));
        assert_eq!(index.max_id(), 2);
    }

    #[test]
    fn test_same_id_in_different_collections() {
        let bytes = log(&[
            IndexRecord::upsert(1, "a", pos(0)),
            IndexRecord::upsert(1, "b", pos(5)),
        ]);
        let (index, _) = PositionIndex::replay(&bytes);
        assert_eq!(index.get("a", 1), Some(pos(0)));
        assert_eq!(index.get("b", 1), Some(pos(5)));
        assert_eq!(index.collection_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_tombstone_removes_but_keeps_id_mark() {
        let bytes = log(&[
            IndexRecord::upsert(1, "a", pos(0)),
            IndexRecord::upsert(2, "a", pos(11)),
            IndexRecord::tombstone(2, "a"),
        ]);
        let (index, stats) = PositionIndex::replay(&bytes);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(index.get("a", 2), None);
        assert_eq!(index.max_id(), 2);
        assert_eq!(index.collection("a").unwrap().ids(), vec![1]);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let bytes = log(&[
            IndexRecord::upsert(3, "x", pos(1)),
            IndexRecord::upsert(4, "y", pos(2)),
            IndexRecord::tombstone(3, "x"),
            IndexRecord::upsert(5, "x", pos(3)),
        ]);
        let (first, _) = PositionIndex::replay(&bytes);
        let (second, _) = PositionIndex::replay(&bytes);
        assert_eq!(first.snapshot(), second.snapshot());
    }

    #[test]
    fn test_replay_empty_and_torn() {
        let (index, stats) = PositionIndex::replay(&[]);
        assert!(index.is_empty());
        assert_eq!(stats, ReplayStats::default());

        let mut bytes = log(&[IndexRecord::upsert(1, "a", pos(0))]);
        let good = bytes.len();
        bytes.extend_from_slice(&[7u8; 5]);
        let (index, stats) = PositionIndex::replay(&bytes);
        assert_eq!(index.len(), 1);
        assert_eq!(stats.valid_len, good as u64);
        assert_eq!(stats.ignored_tail, 5);
    }

    #[test]
    fn test_forget() {
        let index = PositionIndex::new();
        index.apply(&IndexRecord::upsert(9, "a", pos(0)));
        assert_eq!(index.forget("a", 9), Some(pos(0)));
        assert_eq!(index.forget("a", 9), None);
        assert!(index.collection_names().is_empty());
        assert_eq!(index.max_id(), 9);
    }
}
