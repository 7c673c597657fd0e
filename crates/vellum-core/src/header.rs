//! Derived store header
//!
//! The header is never persisted on its own. It is recomputed at every open
//! from the replayed position index, so the logs stay the only source of truth.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::format::{IndexOp, IndexRecord};
use crate::index::PositionIndex;

/// Physical file lengths at open, plus the replayable prefix of the index log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogLengths {
    pub content: u64,
    pub embeddings: u64,
    pub index_valid: u64,
}

/// Plain copy of the header values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSnapshot {
    pub total_entity_count: u64,
    pub embedding_dimensionality: usize,
    pub content_write_offset: u64,
    pub embedding_write_offset: u64,
    pub index_write_offset: u64,
}

pub struct StoreHeader {
    /// High-water mark for id assignment
    total_entity_count: AtomicU64,
    embedding_dimensionality: usize,
    content_write_offset: AtomicU64,
    embedding_write_offset: AtomicU64,
    index_write_offset: AtomicU64,
}

impl StoreHeader {
    /// Derive the header from the replayed index log.
    ///
    /// Write offsets are the end of the furthest record any upsert in the log
    /// ever referenced, ignoring references past the physical end of a log
    /// (their bytes never reached disk). Anything past the derived offset is
    /// preallocated space or a crash orphan, and gets reused.
    pub fn derive(
        index: &PositionIndex,
        records: &[IndexRecord],
        log_lengths: LogLengths,
        dimensionality: usize,
        element_size: usize,
    ) -> Self {
        let mut content_end = 0u64;
        let mut embedding_end = 0u64;
        for record in records {
            let IndexOp::Upsert(pos) = record.op else {
                continue;
            };
            let c = pos.content_end();
            if c <= log_lengths.content {
                content_end = content_end.max(c);
            }
            let e = pos.embedding_end(element_size);
            if e <= log_lengths.embeddings {
                embedding_end = embedding_end.max(e);
            }
        }

        Self {
            total_entity_count: AtomicU64::new(index.max_id()),
            embedding_dimensionality: dimensionality,
            content_write_offset: AtomicU64::new(content_end),
            embedding_write_offset: AtomicU64::new(embedding_end),
            index_write_offset: AtomicU64::new(log_lengths.index_valid),
        }
    }

    /// Reserve the next id. Ids start at 1 and are never handed out twice.
    #[inline]
    pub fn next_id(&self) -> u64 {
        self.total_entity_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn total_entity_count(&self) -> u64 {
        self.total_entity_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn embedding_dimensionality(&self) -> usize {
        self.embedding_dimensionality
    }

    pub fn content_write_offset(&self) -> u64 {
        self.content_write_offset.load(Ordering::Acquire)
    }

    pub fn embedding_write_offset(&self) -> u64 {
        self.embedding_write_offset.load(Ordering::Acquire)
    }

    pub fn index_write_offset(&self) -> u64 {
        self.index_write_offset.load(Ordering::Acquire)
    }

    /// Record the log ends after an append
    pub fn record_write(&self, content_end: u64, embedding_end: u64, index_end: u64) {
        self.content_write_offset.store(content_end, Ordering::Release);
        self.embedding_write_offset.store(embedding_end, Ordering::Release);
        self.index_write_offset.store(index_end, Ordering::Release);
    }

    pub fn snapshot(&self) -> HeaderSnapshot {
        HeaderSnapshot {
            total_entity_count: self.total_entity_count(),
            embedding_dimensionality: self.embedding_dimensionality,
            content_write_offset: self.content_write_offset(),
            embedding_write_offset: self.embedding_write_offset(),
            index_write_offset: self.index_write_offset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Position;

    #[test]
    fn test_derive_from_empty_index() {
        let header = StoreHeader::derive(&PositionIndex::new(), &[], LogLengths::default(), 8, 4);
        let snap = header.snapshot();
        assert_eq!(snap.total_entity_count, 0);
        assert_eq!(snap.content_write_offset, 0);
        assert_eq!(snap.embedding_write_offset, 0);
        assert_eq!(header.next_id(), 1);
        assert_eq!(header.next_id(), 2);
    }

    #[test]
    fn test_derive_uses_furthest_record() {
        let records = vec![
            IndexRecord::upsert(
                4,
                "a",
                Position {
                    content_offset: 100,
                    embedding_offset: 0,
                    dimensions: 2,
                    content_len: 5,
                },
            ),
            IndexRecord::upsert(
                2,
                "b",
                Position {
                    content_offset: 0,
                    embedding_offset: 16,
                    dimensions: 2,
                    content_len: 90,
                },
            ),
            IndexRecord::tombstone(4, "a"),
            IndexRecord::tombstone(7, "b"),
        ];
        let index = PositionIndex::from_records(&records);
        let lengths = LogLengths {
            content: 200,
            embeddings: 64,
            index_valid: 321,
        };

        let header = StoreHeader::derive(&index, &records, lengths, 2, 4);
        let snap = header.snapshot();
        assert_eq!(snap.total_entity_count, 7);
        // Tombstoned records still hold their bytes
        assert_eq!(snap.content_write_offset, 113);
        assert_eq!(snap.embedding_write_offset, 16 + 8 + 8);
        assert_eq!(snap.index_write_offset, 321);
        assert_eq!(header.next_id(), 8);
    }

    #[test]
    fn test_derive_ignores_references_past_file_end() {
        let records = vec![
            IndexRecord::upsert(
                1,
                "a",
                Position {
                    content_offset: 0,
                    embedding_offset: 0,
                    dimensions: 1,
                    content_len: 2,
                },
            ),
            IndexRecord::upsert(
                2,
                "a",
                Position {
                    content_offset: 10,
                    embedding_offset: 12,
                    dimensions: 1,
                    content_len: 2,
                },
            ),
        ];
        let index = PositionIndex::from_records(&records);
        let lengths = LogLengths {
            content: 10,
            embeddings: 12,
            index_valid: 0,
        };
        let snap = StoreHeader::derive(&index, &records, lengths, 1, 4).snapshot();
        assert_eq!(snap.content_write_offset, 10);
        assert_eq!(snap.embedding_write_offset, 12);
    }
}
