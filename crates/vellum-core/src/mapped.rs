//! Read-only memory-mapped views over the content and embedding logs
//!
//! Reads never go through the writer's file handles. Each log gets its own
//! read-only mapping; after a flush the reader maps the file again and swaps
//! the snapshot in with `ArcSwap`. Readers holding the old snapshot keep a
//! valid mapping until they drop it.
//!
//! A snapshot only exposes bytes up to the write offsets captured at the
//! flush that produced it. Preallocated files are longer than their data, and
//! the zero fill past the offset must read as "not written yet", not as a
//! record with a bad id.
//!
//! # Safety
//!
//! Mapping a file is unsafe because another process could truncate it while it
//! is mapped. The logs are only ever appended to (or grown with `set_len`) by
//! this process, so every byte inside a snapshot stays valid for its lifetime.
//! Every record access is bounds-checked against the snapshot length before
//! the bytes are touched.

use std::borrow::Cow;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use memmap2::Mmap;
use parking_lot::Mutex;
use thiserror::Error;

use crate::format::{read_id, Position, ID_SIZE};
use crate::quantize::{ElementType, StoredVector};

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("{log} log corrupt at offset {offset}: expected id {expected}, found {found}")]
    IdMismatch {
        log: &'static str,
        offset: u64,
        expected: u64,
        found: u64,
    },

    #[error("content for id {id} at offset {offset} is not valid utf-8")]
    InvalidUtf8 { id: u64, offset: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One immutable mapping of a log file
pub struct MappedLog {
    mmap: Option<Mmap>,
    visible: usize,
}

impl MappedLog {
    pub fn empty() -> Self {
        Self {
            mmap: None,
            visible: 0,
        }
    }

    /// Map the file as it is right now, exposing at most `limit` bytes
    /// (`None` exposes the whole file)
    pub fn open<P: AsRef<Path>>(path: P, limit: Option<u64>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(Self::empty());
        }
        // SAFETY: see module docs; the file is append-only for our lifetime
        let mmap = unsafe { Mmap::map(&file)? };
        let visible = limit.map_or(len, |l| l.min(len));
        Ok(Self {
            visible: usize::try_from(visible).unwrap_or(mmap.len()).min(mmap.len()),
            mmap: Some(mmap),
        })
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        match &self.mmap {
            Some(mmap) => &mmap[..self.visible],
            None => &[],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes `[start, end)` if they are all inside the mapping
    #[inline]
    fn range(&self, start: u64, end: u64) -> Option<&[u8]> {
        let start = usize::try_from(start).ok()?;
        let end = usize::try_from(end).ok()?;
        self.bytes().get(start..end)
    }
}

/// The pair of mappings readers see between two flushes
pub struct LogSnapshot {
    pub content: MappedLog,
    pub embeddings: MappedLog,
}

impl LogSnapshot {
    /// Content text for `id` at `pos`.
    ///
    /// `Ok(None)` means the record lies past the mapped end, i.e. it has not
    /// been flushed since the last remap. A mismatched id prefix is corruption.
    pub fn content(&self, id: u64, pos: &Position) -> Result<Option<&str>, ReadError> {
        let Some(record) = self.content.range(pos.content_offset, pos.content_end()) else {
            return Ok(None);
        };
        check_id("content", record, pos.content_offset, id)?;
        let text = std::str::from_utf8(&record[ID_SIZE..]).map_err(|_| ReadError::InvalidUtf8 {
            id,
            offset: pos.content_offset,
        })?;
        Ok(Some(text))
    }

    /// Stored vector for `id` at `pos`, borrowed from the mapping when the
    /// element alignment allows it
    pub fn vector(
        &self,
        id: u64,
        pos: &Position,
        element: ElementType,
    ) -> Result<Option<StoredVector<'_>>, ReadError> {
        let Some(record) = self
            .embeddings
            .range(pos.embedding_offset, pos.embedding_end(element.size()))
        else {
            return Ok(None);
        };
        check_id("embedding", record, pos.embedding_offset, id)?;
        let body = &record[ID_SIZE..];

        let stored = match element {
            ElementType::I8 => StoredVector::I8(bytemuck::cast_slice(body)),
            ElementType::F32 => StoredVector::F32(f32_view(body)),
        };
        Ok(Some(stored))
    }
}

#[inline]
fn check_id(log: &'static str, record: &[u8], offset: u64, expected: u64) -> Result<(), ReadError> {
    // Callers pass a range of at least ID_SIZE bytes
    let found = read_id(record, 0).unwrap_or(u64::MAX);
    if found != expected {
        return Err(ReadError::IdMismatch {
            log,
            offset,
            expected,
            found,
        });
    }
    Ok(())
}

/// Zero-copy on little-endian targets when the bytes are 4-byte aligned,
/// a decoded copy otherwise
fn f32_view(bytes: &[u8]) -> Cow<'_, [f32]> {
    if cfg!(target_endian = "little") {
        if let Ok(floats) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
            return Cow::Borrowed(floats);
        }
    }
    Cow::Owned(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Visible end of each log in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleEnds {
    pub content: u64,
    pub embeddings: u64,
}

/// Holds the current snapshot and remaps on demand
pub struct MappedReader {
    content_path: PathBuf,
    embeddings_path: PathBuf,
    current: ArcSwap<LogSnapshot>,
    /// Ends of the last remap; `None` while the open-time full mapping is live
    published: Mutex<Option<VisibleEnds>>,
}

impl MappedReader {
    /// Map both logs in full. Used at open, before the write offsets are known.
    pub fn open(content_path: PathBuf, embeddings_path: PathBuf) -> std::io::Result<Self> {
        let snapshot = Self::map(&content_path, &embeddings_path, None)?;
        Ok(Self {
            content_path,
            embeddings_path,
            current: ArcSwap::from_pointee(snapshot),
            published: Mutex::new(None),
        })
    }

    fn map(
        content: &Path,
        embeddings: &Path,
        ends: Option<VisibleEnds>,
    ) -> std::io::Result<LogSnapshot> {
        Ok(LogSnapshot {
            content: MappedLog::open(content, ends.map(|e| e.content))?,
            embeddings: MappedLog::open(embeddings, ends.map(|e| e.embeddings))?,
        })
    }

    /// Map both files again and publish a snapshot that ends at `ends`.
    ///
    /// After the first call the visible ends only move forward: a flush that
    /// captured its ends earlier but remaps later cannot hide data a newer
    /// flush already published.
    pub fn remap(&self, ends: VisibleEnds) -> std::io::Result<()> {
        let mut published = self.published.lock();
        let ends = match *published {
            Some(prev) => VisibleEnds {
                content: ends.content.max(prev.content),
                embeddings: ends.embeddings.max(prev.embeddings),
            },
            None => ends,
        };
        let snapshot = Self::map(&self.content_path, &self.embeddings_path, Some(ends))?;
        tracing::debug!(
            "remapped logs: content={} bytes embeddings={} bytes",
            snapshot.content.len(),
            snapshot.embeddings.len()
        );
        self.current.store(Arc::new(snapshot));
        *published = Some(ends);
        Ok(())
    }

    /// Snapshot valid until the caller drops it
    #[inline]
    pub fn snapshot(&self) -> Arc<LogSnapshot> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{encode_content_record, encode_embedding_record};
    use crate::quantize::Quantization;
    use tempfile::tempdir;

    fn write_logs(dir: &Path) -> (PathBuf, PathBuf, Position) {
        let content_path = dir.join("t.content");
        let embeddings_path = dir.join("t.embeddings");

        let mut content = Vec::new();
        encode_content_record(1, "first", &mut content);
        let content_offset = content.len() as u64;
        encode_content_record(2, "zweite Zeile ✓", &mut content);

        let mut quantized = Vec::new();
        Quantization::float32()
            .encode_into(&[1.0, 2.0, 3.0], &mut quantized)
            .unwrap();
        let mut embeddings = Vec::new();
        encode_embedding_record(1, &quantized, &mut embeddings);
        let embedding_offset = embeddings.len() as u64;
        encode_embedding_record(2, &quantized, &mut embeddings);

        std::fs::write(&content_path, &content).unwrap();
        std::fs::write(&embeddings_path, &embeddings).unwrap();

        let pos = Position {
            content_offset,
            embedding_offset,
            dimensions: 3,
            content_len: "zweite Zeile ✓".len() as u64,
        };
        (content_path, embeddings_path, pos)
    }

    #[test]
    fn test_read_content_and_vector() {
        let dir = tempdir().unwrap();
        let (c, e, pos) = write_logs(dir.path());
        let reader = MappedReader::open(c, e).unwrap();
        let snap = reader.snapshot();

        assert_eq!(snap.content(2, &pos).unwrap(), Some("zweite Zeile ✓"));
        match snap.vector(2, &pos, ElementType::F32).unwrap() {
            Some(StoredVector::F32(v)) => assert_eq!(&*v, &[1.0, 2.0, 3.0]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_id_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let (c, e, pos) = write_logs(dir.path());
        let reader = MappedReader::open(c, e).unwrap();
        let snap = reader.snapshot();

        assert!(matches!(
            snap.content(1, &pos),
            Err(ReadError::IdMismatch { expected: 1, found: 2, .. })
        ));
        assert!(matches!(
            snap.vector(7, &pos, ElementType::F32),
            Err(ReadError::IdMismatch { log: "embedding", .. })
        ));
    }

    #[test]
    fn test_past_mapped_end_is_not_visible_until_remap() {
        let dir = tempdir().unwrap();
        let content_path = dir.path().join("t.content");
        let embeddings_path = dir.path().join("t.embeddings");
        std::fs::write(&content_path, b"").unwrap();
        std::fs::write(&embeddings_path, b"").unwrap();

        let reader = MappedReader::open(content_path.clone(), embeddings_path).unwrap();
        let pos = Position {
            content_offset: 0,
            embedding_offset: 0,
            dimensions: 1,
            content_len: 2,
        };
        let old = reader.snapshot();
        assert_eq!(old.content(5, &pos).unwrap(), None);

        let mut content = Vec::new();
        encode_content_record(5, "hi", &mut content);
        std::fs::write(&content_path, &content).unwrap();

        assert_eq!(reader.snapshot().content(5, &pos).unwrap(), None);
        reader
            .remap(VisibleEnds {
                content: content.len() as u64,
                embeddings: 0,
            })
            .unwrap();
        assert_eq!(reader.snapshot().content(5, &pos).unwrap(), Some("hi"));
        // A snapshot taken before the remap keeps its own view
        assert_eq!(old.content(5, &pos).unwrap(), None);
    }

    #[test]
    fn test_preallocated_tail_is_hidden() {
        let dir = tempdir().unwrap();
        let content_path = dir.path().join("t.content");
        let embeddings_path = dir.path().join("t.embeddings");

        let mut content = Vec::new();
        encode_content_record(1, "abc", &mut content);
        let written = content.len() as u64;
        content.resize(256, 0);
        std::fs::write(&content_path, &content).unwrap();
        std::fs::write(&embeddings_path, b"").unwrap();

        let reader = MappedReader::open(content_path, embeddings_path).unwrap();
        let zero_fill = Position {
            content_offset: written,
            embedding_offset: 0,
            dimensions: 1,
            content_len: 3,
        };
        // Fully mapped, the zero fill looks like a record with id 0
        assert!(reader.snapshot().content(2, &zero_fill).is_err());

        reader
            .remap(VisibleEnds {
                content: written,
                embeddings: 0,
            })
            .unwrap();
        let snap = reader.snapshot();
        assert_eq!(snap.content.len() as u64, written);
        assert_eq!(snap.content(2, &zero_fill).unwrap(), None);
        let first = Position {
            content_len: 3,
            ..Default::default()
        };
        assert_eq!(snap.content(1, &first).unwrap(), Some("abc"));
    }

    #[test]
    fn test_remap_never_shrinks_visible_ends() {
        let dir = tempdir().unwrap();
        let (c, e, pos) = write_logs(dir.path());
        let full = VisibleEnds {
            content: std::fs::metadata(&c).unwrap().len(),
            embeddings: std::fs::metadata(&e).unwrap().len(),
        };
        let reader = MappedReader::open(c, e).unwrap();

        // Two flushes remapping out of order: the later, larger one wins
        reader.remap(full).unwrap();
        reader
            .remap(VisibleEnds {
                content: pos.content_offset,
                embeddings: pos.embedding_offset,
            })
            .unwrap();
        let snap = reader.snapshot();
        assert_eq!(snap.content.len() as u64, full.content);
        assert_eq!(snap.embeddings.len() as u64, full.embeddings);
        assert_eq!(snap.content(2, &pos).unwrap(), Some("zweite Zeile ✓"));
    }

    #[test]
    fn test_f32_view_unaligned_copies() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-2.0f32).to_le_bytes());
        let view = f32_view(&bytes[1..]);
        assert_eq!(&*view, &[1.5, -2.0]);
    }
}
