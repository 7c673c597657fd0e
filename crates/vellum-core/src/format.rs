//! Binary log record layouts
//!
//! Every store keeps three append-only logs. All integers are little-endian.
//!
//! ```text
//! content log     [id: i64][utf8 bytes ...]
//! embedding log   [id: i64][element × dimensionality]
//! index log       [id: i64][name_len: i32][name: utf8]
//!                 [content_offset: i64][embedding_offset: i64]
//!                 [dimensionality: i32][content_len: i64]
//! ```
//!
//! Content records carry no length of their own: the byte length lives only in
//! the matching index record. A tombstone is an index record whose offsets are
//! both `-1` and whose dimensionality and length are zero.

use std::io;

use thiserror::Error;

/// Size of the id prefix that starts every content and embedding record
pub const ID_SIZE: usize = 8;

/// Longest accepted collection name, in bytes
pub const MAX_COLLECTION_NAME_LEN: usize = 256;

/// Fixed bytes before the collection name: id (8) + name_len (4)
pub const INDEX_PREFIX_SIZE: usize = 12;

/// Fixed bytes after the collection name: 8 + 8 + 4 + 8
pub const INDEX_SUFFIX_SIZE: usize = 28;

const TOMBSTONE_OFFSET: i64 = -1;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Invalid collection name: {0}")]
    InvalidCollectionName(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Malformed index record at offset {offset}: {reason}")]
    MalformedIndexRecord { offset: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reject empty names and names longer than [`MAX_COLLECTION_NAME_LEN`] bytes.
pub fn validate_collection_name(name: &str) -> Result<(), FormatError> {
    if name.is_empty() {
        return Err(FormatError::InvalidCollectionName(
            "collection name must not be empty".into(),
        ));
    }
    if name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(FormatError::InvalidCollectionName(format!(
            "collection name is {} bytes, limit is {}",
            name.len(),
            MAX_COLLECTION_NAME_LEN
        )));
    }
    Ok(())
}

/// Where one entry lives in the content and embedding logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Position {
    pub content_offset: u64,
    pub embedding_offset: u64,
    pub dimensions: u32,
    pub content_len: u64,
}

impl Position {
    /// One past the last byte of the content record
    #[inline]
    pub fn content_end(&self) -> u64 {
        self.content_offset + ID_SIZE as u64 + self.content_len
    }

    /// One past the last byte of the embedding record
    #[inline]
    pub fn embedding_end(&self, element_size: usize) -> u64 {
        self.embedding_offset + ID_SIZE as u64 + self.dimensions as u64 * element_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    Upsert(Position),
    Tombstone,
}

/// One record of the index log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub id: u64,
    pub collection: String,
    pub op: IndexOp,
}

impl IndexRecord {
    pub fn upsert(id: u64, collection: impl Into<String>, position: Position) -> Self {
        Self {
            id,
            collection: collection.into(),
            op: IndexOp::Upsert(position),
        }
    }

    pub fn tombstone(id: u64, collection: impl Into<String>) -> Self {
        Self {
            id,
            collection: collection.into(),
            op: IndexOp::Tombstone,
        }
    }

    #[inline]
    pub fn encoded_len(&self) -> usize {
        INDEX_PREFIX_SIZE + self.collection.len() + INDEX_SUFFIX_SIZE
    }

    /// Append the wire form of this record to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        buf.extend_from_slice(&(self.id as i64).to_le_bytes());
        buf.extend_from_slice(&(self.collection.len() as i32).to_le_bytes());
        buf.extend_from_slice(self.collection.as_bytes());

        let (content_offset, embedding_offset, dimensions, content_len) = match self.op {
            IndexOp::Upsert(p) => (
                p.content_offset as i64,
                p.embedding_offset as i64,
                p.dimensions as i32,
                p.content_len as i64,
            ),
            IndexOp::Tombstone => (TOMBSTONE_OFFSET, TOMBSTONE_OFFSET, 0, 0),
        };
        buf.extend_from_slice(&content_offset.to_le_bytes());
        buf.extend_from_slice(&embedding_offset.to_le_bytes());
        buf.extend_from_slice(&dimensions.to_le_bytes());
        buf.extend_from_slice(&content_len.to_le_bytes());
    }

    /// Decode the record starting at `offset`.
    ///
    /// Returns `Ok(None)` when fewer bytes remain than the record needs, which is
    /// how a trailing record cut short by a crash shows up.
    pub fn decode(bytes: &[u8], offset: usize) -> Result<Option<(Self, usize)>, FormatError> {
        let rest = &bytes[offset.min(bytes.len())..];
        if rest.len() < INDEX_PREFIX_SIZE {
            return Ok(None);
        }

        let id = i64::from_le_bytes(rest[0..8].try_into().unwrap());
        let name_len = i32::from_le_bytes(rest[8..12].try_into().unwrap());
        if name_len <= 0 || name_len as usize > MAX_COLLECTION_NAME_LEN {
            return Err(FormatError::MalformedIndexRecord {
                offset,
                reason: format!("collection name length {name_len} out of range"),
            });
        }
        if id < 0 {
            return Err(FormatError::MalformedIndexRecord {
                offset,
                reason: format!("negative id {id}"),
            });
        }

        let name_len = name_len as usize;
        let total = INDEX_PREFIX_SIZE + name_len + INDEX_SUFFIX_SIZE;
        if rest.len() < total {
            return Ok(None);
        }

        let name_bytes = &rest[INDEX_PREFIX_SIZE..INDEX_PREFIX_SIZE + name_len];
        let collection = std::str::from_utf8(name_bytes)
            .map_err(|err| FormatError::MalformedIndexRecord {
                offset,
                reason: format!("collection name is not utf-8: {err}"),
            })?
            .to_string();

        let s = INDEX_PREFIX_SIZE + name_len;
        let content_offset = i64::from_le_bytes(rest[s..s + 8].try_into().unwrap());
        let embedding_offset = i64::from_le_bytes(rest[s + 8..s + 16].try_into().unwrap());
        let dimensions = i32::from_le_bytes(rest[s + 16..s + 20].try_into().unwrap());
        let content_len = i64::from_le_bytes(rest[s + 20..s + 28].try_into().unwrap());

        let op = if content_offset == TOMBSTONE_OFFSET
            && embedding_offset == TOMBSTONE_OFFSET
            && dimensions == 0
            && content_len == 0
        {
            IndexOp::Tombstone
        } else if content_offset < 0 || embedding_offset < 0 || dimensions <= 0 || content_len < 0
        {
            return Err(FormatError::MalformedIndexRecord {
                offset,
                reason: format!(
                    "invalid position content={content_offset} embedding={embedding_offset} \
                     dims={dimensions} len={content_len}"
                ),
            });
        } else {
            IndexOp::Upsert(Position {
                content_offset: content_offset as u64,
                embedding_offset: embedding_offset as u64,
                dimensions: dimensions as u32,
                content_len: content_len as u64,
            })
        };

        Ok(Some((
            Self {
                id: id as u64,
                collection,
                op,
            },
            total,
        )))
    }
}

/// Result of scanning an index log from offset 0
#[derive(Debug, Default)]
pub struct IndexLogScan {
    /// Complete records in log order
    pub records: Vec<IndexRecord>,
    /// Bytes covered by complete records
    pub valid_len: usize,
    /// Set when the scan stopped at a malformed (not merely short) record
    pub malformed: Option<String>,
}

impl IndexLogScan {
    /// Bytes after the last complete record
    pub fn trailing_bytes(&self, total_len: usize) -> usize {
        total_len.saturating_sub(self.valid_len)
    }
}

/// Decode every complete record; stop at the first short or malformed one.
pub fn scan_index_log(bytes: &[u8]) -> IndexLogScan {
    let mut scan = IndexLogScan::default();
    let mut offset = 0usize;

    loop {
        match IndexRecord::decode(bytes, offset) {
            Ok(Some((record, len))) => {
                scan.records.push(record);
                offset += len;
            }
            Ok(None) => break,
            Err(err) => {
                scan.malformed = Some(err.to_string());
                break;
            }
        }
    }

    scan.valid_len = offset;
    scan
}

/// Wire form of a content record: `[id][utf8 bytes]`
pub fn encode_content_record(id: u64, content: &str, buf: &mut Vec<u8>) {
    buf.reserve(ID_SIZE + content.len());
    buf.extend_from_slice(&(id as i64).to_le_bytes());
    buf.extend_from_slice(content.as_bytes());
}

/// Wire form of an embedding record: `[id][quantized elements]`
pub fn encode_embedding_record(id: u64, quantized: &[u8], buf: &mut Vec<u8>) {
    buf.reserve(ID_SIZE + quantized.len());
    buf.extend_from_slice(&(id as i64).to_le_bytes());
    buf.extend_from_slice(quantized);
}

/// Read the id prefix at `offset`, if the bytes are there
#[inline]
pub fn read_id(bytes: &[u8], offset: usize) -> Option<u64> {
    let end = offset.checked_add(ID_SIZE)?;
    let raw: [u8; ID_SIZE] = bytes.get(offset..end)?.try_into().ok()?;
    Some(i64::from_le_bytes(raw) as u64)
}
