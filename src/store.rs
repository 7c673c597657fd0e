//! Store lifecycle and public API
//!
//! ```text
//! Closed ─► Opening ─► Open ─► Closing ─► Closed
//!           replay index log      stop writer (drains queue)
//!           verify entries        flush + remap
//!           derive header         release file handles
//!           open writers, start threads
//! ```
//!
//! Nothing about the store is persisted except the three logs. Opening always
//! re-derives the header from the replayed index log.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;

use vellum_core::format::{scan_index_log, validate_collection_name, FormatError};
use vellum_core::{
    ElementType, HeaderSnapshot, LogLengths, LogSnapshot, MappedReader, Position, PositionIndex,
    ReadError, StoreHeader,
};

use crate::config::StoreOptions;
use crate::error::{Result, StoreError};
use crate::logs::LogSet;
use crate::search::{self, SearchHit};
use crate::writer::{Pending, Shared, Writer, WriterConfig};

/// Embedded, append-only vector store
pub struct Store {
    options: StoreOptions,
    index: Arc<PositionIndex>,
    header: Arc<StoreHeader>,
    reader: Arc<MappedReader>,
    shared: Arc<Shared>,
    writer: Mutex<Option<Writer>>,
    closed: AtomicBool,
}

impl Store {
    /// Open (or create) the store described by `options`
    pub fn open(options: StoreOptions) -> Result<Self> {
        options.validate()?;
        fs::create_dir_all(&options.data_path)?;
        for path in [options.content_path(), options.embeddings_path()] {
            touch(&path)?;
        }

        let index_bytes = match fs::read(options.index_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let scan = scan_index_log(&index_bytes);
        if let Some(reason) = &scan.malformed {
            // Only a zeroed tail is safe to cut; anything else may hide
            // complete records behind the bad one
            if index_bytes[scan.valid_len..].iter().any(|b| *b != 0) {
                return Err(FormatError::MalformedIndexRecord {
                    offset: scan.valid_len,
                    reason: reason.clone(),
                }
                .into());
            }
        }
        let (index, stats) = PositionIndex::from_scan(&scan, index_bytes.len());

        let reader = MappedReader::open(options.content_path(), options.embeddings_path())?;
        let snapshot = reader.snapshot();
        let element = options.quantization.element();
        let orphans = forget_orphans(&index, &snapshot, element, options.vector_dimensionality);

        let lengths = LogLengths {
            content: snapshot.content.len() as u64,
            embeddings: snapshot.embeddings.len() as u64,
            index_valid: stats.valid_len,
        };
        drop(snapshot);
        let header = Arc::new(StoreHeader::derive(
            &index,
            &scan.records,
            lengths,
            options.vector_dimensionality,
            element.size(),
        ));

        let logs = LogSet::open(&options, &header, stats.ignored_tail)?;
        reader.remap(logs.visible_ends())?;

        let index = Arc::new(index);
        let reader = Arc::new(reader);
        let shared = Arc::new(Shared::new(
            options.ingestion_queue_capacity,
            logs,
            Arc::clone(&index),
            Arc::clone(&header),
            Arc::clone(&reader),
            WriterConfig {
                idle_timeout: options.writer_idle_timeout(),
                flush_interval: options.flush_interval(),
                retry_attempts: options.write_retry_attempts,
            },
        ));
        let writer = Writer::start(Arc::clone(&shared), &options.database_name)?;

        tracing::info!(
            "opened store {:?} in {:?}: {} live entries in {} collections \
             ({} index records, {} tombstones, {} orphans skipped, next id {})",
            options.database_name,
            options.data_path,
            index.len(),
            index.collection_names().len(),
            stats.records,
            stats.tombstones,
            orphans,
            header.total_entity_count() + 1
        );

        Ok(Self {
            options,
            index,
            header,
            reader,
            shared,
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn check_vector(&self, vector: &[f32], what: &str) -> Result<()> {
        let dims = self.options.vector_dimensionality;
        if vector.len() != dims {
            return Err(StoreError::InvalidArgument(format!(
                "{what} has {} dimensions, store expects {dims}",
                vector.len()
            )));
        }
        Ok(())
    }

    /// Queue an entry and return its id.
    ///
    /// The id is assigned before this returns; the entry reaches the logs in
    /// the background. Blocks only while the ingestion queue is full.
    pub fn append(&self, collection: &str, content: &str, embedding: &[f32]) -> Result<u64> {
        self.ensure_open()?;
        validate_collection_name(collection)?;
        self.check_vector(embedding, "embedding")?;

        let element = self.options.quantization.element();
        let mut vector = Vec::with_capacity(embedding.len() * element.size());
        self.options.quantization.encode_into(embedding, &mut vector)?;

        let id = self.header.next_id();
        self.shared.submit(Pending::Append {
            id,
            collection: collection.to_string(),
            content: content.to_string(),
            vector,
            dimensions: embedding.len() as u32,
        });
        Ok(id)
    }

    /// Queue removal of `id` from `collection`.
    ///
    /// Ids that were never assigned are ignored. The id is not reused.
    pub fn remove(&self, collection: &str, id: u64) -> Result<()> {
        self.ensure_open()?;
        validate_collection_name(collection)?;
        if id == 0 || id > self.header.total_entity_count() {
            return Ok(());
        }
        self.shared.submit(Pending::Remove {
            id,
            collection: collection.to_string(),
        });
        Ok(())
    }

    /// Content of an entry, if it exists and has been flushed
    pub fn read_content(&self, collection: &str, id: u64) -> Result<Option<String>> {
        self.ensure_open()?;
        validate_collection_name(collection)?;
        let Some(pos) = self.index.get(collection, id) else {
            return Ok(None);
        };
        let snapshot = self.reader.snapshot();
        Ok(snapshot.content(id, &pos)?.map(str::to_owned))
    }

    /// The `top_k` entries of `collection` with the highest similarity to
    /// `query`, best first
    pub fn search(&self, collection: &str, query: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        validate_collection_name(collection)?;
        if query.is_empty() {
            return Err(StoreError::InvalidArgument("query vector is empty".into()));
        }
        self.check_vector(query, "query vector")?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let Some(entries) = self.index.collection(collection) else {
            return Ok(Vec::new());
        };

        let quantization = &self.options.quantization;
        let query = quantization.query(query)?;
        let snapshot = self.reader.snapshot();
        let hits = search::top_k(&entries, &snapshot, quantization, &query, top_k)?;
        tracing::debug!(
            "search {collection:?}: {} candidates, {} hits",
            entries.len(),
            hits.len()
        );
        Ok(hits)
    }

    /// Wait until every operation queued before this call has been applied.
    ///
    /// This does not make anything durable; see [`Store::flush`]. Fails with
    /// [`StoreError::WriteFailed`] if writes were dead-lettered since the last
    /// report.
    pub fn save_changes(&self) -> Result<()> {
        self.ensure_open()?;
        match self.shared.wait_drained() {
            None => Ok(()),
            Some(failures) => Err(StoreError::WriteFailed {
                failed: failures.failed,
                last_error: failures.last_error,
            }),
        }
    }

    /// Drain, sync all three logs and make everything written visible to
    /// reads and searches
    pub fn flush(&self) -> Result<()> {
        let drained = self.save_changes();
        self.shared.flush_logs()?;
        drained
    }

    /// Stop the background threads after they drain the queue, flush, and
    /// release the file handles. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut writer) = self.writer.lock().take() {
            writer.stop();
        }
        let flushed = self.shared.flush_logs();
        self.shared.release_logs();
        flushed?;

        tracing::info!(
            "closed store {:?}: {} live entries",
            self.options.database_name,
            self.index.len()
        );
        // Both threads are gone; whatever was queued has been drained
        match self.shared.unreported_failures() {
            None => Ok(()),
            Some(failures) => Err(StoreError::WriteFailed {
                failed: failures.failed,
                last_error: failures.last_error,
            }),
        }
    }

    /// Names of collections with at least one live entry, sorted
    pub fn collections(&self) -> Vec<String> {
        self.index.collection_names()
    }

    /// Live entries in `collection`; flushed or not
    pub fn count(&self, collection: &str) -> usize {
        self.index.collection(collection).map_or(0, |c| c.len())
    }

    pub fn contains(&self, collection: &str, id: u64) -> bool {
        self.index.get(collection, id).is_some()
    }

    /// Live ids in `collection`, ascending
    pub fn ids(&self, collection: &str) -> Vec<u64> {
        self.index
            .collection(collection)
            .map(|c| c.ids())
            .unwrap_or_default()
    }

    pub fn header(&self) -> HeaderSnapshot {
        self.header.snapshot()
    }

    /// Operations still waiting in the ingestion queue
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    /// Writes dead-lettered since open
    pub fn failed_writes(&self) -> u64 {
        self.shared.failed_writes()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!(
                "closing store {:?} on drop failed: {err}",
                self.options.database_name
            );
        }
    }
}

fn touch(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(drop)
}

/// What replay verification found for one index entry
#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Intact,
    /// Its bytes never reached the logs: past the end, or still zero fill
    Orphan(String),
    /// Bytes are there but belong to someone else; reads keep failing loudly
    Corrupt(String),
}

/// Drop replayed entries whose records never reached the content or embedding
/// log. Entries with a foreign id prefix stay indexed so reads of them report
/// corruption. Returns how many were dropped.
fn forget_orphans(
    index: &PositionIndex,
    snapshot: &LogSnapshot,
    element: ElementType,
    dimensionality: usize,
) -> usize {
    let entries: Vec<((String, u64), Position)> = index.snapshot().into_iter().collect();
    let flagged: Vec<(String, u64, Verdict)> = entries
        .par_iter()
        .filter_map(|((collection, id), pos)| {
            match verify_entry(snapshot, *id, pos, element, dimensionality) {
                Verdict::Intact => None,
                verdict => Some((collection.clone(), *id, verdict)),
            }
        })
        .collect();

    let mut forgotten = 0;
    for (collection, id, verdict) in &flagged {
        match verdict {
            Verdict::Orphan(reason) => {
                tracing::warn!("skipping orphaned index entry {collection:?}/{id}: {reason}");
                index.forget(collection, *id);
                forgotten += 1;
            }
            Verdict::Corrupt(reason) => {
                tracing::error!("index entry {collection:?}/{id} is corrupt: {reason}");
            }
            Verdict::Intact => {}
        }
    }
    forgotten
}

fn verify_entry(
    snapshot: &LogSnapshot,
    id: u64,
    pos: &Position,
    element: ElementType,
    dimensionality: usize,
) -> Verdict {
    if pos.dimensions as usize != dimensionality {
        return Verdict::Orphan(format!(
            "{} dimensions, store expects {dimensionality}",
            pos.dimensions
        ));
    }
    let content = snapshot.content(id, pos).map(|c| c.is_some());
    let vector = snapshot.vector(id, pos, element).map(|v| v.is_some());
    for (log, result) in [("content", content), ("embedding", vector)] {
        match result {
            Ok(true) => {}
            Ok(false) => return Verdict::Orphan(format!("{log} record past end of log")),
            Err(ReadError::IdMismatch { found: 0, .. }) => {
                return Verdict::Orphan(format!("{log} record is unwritten zero fill"))
            }
            Err(err) => return Verdict::Corrupt(err.to_string()),
        }
    }
    Verdict::Intact
}
