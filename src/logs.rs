//! The three-log append path
//!
//! Every entry goes to the content log, then the embedding log, then the
//! index log. Only the index record makes an entry exist; if a write fails
//! part way, whatever reached the first two logs is an orphan that replay
//! never looks at.

use std::io;

use anyhow::{Context, Result};

use vellum_core::format::{encode_content_record, encode_embedding_record};
use vellum_core::{GrowthPolicy, IndexRecord, LogWriter, Position, StoreHeader, VisibleEnds};

use crate::config::StoreOptions;
use crate::writer::Pending;

pub(crate) struct LogSet {
    content: LogWriter,
    embeddings: LogWriter,
    index: LogWriter,
    scratch: Vec<u8>,
}

impl LogSet {
    /// Open all three writers at the offsets derived from the replayed index.
    /// A torn tail on the index log is cut off before appends resume.
    pub fn open(options: &StoreOptions, header: &StoreHeader, index_tail: u64) -> io::Result<Self> {
        let policy = options.growth_policy();
        let content = LogWriter::open(options.content_path(), header.content_write_offset(), policy)?;
        let embeddings = LogWriter::open(
            options.embeddings_path(),
            header.embedding_write_offset(),
            policy,
        )?;
        let mut index = LogWriter::open(
            options.index_path(),
            header.index_write_offset(),
            GrowthPolicy::DISABLED,
        )?;
        if index_tail > 0 {
            tracing::warn!(
                "truncating {index_tail} bytes of incomplete records from {:?}",
                index.path()
            );
            index.truncate_to_offset()?;
        }

        Ok(Self {
            content,
            embeddings,
            index,
            scratch: Vec::with_capacity(4096),
        })
    }

    /// Write one queued operation and return the index record that now
    /// describes it
    pub fn write(&mut self, pending: &Pending) -> Result<IndexRecord> {
        match pending {
            Pending::Append {
                id,
                collection,
                content,
                vector,
                dimensions,
            } => self.append_entry(*id, collection, content, vector, *dimensions),
            Pending::Remove { id, collection } => {
                let record = IndexRecord::tombstone(*id, collection.as_str());
                self.append_index(&record)?;
                Ok(record)
            }
        }
    }

    fn append_entry(
        &mut self,
        id: u64,
        collection: &str,
        content: &str,
        vector: &[u8],
        dimensions: u32,
    ) -> Result<IndexRecord> {
        self.scratch.clear();
        encode_content_record(id, content, &mut self.scratch);
        let content_offset = self
            .content
            .append(&self.scratch)
            .with_context(|| format!("appending content record for id {id}"))?;

        self.scratch.clear();
        encode_embedding_record(id, vector, &mut self.scratch);
        let embedding_offset = self
            .embeddings
            .append(&self.scratch)
            .with_context(|| format!("appending embedding record for id {id}"))?;

        let record = IndexRecord::upsert(
            id,
            collection,
            Position {
                content_offset,
                embedding_offset,
                dimensions,
                content_len: content.len() as u64,
            },
        );
        self.append_index(&record)?;
        Ok(record)
    }

    fn append_index(&mut self, record: &IndexRecord) -> Result<()> {
        self.scratch.clear();
        record.encode_into(&mut self.scratch);
        self.index
            .append(&self.scratch)
            .with_context(|| format!("appending index record for id {}", record.id))?;
        Ok(())
    }

    /// Logical ends of the content, embedding and index logs
    pub fn offsets(&self) -> (u64, u64, u64) {
        (
            self.content.offset(),
            self.embeddings.offset(),
            self.index.offset(),
        )
    }

    pub fn visible_ends(&self) -> VisibleEnds {
        VisibleEnds {
            content: self.content.offset(),
            embeddings: self.embeddings.offset(),
        }
    }

    /// Force all three logs to stable storage, index last
    pub fn sync(&mut self) -> io::Result<()> {
        self.content.sync()?;
        self.embeddings.sync()?;
        self.index.sync()
    }
}
