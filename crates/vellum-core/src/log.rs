//! Append-only log writer
//!
//! Every write lands at the current logical end of the log; bytes before it are
//! never touched again. The logical end can sit below the physical file length
//! when the file was preallocated, so the writer tracks both.
//!
//! Growth policy (only when preallocation is enabled):
//!
//! ```text
//! free = allocated - offset
//! if offset + incoming > allocated || free - incoming < allocated * threshold%:
//!     allocated += max(allocated * growth%, incoming)
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// How a log file reserves space ahead of the write offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthPolicy {
    /// Initial physical size in bytes; 0 disables preallocation entirely
    pub initial_size: u64,
    pub free_space_threshold_percent: u8,
    pub growth_increment_percent: u32,
}

impl GrowthPolicy {
    pub const DISABLED: GrowthPolicy = GrowthPolicy {
        initial_size: 0,
        free_space_threshold_percent: 0,
        growth_increment_percent: 0,
    };

    #[inline]
    pub fn enabled(&self) -> bool {
        self.initial_size > 0
    }

    /// New allocation if appending `incoming` bytes at `offset` needs one
    pub fn next_allocation(&self, offset: u64, incoming: u64, allocated: u64) -> Option<u64> {
        if !self.enabled() {
            return None;
        }
        let needed = offset + incoming;
        let threshold = allocated * self.free_space_threshold_percent as u64 / 100;
        let free_after = allocated.saturating_sub(needed);
        if needed <= allocated && free_after >= threshold {
            return None;
        }
        let step = (allocated * self.growth_increment_percent as u64 / 100).max(incoming);
        Some((allocated + step).max(needed).max(self.initial_size))
    }
}

/// Sequential writer over one log file
pub struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    allocated: u64,
    policy: GrowthPolicy,
}

impl LogWriter {
    /// Open (creating if needed) and position the writer at `offset`.
    ///
    /// `offset` is the logical end of valid data; it may be below the file
    /// length when the tail holds preallocated zeros or orphaned bytes.
    pub fn open<P: AsRef<Path>>(path: P, offset: u64, policy: GrowthPolicy) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut allocated = file.metadata()?.len();
        if offset > allocated {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write offset {offset} beyond end of {:?} ({allocated} bytes)",
                    path
                ),
            ));
        }
        if policy.enabled() && allocated < policy.initial_size {
            file.set_len(policy.initial_size)?;
            allocated = policy.initial_size;
        }
        file.seek(SeekFrom::Start(offset))?;

        Ok(Self {
            path,
            writer: BufWriter::with_capacity(1 << 20, file),
            offset,
            allocated,
            policy,
        })
    }

    /// Logical end of the log
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Physical bytes reserved on disk
    #[inline]
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `bytes`, returning the offset they start at
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<u64> {
        let start = self.offset;
        if let Some(new_len) =
            self.policy
                .next_allocation(start, bytes.len() as u64, self.allocated)
        {
            // set_len does not move the cursor, so buffered bytes stay put
            self.writer.get_ref().set_len(new_len)?;
            tracing::debug!(
                "grew {:?} from {} to {} bytes",
                self.path,
                self.allocated,
                new_len
            );
            self.allocated = new_len;
        }

        if let Err(err) = self.writer.write_all(bytes) {
            self.rewind()?;
            return Err(err);
        }
        self.offset += bytes.len() as u64;
        if self.offset > self.allocated {
            self.allocated = self.offset;
        }
        Ok(start)
    }

    /// Put the cursor back at the logical end after a failed write, so the
    /// next append overwrites whatever part of the record reached the file
    pub fn rewind(&mut self) -> io::Result<()> {
        self.writer.seek(SeekFrom::Start(self.offset))?;
        Ok(())
    }

    /// Cut the file back to the logical end. Only used on the index log when a
    /// torn trailing record has to be discarded before appends resume.
    pub fn truncate_to_offset(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(self.offset)?;
        self.allocated = self.offset;
        self.writer.seek(SeekFrom::Start(self.offset))?;
        Ok(())
    }

    /// Push buffered bytes to the OS without forcing them to disk
    pub fn flush_buffer(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    /// Push buffered bytes and force them to stable storage
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(err) = self.writer.flush() {
            tracing::warn!("flushing {:?} on drop failed: {err}", self.path);
        }
    }
}
