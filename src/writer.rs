//! Background serializer and flusher
//!
//! ```text
//! append() ──► IngestionQueue ──► serializer ──┐
//!                   ▲   wake                    ├─► io lock ─► LogSet ─► PositionIndex
//!                   └──────────── flusher ──────┘        (sync + remap every interval)
//! ```
//!
//! Both threads take the same I/O lock, so file writes, syncs and position
//! index updates never interleave. Readers never take it.
//!
//! Drain tracking: every submitted operation bumps `submitted`; the serializer
//! bumps `completed` once the operation is written or dead-lettered. A caller
//! that snapshots `submitted` and waits for `completed` to reach it knows that
//! every operation it issued before the snapshot has been applied to the
//! in-memory index. That is not durability; only a flush is.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use parking_lot::{Condvar, Mutex};

use vellum_core::{IngestionQueue, MappedReader, PositionIndex, StoreHeader};

use crate::logs::LogSet;

/// How many drained operations the serializer handles before it publishes
/// progress to waiters
const PUBLISH_EVERY: u64 = 1024;

/// One queued write
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Pending {
    Append {
        id: u64,
        collection: String,
        content: String,
        /// Already quantized element bytes
        vector: Vec<u8>,
        dimensions: u32,
    },
    Remove {
        id: u64,
        collection: String,
    },
}

impl Pending {
    fn id(&self) -> u64 {
        match self {
            Pending::Append { id, .. } | Pending::Remove { id, .. } => *id,
        }
    }

    fn collection(&self) -> &str {
        match self {
            Pending::Append { collection, .. } | Pending::Remove { collection, .. } => {
                collection.as_str()
            }
        }
    }
}

/// Auto-reset event: `raise` wakes a waiter, which clears it on the way out
#[derive(Default)]
struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    fn raise(&self) {
        *self.raised.lock() = true;
        self.cond.notify_all();
    }

    /// Wait until raised or `timeout` passes. Returns whether it was raised.
    fn wait(&self, timeout: Duration) -> bool {
        let mut raised = self.raised.lock();
        if !*raised {
            let _ = self.cond.wait_while_for(&mut raised, |r| !*r, timeout);
        }
        std::mem::replace(&mut *raised, false)
    }
}

#[derive(Debug, Default)]
struct DrainState {
    completed: u64,
    /// Set while the serializer holds a batch; the flusher stays out
    draining: bool,
    failed: u64,
    reported_failed: u64,
    last_error: Option<String>,
}

/// Dead-lettered writes not yet reported to a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UnreportedFailures {
    pub failed: u64,
    pub last_error: String,
}

pub(crate) struct WriterConfig {
    pub idle_timeout: Duration,
    pub flush_interval: Duration,
    pub retry_attempts: u32,
}

/// State shared between the store and its two background threads
pub(crate) struct Shared {
    queue: IngestionQueue<Pending>,
    submitted: AtomicU64,
    drain: Mutex<DrainState>,
    drained: Condvar,
    wake: Signal,
    flush_wake: Signal,
    shutdown: AtomicBool,
    /// `None` once the store is closed and the file handles are released
    io: Mutex<Option<LogSet>>,
    index: Arc<PositionIndex>,
    header: Arc<StoreHeader>,
    reader: Arc<MappedReader>,
    config: WriterConfig,
}

impl Shared {
    pub fn new(
        queue_capacity: usize,
        logs: LogSet,
        index: Arc<PositionIndex>,
        header: Arc<StoreHeader>,
        reader: Arc<MappedReader>,
        config: WriterConfig,
    ) -> Self {
        Self {
            queue: IngestionQueue::new(queue_capacity),
            submitted: AtomicU64::new(0),
            drain: Mutex::new(DrainState::default()),
            drained: Condvar::new(),
            wake: Signal::default(),
            flush_wake: Signal::default(),
            shutdown: AtomicBool::new(false),
            io: Mutex::new(Some(logs)),
            index,
            header,
            reader,
            config,
        }
    }

    /// Queue an operation, blocking while the ingestion queue is full
    pub fn submit(&self, pending: Pending) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
        self.queue.enqueue(pending);
        self.wake.raise();
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Block until every operation submitted before this call is drained.
    /// Returns dead-lettered writes nobody has been told about yet.
    pub fn wait_drained(&self) -> Option<UnreportedFailures> {
        let target = self.submitted.load(Ordering::Acquire);
        let mut drain = self.drain.lock();
        while drain.completed < target {
            self.wake.raise();
            let _ = self
                .drained
                .wait_for(&mut drain, self.config.idle_timeout);
        }
        take_unreported(&mut drain)
    }

    /// Dead-lettered writes nobody has been told about yet, without waiting
    pub fn unreported_failures(&self) -> Option<UnreportedFailures> {
        take_unreported(&mut self.drain.lock())
    }

    pub fn failed_writes(&self) -> u64 {
        self.drain.lock().failed
    }

    fn is_draining(&self) -> bool {
        self.drain.lock().draining
    }

    /// Sync all three logs and remap readers onto the new ends
    pub fn flush_logs(&self) -> std::io::Result<()> {
        let ends = {
            let mut io = self.io.lock();
            let Some(logs) = io.as_mut() else {
                return Ok(());
            };
            logs.sync()?;
            logs.visible_ends()
        };
        self.reader.remap(ends)
    }

    /// Drop the file handles. Only called after both threads have exited.
    pub fn release_logs(&self) {
        self.io.lock().take();
    }

    fn drain_queue(&self) -> u64 {
        let _batch = DrainBatch::begin(self);
        let mut io = self.io.lock();
        let Some(logs) = io.as_mut() else {
            return 0;
        };

        let mut drained = 0u64;
        let mut unpublished = 0u64;
        let mut failures: Vec<String> = Vec::new();
        while let Some(pending) = self.queue.try_dequeue() {
            if let Err(err) = self.persist(logs, &pending) {
                failures.push(err);
            }
            drained += 1;
            unpublished += 1;
            if unpublished == PUBLISH_EVERY {
                self.publish(unpublished, std::mem::take(&mut failures));
                unpublished = 0;
            }
        }
        drop(io);
        self.publish(unpublished, failures);
        drained
    }

    fn publish(&self, completed: u64, failures: Vec<String>) {
        if completed == 0 {
            return;
        }
        let mut drain = self.drain.lock();
        drain.completed += completed;
        drain.failed += failures.len() as u64;
        if let Some(last) = failures.into_iter().last() {
            drain.last_error = Some(last);
        }
        self.drained.notify_all();
    }

    /// Write one operation, retrying with linear backoff. On success the
    /// position index and header move forward; after the last failed attempt
    /// the operation is dead-lettered and its message returned.
    fn persist(&self, logs: &mut LogSet, pending: &Pending) -> Result<(), String> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            let result = panic::catch_unwind(AssertUnwindSafe(|| logs.write(pending)));
            match result {
                Ok(Ok(record)) => {
                    self.index.apply(&record);
                    let (c, e, i) = logs.offsets();
                    self.header.record_write(c, e, i);
                    return Ok(());
                }
                Ok(Err(err)) => last_error = format!("{err:#}"),
                Err(_) => last_error = "panic while writing".to_string(),
            }
            tracing::warn!(
                "write of id {} to {:?} failed (attempt {}/{}): {last_error}",
                pending.id(),
                pending.collection(),
                attempt + 1,
                attempts
            );
            if attempt + 1 < attempts {
                thread::sleep(Duration::from_millis(20 * (attempt + 1) as u64));
            }
        }
        tracing::error!(
            "dead-lettering id {} in {:?} after {attempts} attempts: {last_error}",
            pending.id(),
            pending.collection()
        );
        Err(last_error)
    }
}

fn take_unreported(drain: &mut DrainState) -> Option<UnreportedFailures> {
    if drain.failed == drain.reported_failed {
        return None;
    }
    let failed = drain.failed - drain.reported_failed;
    drain.reported_failed = drain.failed;
    Some(UnreportedFailures {
        failed,
        last_error: drain.last_error.clone().unwrap_or_default(),
    })
}

/// Holds the "drain in progress" flag for one batch, clearing it even if the
/// batch unwinds
struct DrainBatch<'a> {
    shared: &'a Shared,
}

impl<'a> DrainBatch<'a> {
    fn begin(shared: &'a Shared) -> Self {
        shared.drain.lock().draining = true;
        Self { shared }
    }
}

impl Drop for DrainBatch<'_> {
    fn drop(&mut self) {
        self.shared.drain.lock().draining = false;
        self.shared.drained.notify_all();
    }
}

/// Handles of the two background threads
pub(crate) struct Writer {
    shared: Arc<Shared>,
    serializer: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl Writer {
    pub fn start(shared: Arc<Shared>, name: &str) -> std::io::Result<Self> {
        let serializer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("vellum-serializer-{name}"))
                .spawn(move || serializer_loop(shared))?
        };
        let flusher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("vellum-flusher-{name}"))
                .spawn(move || flusher_loop(shared))
        };
        let flusher = match flusher {
            Ok(handle) => handle,
            Err(err) => {
                shared.shutdown.store(true, Ordering::Release);
                shared.wake.raise();
                let _ = serializer.join();
                return Err(err);
            }
        };

        Ok(Self {
            shared,
            serializer: Some(serializer),
            flusher: Some(flusher),
        })
    }

    /// Stop both threads. The serializer drains the whole queue first.
    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.raise();
        self.shared.flush_wake.raise();

        for handle in [self.serializer.take(), self.flusher.take()]
            .into_iter()
            .flatten()
        {
            let name = handle.thread().name().unwrap_or("writer").to_string();
            if handle.join().is_err() {
                tracing::error!("{name} thread exited with a panic");
            }
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if self.serializer.is_some() || self.flusher.is_some() {
            self.stop();
        }
    }
}

fn serializer_loop(shared: Arc<Shared>) {
    loop {
        if shared.queue.is_empty() {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            shared.wake.wait(shared.config.idle_timeout);
            continue;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| shared.drain_queue())) {
            Ok(0) => {
                // Claimed slot whose producer has not stored the item yet
                thread::yield_now();
            }
            Ok(n) => tracing::debug!("serializer drained {n} queued operations"),
            Err(_) => tracing::error!("serializer batch panicked; continuing"),
        }
    }
    tracing::debug!("serializer stopped");
}

fn flusher_loop(shared: Arc<Shared>) {
    loop {
        shared.flush_wake.wait(shared.config.flush_interval);
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if shared.is_draining() {
            tracing::debug!("serializer mid-drain, skipping periodic flush");
            continue;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            shared.flush_logs().context("periodic flush")
        }));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!("{err:#}"),
            Err(_) => tracing::error!("flusher panicked; continuing"),
        }
    }
    tracing::debug!("flusher stopped");
}
