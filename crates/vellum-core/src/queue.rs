//! Bounded circular ingestion buffer
//!
//! Producers claim a slot by taking a permit from a counting semaphore, so a
//! full buffer blocks the producer until the writer drains a slot. Slot
//! positions are monotonically increasing `u64` counters taken modulo the
//! capacity; the write and read counters are only related through that modulo.
//!
//! The buffer supports any number of producers and exactly one consumer (the
//! writer thread). A producer bumps the write counter before it stores its
//! item, so the consumer can briefly observe a claimed slot that is still
//! empty. It reports "nothing available" in that case and retries on its next
//! pass instead of skipping the slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counting semaphore over free slots
struct Permits {
    available: Mutex<usize>,
    freed: Condvar,
}

impl Permits {
    fn new(count: usize) -> Self {
        Self {
            available: Mutex::new(count),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut available = self.available.lock();
        while *available == 0 {
            self.freed.wait(&mut available);
        }
        *available -= 1;
    }

    fn try_acquire_for(&self, timeout: Duration) -> bool {
        let mut available = self.available.lock();
        if *available == 0 {
            let _ = self
                .freed
                .wait_while_for(&mut available, |a| *a == 0, timeout);
        }
        if *available == 0 {
            return false;
        }
        *available -= 1;
        true
    }

    fn release(&self) {
        *self.available.lock() += 1;
        self.freed.notify_one();
    }
}

pub struct IngestionQueue<T> {
    slots: Box<[Mutex<Option<Box<T>>>]>,
    write_pos: AtomicU64,
    read_pos: AtomicU64,
    permits: Permits,
}

impl<T> IngestionQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ingestion queue capacity must be positive");
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        Self {
            slots,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            permits: Permits::new(capacity),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, pos: u64) -> &Mutex<Option<Box<T>>> {
        &self.slots[(pos % self.slots.len() as u64) as usize]
    }

    /// Enqueue in FIFO slot order, blocking while the buffer is full
    pub fn enqueue(&self, item: T) {
        self.permits.acquire();
        self.publish(item);
    }

    /// Enqueue, giving up with the item handed back if no slot frees up in time
    pub fn enqueue_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        if !self.permits.try_acquire_for(timeout) {
            return Err(item);
        }
        self.publish(item);
        Ok(())
    }

    fn publish(&self, item: T) {
        let pos = self.write_pos.fetch_add(1, Ordering::AcqRel);
        let mut slot = self.slot(pos).lock();
        debug_assert!(slot.is_none(), "slot reused before it was drained");
        *slot = Some(Box::new(item));
    }

    /// Take the oldest item without blocking. Single consumer only.
    pub fn try_dequeue(&self) -> Option<T> {
        let pos = self.read_pos.load(Ordering::Acquire);
        if pos == self.write_pos.load(Ordering::Acquire) {
            return None;
        }

        // Claimed but not yet stored by its producer
        let item = self.slot(pos).lock().take()?;
        self.read_pos.store(pos + 1, Ordering::Release);
        self.permits.release();
        Some(*item)
    }

    /// Look at the oldest item without removing it
    pub fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let pos = self.read_pos.load(Ordering::Acquire);
        if pos == self.write_pos.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.slot(pos).lock();
        slot.as_deref().map(f)
    }

    /// Claimed slots not yet drained
    pub fn len(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}
