//! The byte buffer between the readout thread and the decode thread
//!
//! The hardware hands us whatever it has buffered in one block transfer, so the
//! producer needs a contiguous region to DMA into. Instead of wrapping around like
//! a classic ring, the backing store is `2 * capacity` bytes and the live window
//! `[read, write)` only ever moves forward. Once the read offset has crossed
//! `capacity`, the next write commit copies the live window back down to zero.
//! That memcpy is bounded by `capacity`, which keeps latency predictable while
//! the hardware is being polled.
//!
//! Like `rtrb`, construction hands back a producer/consumer pair. Only the offsets
//! sit behind the mutex; the bytes themselves are written and read without a lock
//! because the two halves never touch the same region.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Wakes a consumer that watches several buffers at once.
///
/// Every committed write bumps the generation. A waiter remembers the generation
/// it last acted on and sleeps until it changes, so a buffer holding only a
/// partial frame never causes a busy loop.
#[derive(Debug, Default)]
pub struct WorkSignal {
    generation: Mutex<u64>,
    cvar: Condvar,
}

impl WorkSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut gen = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *gen = gen.wrapping_add(1);
        self.cvar.notify_all();
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the generation differs from `seen` or `done` holds, returning
    /// the generation observed on wakeup. `done` is evaluated with the signal lock
    /// held.
    pub fn wait_for_change(&self, seen: u64, mut done: impl FnMut() -> bool) -> u64 {
        let mut gen = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        while *gen == seen && !done() {
            gen = self.cvar.wait(gen).unwrap_or_else(PoisonError::into_inner);
        }
        *gen
    }

    /// [`WorkSignal::wait_for_change`] that gives up after `timeout`.
    pub fn wait_for_change_timeout(
        &self,
        seen: u64,
        timeout: Duration,
        mut done: impl FnMut() -> bool,
    ) -> u64 {
        let gen = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let (gen, _) = self
            .cvar
            .wait_timeout_while(gen, timeout, |gen| *gen == seen && !done())
            .unwrap_or_else(PoisonError::into_inner);
        *gen
    }

    /// Run `f` while holding the signal lock. Used to snapshot state that must be
    /// consistent with respect to producers notifying.
    pub fn locked<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

#[derive(Debug, Default)]
struct Offsets {
    read: usize,
    write: usize,
    // Set while the consumer holds a `ReadSlot`; compaction waits for it
    reading: bool,
    produced: u64,
    consumed: u64,
    compactions: u64,
}

/// Shared state behind a [`BufferProducer`]/[`BufferConsumer`] pair.
pub struct RawByteBuffer {
    capacity: usize,
    storage: Box<[UnsafeCell<u8>]>,
    offsets: Mutex<Offsets>,
    data_ready: Condvar,
    signal: Option<Arc<WorkSignal>>,
}

// SAFETY: the offsets are guarded by the mutex. The producer only writes bytes at
// or above `write`, the consumer only reads bytes in `[read, write)`, and the one
// operation that moves bytes (compaction) runs under the mutex while no read slot
// is outstanding and from the producer's own `&mut self`.
unsafe impl Sync for RawByteBuffer {}

impl RawByteBuffer {
    /// Create a buffer holding up to `capacity` readable bytes.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (BufferProducer, BufferConsumer) {
        Self::build(capacity, None)
    }

    /// Like [`RawByteBuffer::new`], additionally notifying `signal` on every write commit.
    pub fn with_signal(
        capacity: usize,
        signal: Arc<WorkSignal>,
    ) -> (BufferProducer, BufferConsumer) {
        Self::build(capacity, Some(signal))
    }

    fn build(capacity: usize, signal: Option<Arc<WorkSignal>>) -> (BufferProducer, BufferConsumer) {
        assert!(capacity > 0, "buffer capacity must be non-zero");
        let storage = (0..capacity * 2).map(|_| UnsafeCell::new(0u8)).collect();
        let shared = Arc::new(Self {
            capacity,
            storage,
            offsets: Mutex::new(Offsets::default()),
            data_ready: Condvar::new(),
            signal,
        });
        (
            BufferProducer {
                shared: shared.clone(),
            },
            BufferConsumer { shared },
        )
    }

    fn lock(&self) -> MutexGuard<'_, Offsets> {
        self.offsets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> is repr(transparent) over u8
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    fn free_of(&self, o: &Offsets) -> usize {
        let by_capacity = self.capacity - (o.write - o.read);
        let by_storage = 2 * self.capacity - o.write;
        by_capacity.min(by_storage)
    }

    // Only called from producer methods, which hold &mut BufferProducer.
    fn compact_if_crossed(&self, o: &mut Offsets) {
        if o.reading || o.read < self.capacity {
            return;
        }
        let live = o.write - o.read;
        // SAFETY: both ranges are inside the backing store, no read slot is
        // outstanding and the caller is the producer. ptr::copy allows overlap.
        unsafe {
            let base = self.base();
            std::ptr::copy(base.add(o.read), base, live);
        }
        o.read = 0;
        o.write = live;
        o.compactions += 1;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free(&self) -> usize {
        let o = self.lock();
        self.free_of(&o)
    }

    pub fn fill(&self) -> usize {
        let o = self.lock();
        o.write - o.read
    }

    /// Fill level as a percentage of capacity
    pub fn pct(&self) -> f64 {
        100.0 * self.fill() as f64 / self.capacity as f64
    }

    pub fn produced_total(&self) -> u64 {
        self.lock().produced
    }

    pub fn consumed_total(&self) -> u64 {
        self.lock().consumed
    }

    pub fn compactions(&self) -> u64 {
        self.lock().compactions
    }

    /// Block until there is at least one readable byte. Spurious wakeups are
    /// absorbed by re-checking the predicate.
    pub fn wait_for_data(&self) {
        let mut o = self.lock();
        while o.write == o.read {
            o = self
                .data_ready
                .wait(o)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// [`RawByteBuffer::wait_for_data`] with an upper bound. Returns whether data is available.
    pub fn wait_for_data_timeout(&self, timeout: Duration) -> bool {
        let o = self.lock();
        let (o, _) = self
            .data_ready
            .wait_timeout_while(o, timeout, |o| o.write == o.read)
            .unwrap_or_else(PoisonError::into_inner);
        o.write != o.read
    }
}

impl std::fmt::Debug for RawByteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let o = self.lock();
        f.debug_struct("RawByteBuffer")
            .field("capacity", &self.capacity)
            .field("read", &o.read)
            .field("write", &o.write)
            .finish()
    }
}

/// Writing half. There is exactly one per buffer.
#[derive(Debug)]
pub struct BufferProducer {
    shared: Arc<RawByteBuffer>,
}

impl BufferProducer {
    pub fn buffer(&self) -> &RawByteBuffer {
        &self.shared
    }

    pub fn free(&self) -> usize {
        self.shared.free()
    }

    pub fn fill(&self) -> usize {
        self.shared.fill()
    }

    /// The region the producer may fill, `free()` bytes long. The block transfer
    /// into it happens outside any lock; follow up with [`BufferProducer::commit_write`].
    ///
    /// A window that already crossed `capacity` is compacted first, so a producer
    /// that found no free space last time gets room once the consumer catches up.
    pub fn write_slot(&mut self) -> &mut [u8] {
        let (start, len) = {
            let mut o = self.shared.lock();
            self.shared.compact_if_crossed(&mut o);
            (o.write, self.shared.free_of(&o))
        };
        // SAFETY: `[start, start + len)` lies inside the backing store (free_of is
        // bounded by 2 * capacity - write) and above the consumer's window. Nothing
        // moves these bytes until commit_write, which needs this same &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.shared.base().add(start), len) }
    }

    /// Publish `amt` freshly written bytes and wake any waiting consumer.
    ///
    /// # Panics
    /// If `amt` exceeds the free space. Writing past `free()` is a caller bug.
    pub fn commit_write(&mut self, amt: usize) {
        {
            let mut o = self.shared.lock();
            let free = self.shared.free_of(&o);
            assert!(amt <= free, "commit of {amt} bytes exceeds free space {free}");
            o.write += amt;
            o.produced += amt as u64;
            self.shared.compact_if_crossed(&mut o);
        }
        self.shared.data_ready.notify_all();
        if let Some(signal) = &self.shared.signal {
            signal.notify();
        }
    }

    /// Copy as much of `bytes` as fits and commit it, returning the amount written.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let slot = self.write_slot();
        let n = slot.len().min(bytes.len());
        slot[..n].copy_from_slice(&bytes[..n]);
        self.commit_write(n);
        n
    }
}

/// Reading half. There is exactly one per buffer.
#[derive(Debug)]
pub struct BufferConsumer {
    shared: Arc<RawByteBuffer>,
}

impl BufferConsumer {
    pub fn buffer(&self) -> &RawByteBuffer {
        &self.shared
    }

    pub fn fill(&self) -> usize {
        self.shared.fill()
    }

    pub fn wait_for_data(&self) {
        self.shared.wait_for_data()
    }

    /// Borrow every readable byte. Compaction is held off until the slot is dropped
    /// or committed.
    pub fn read_slot(&mut self) -> ReadSlot<'_> {
        let (start, len) = {
            let mut o = self.shared.lock();
            o.reading = true;
            (o.read, o.write - o.read)
        };
        // SAFETY: `[start, start + len)` was published by commit_write and cannot be
        // moved by compaction while `reading` is set. The producer only writes at or
        // above the write offset.
        let data = unsafe { std::slice::from_raw_parts(self.shared.base().add(start), len) };
        ReadSlot {
            consumer: self,
            data,
            consumed: 0,
        }
    }

    /// Discard `amt` readable bytes.
    ///
    /// # Panics
    /// If `amt` exceeds the fill level.
    pub fn commit_read(&mut self, amt: usize) {
        let mut o = self.shared.lock();
        Self::advance(&mut o, amt);
    }

    fn advance(o: &mut Offsets, amt: usize) {
        let fill = o.write - o.read;
        assert!(amt <= fill, "commit of {amt} bytes exceeds fill {fill}");
        o.read += amt;
        o.consumed += amt as u64;
    }
}

/// Readable window handed out by [`BufferConsumer::read_slot`].
pub struct ReadSlot<'a> {
    consumer: &'a mut BufferConsumer,
    data: &'a [u8],
    consumed: usize,
}

impl<'a> ReadSlot<'a> {
    /// Release the slot, marking the first `amt` bytes as consumed.
    pub fn commit(mut self, amt: usize) {
        assert!(amt <= self.data.len(), "commit past the end of the read slot");
        self.consumed = amt;
    }
}

impl<'a> Deref for ReadSlot<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data
    }
}

impl<'a> Drop for ReadSlot<'a> {
    fn drop(&mut self) {
        let mut o = self.consumer.shared.lock();
        BufferConsumer::advance(&mut o, self.consumed);
        o.reading = false;
    }
}
