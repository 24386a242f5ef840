//! Per-producer staging rings.
//!
//! A [`StagingBuffer`] is a single-producer/single-consumer circular byte
//! queue carrying variable-sized dynamic records from one producer thread
//! to the consumer. A reservation is always contiguous: when the tail of
//! the buffer is too small the producer publishes `end_of_data` and wraps
//! to the front, and the consumer follows the same marker.
//!
//! Position fields are monotonic byte offsets in `[0, capacity]`. Only
//! the producer writes `producer_pos` and `end_of_data`; only the
//! consumer writes `consumer_pos`; each side reads the other's field with
//! acquire ordering against the release store that published it.

use std::cell::{Cell, UnsafeCell};
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free SPSC byte ring. One per producer thread; outlives the thread
/// and is reclaimed by the consumer once the bound [`DestructGuard`] has
/// dropped and every staged byte has been consumed.
pub struct StagingBuffer {
    storage: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    buffer_id: u32,

    /// Next write offset. Producer-written, consumer-read.
    producer_pos: AtomicUsize,
    /// End of valid data when the producer has wrapped past the consumer.
    /// Producer-written, consumer-read.
    end_of_data: AtomicUsize,
    /// Next read offset. Consumer-written, producer-read.
    consumer_pos: AtomicUsize,

    /// Producer-private cache of the space known to be free ahead of
    /// `producer_pos`. Refreshed from `consumer_pos` only when exhausted.
    available_bytes: Cell<usize>,

    should_be_destructed: AtomicBool,
}

// The producer side (reserve/finish, available_bytes) is only ever driven
// by the one thread owning this ring through its thread-local handle; the
// consumer side (peek/consume) only by the consumer thread.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    pub fn new(buffer_id: u32, capacity: usize) -> Self {
        assert!(capacity > 0, "staging buffer capacity must be non-zero");
        Self {
            storage: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            buffer_id,
            producer_pos: AtomicUsize::new(0),
            end_of_data: AtomicUsize::new(capacity),
            consumer_pos: AtomicUsize::new(0),
            available_bytes: Cell::new(capacity),
            should_be_destructed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.buffer_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves `num_bytes` of contiguous space, spinning until the
    /// consumer frees enough. `num_bytes` must be strictly less than the
    /// ring capacity or the spin can never be satisfied.
    #[allow(clippy::mut_from_ref)]
    pub fn reserve_producer_space(&self, num_bytes: usize) -> &mut [u8] {
        assert!(
            num_bytes < self.capacity,
            "reservation of {num_bytes} bytes can never fit a ring of capacity {}",
            self.capacity
        );
        match self.reserve_internal(num_bytes, true) {
            Some(region) => region,
            // Blocking reservation spins until space exists.
            None => unreachable!(),
        }
    }

    /// Non-blocking variant: returns `None` when the requested space is
    /// not currently available.
    #[allow(clippy::mut_from_ref)]
    pub fn try_reserve_producer_space(&self, num_bytes: usize) -> Option<&mut [u8]> {
        self.reserve_internal(num_bytes, false)
    }

    #[allow(clippy::mut_from_ref)]
    fn reserve_internal(&self, num_bytes: usize, blocking: bool) -> Option<&mut [u8]> {
        loop {
            if self.available_bytes.get() > num_bytes {
                return Some(self.producer_region(num_bytes));
            }

            let cached_consumer_pos = self.consumer_pos.load(Ordering::Acquire);
            let producer_pos = self.producer_pos.load(Ordering::Relaxed);

            if cached_consumer_pos <= producer_pos {
                let mut available = self.capacity - producer_pos;
                if available > num_bytes {
                    self.available_bytes.set(available);
                    return Some(self.producer_region(num_bytes));
                }

                // Tail too small. Mark where the data ends and, unless the
                // consumer still sits at the front, wrap around.
                self.end_of_data.store(producer_pos, Ordering::Release);
                if cached_consumer_pos != 0 {
                    self.producer_pos.store(0, Ordering::Release);
                    available = cached_consumer_pos;
                }
                self.available_bytes.set(available);
            } else {
                self.available_bytes
                    .set(cached_consumer_pos - producer_pos);
            }

            if self.available_bytes.get() > num_bytes {
                return Some(self.producer_region(num_bytes));
            }
            if !blocking {
                return None;
            }
            hint::spin_loop();
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn producer_region(&self, num_bytes: usize) -> &mut [u8] {
        let pos = self.producer_pos.load(Ordering::Relaxed);
        unsafe {
            let base = (*self.storage.get()).as_mut_ptr();
            std::slice::from_raw_parts_mut(base.add(pos), num_bytes)
        }
    }

    /// Publishes `num_bytes` of a prior reservation to the consumer.
    /// `num_bytes` must be strictly below the availability observed by
    /// the reservation, which keeps the usable capacity at `capacity - 1`.
    pub fn finish_reservation(&self, num_bytes: usize) {
        debug_assert!(num_bytes < self.available_bytes.get());
        let producer_pos = self.producer_pos.load(Ordering::Relaxed);
        debug_assert!(producer_pos + num_bytes < self.capacity);

        self.available_bytes
            .set(self.available_bytes.get() - num_bytes);
        // The payload bytes written into the reservation become visible
        // to the consumer with this release store.
        self.producer_pos
            .store(producer_pos + num_bytes, Ordering::Release);
    }

    /// The currently readable contiguous region. Empty when the ring is
    /// drained; follows the wrap marker when the producer went back to
    /// the front.
    pub fn peek(&self) -> &[u8] {
        let cached_producer_pos = self.producer_pos.load(Ordering::Acquire);
        let mut consumer_pos = self.consumer_pos.load(Ordering::Relaxed);

        if cached_producer_pos < consumer_pos {
            let readable = self.end_of_data.load(Ordering::Acquire) - consumer_pos;
            if readable > 0 {
                return self.consumer_region(consumer_pos, readable);
            }
            self.consumer_pos.store(0, Ordering::Release);
            consumer_pos = 0;
        }

        self.consumer_region(consumer_pos, cached_producer_pos - consumer_pos)
    }

    fn consumer_region(&self, pos: usize, len: usize) -> &[u8] {
        unsafe {
            let base = (*self.storage.get()).as_ptr();
            std::slice::from_raw_parts(base.add(pos), len)
        }
    }

    /// Releases `num_bytes` from the front of the readable region.
    pub fn consume(&self, num_bytes: usize) {
        let consumer_pos = self.consumer_pos.load(Ordering::Relaxed);
        debug_assert!(consumer_pos + num_bytes < self.capacity);
        self.consumer_pos
            .store(consumer_pos + num_bytes, Ordering::Release);
    }

    /// True once the owning producer thread has exited and every staged
    /// byte has been consumed; the consumer may then drop its handle.
    pub fn should_be_destructed(&self) -> bool {
        self.should_be_destructed.load(Ordering::Acquire)
            && self.consumer_pos.load(Ordering::Relaxed)
                == self.producer_pos.load(Ordering::Acquire)
    }

    fn mark_for_destruction(&self) {
        self.should_be_destructed.store(true, Ordering::Release);
    }
}

/// Scoped signal that a producer thread has ended.
///
/// Rings are reclaimed by the consumer, not by the thread that filled
/// them, so the thread needs a way to say it is done. A guard lives in
/// the producer's thread-local storage; whenever the thread exits, the
/// guard drops and flips the bound ring's destruction flag.
pub struct DestructGuard {
    staging_buffer: Option<Arc<StagingBuffer>>,
}

impl DestructGuard {
    pub fn new() -> Self {
        Self {
            staging_buffer: None,
        }
    }

    /// Binds the ring this guard watches over.
    pub fn bind(&mut self, staging_buffer: Arc<StagingBuffer>) {
        self.staging_buffer = Some(staging_buffer);
    }
}

impl Default for DestructGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DestructGuard {
    fn drop(&mut self) {
        if let Some(buffer) = self.staging_buffer.take() {
            buffer.mark_for_destruction();
        }
    }
}
