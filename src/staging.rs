//! Per-thread staging buffers.
//!
//! A `StagingBuffer` is a circular FIFO byte queue between exactly one
//! producer (the thread that owns it) and exactly one consumer (the
//! background compression thread). The producer reserves contiguous space,
//! fills it in place, and then commits it; the consumer peeks at committed
//! spans and releases them back once compressed. Neither side takes a lock:
//! each position is written by a single thread and published with
//! release/acquire ordering, and the payload itself is moved with plain
//! stores.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::config::STAGING_BUFFER_SIZE;
use crate::cycles;

/// Fields owned by the producing thread.
struct ProducerSide {
    /// Offset where the next reservation will be handed out. Published with
    /// a release store by `finish_reservation` (and on wrap).
    pos: AtomicUsize,

    /// Offset one past the last committed byte before the most recent wrap.
    /// Only meaningful to the consumer while the producer sits below it.
    end_of_recorded_space: AtomicUsize,

    /// Cached lower bound on bytes the producer can take without looking at
    /// the consumer's position again. Producer-private.
    min_free_space: Cell<usize>,

    /// Cycles spent in `reserve_space_internal` waiting for the consumer.
    cycles_blocked: AtomicU64,
}

/// Fields owned by the consuming thread.
struct ConsumerSide {
    /// Offset of the next unread byte. Published with a release store by
    /// `consume` (and when wrapping back to offset zero).
    pos: AtomicUsize,
}

/// Single-producer/single-consumer circular byte queue holding staged,
/// uncompressed records for one logging thread.
///
/// The producer side (`reserve_producer_space` / `finish_reservation`) may
/// only ever be driven by the owning thread, and the consumer side (`peek` /
/// `consume`) only by the compression thread. That discipline is what makes
/// the unsynchronized interior mutability here sound.
pub struct StagingBuffer {
    producer: CachePadded<ProducerSide>,
    consumer: CachePadded<ConsumerSide>,

    /// Set once by the owning thread's exit sentinel. The consumer frees the
    /// buffer after draining it.
    should_deallocate: AtomicBool,

    /// Dense id, unique for the lifetime of the process.
    id: u32,

    storage: Box<[UnsafeCell<u8>]>,
}

#[allow(unsafe_code)]
unsafe impl Send for StagingBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    /// Creates a buffer with the configured capacity.
    pub fn new(id: u32) -> StagingBuffer {
        Self::with_capacity(id, STAGING_BUFFER_SIZE)
    }

    /// Creates a buffer with an explicit capacity. Small capacities make
    /// wrap behavior easy to exercise.
    pub fn with_capacity(id: u32, capacity: usize) -> StagingBuffer {
        assert!(capacity >= 64, "staging capacity unusably small");
        let mut storage = Vec::with_capacity(capacity);
        storage.resize_with(capacity, || UnsafeCell::new(0));

        StagingBuffer {
            producer: CachePadded::new(ProducerSide {
                pos: AtomicUsize::new(0),
                end_of_recorded_space: AtomicUsize::new(capacity),
                min_free_space: Cell::new(capacity),
                cycles_blocked: AtomicU64::new(0),
            }),
            consumer: CachePadded::new(ConsumerSide { pos: AtomicUsize::new(0) }),
            should_deallocate: AtomicBool::new(false),
            id,
            storage: storage.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    #[allow(unsafe_code)]
    fn slot(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity());
        // UnsafeCell<u8> is repr(transparent) over u8
        unsafe { (self.storage.as_ptr() as *mut u8).add(offset) }
    }

    /// Reserves `nbytes` of contiguous space for the producer without making
    /// it visible to the consumer. Call `finish_reservation` with the same
    /// size to publish the bytes; reserving again before that is a contract
    /// violation. Blocks while the buffer is too full.
    #[inline]
    pub fn reserve_producer_space(&self, nbytes: usize) -> *mut u8 {
        debug_assert!(nbytes > 0);
        debug_assert!(nbytes < self.capacity() / 2, "reservation too large for ring");

        // Fast in-line path; strict `<` so one byte always separates the
        // producer from the consumer.
        if nbytes < self.producer.min_free_space.get() {
            return self.slot(self.producer.pos.load(Ordering::Relaxed));
        }

        match self.reserve_space_internal(nbytes, true) {
            Some(ptr) => ptr,
            None => unreachable!("blocking reserve cannot fail"),
        }
    }

    /// Non-blocking flavor of `reserve_producer_space`; returns `None` when
    /// the consumer has not yet freed enough space.
    pub fn try_reserve(&self, nbytes: usize) -> Option<*mut u8> {
        debug_assert!(nbytes > 0 && nbytes < self.capacity() / 2);
        if nbytes < self.producer.min_free_space.get() {
            return Some(self.slot(self.producer.pos.load(Ordering::Relaxed)));
        }
        self.reserve_space_internal(nbytes, false)
    }

    /// Slow path: recomputes the free span from the consumer's published
    /// position, wrapping the producer to offset zero when the tail of the
    /// buffer is too short, and otherwise spinning until space frees up.
    fn reserve_space_internal(&self, nbytes: usize, blocking: bool) -> Option<*mut u8> {
        let start = cycles::rdtsc();
        let backoff = Backoff::new();

        while self.producer.min_free_space.get() <= nbytes {
            // The consumer moves concurrently; compute against one sample.
            let cached_consumer_pos = self.consumer.pos.load(Ordering::Acquire);
            let producer_pos = self.producer.pos.load(Ordering::Relaxed);

            if cached_consumer_pos <= producer_pos {
                self.producer.min_free_space.set(self.capacity() - producer_pos);
                if self.producer.min_free_space.get() > nbytes {
                    break;
                }

                // Out of room at the tail; mark where valid data ends.
                self.producer
                    .end_of_recorded_space
                    .store(producer_pos, Ordering::Relaxed);

                // Wrapping onto a consumer still at offset zero would make
                // the positions equal and the ring read as empty, so hold
                // off until it has moved.
                if cached_consumer_pos != 0 {
                    // wrap marker must be visible before the reset position
                    self.producer.pos.store(0, Ordering::Release);
                    self.producer.min_free_space.set(cached_consumer_pos);
                }
            } else {
                self.producer
                    .min_free_space
                    .set(cached_consumer_pos - producer_pos);
            }

            if self.producer.min_free_space.get() > nbytes {
                break;
            }
            if !blocking {
                return None;
            }
            backoff.spin();
        }

        self.producer
            .cycles_blocked
            .fetch_add(cycles::rdtsc().wrapping_sub(start), Ordering::Relaxed);

        Some(self.slot(self.producer.pos.load(Ordering::Relaxed)))
    }

    /// Publishes the most recent reservation to the consumer. `nbytes` must
    /// match the size passed to `reserve_producer_space`.
    #[inline]
    pub fn finish_reservation(&self, nbytes: usize) {
        let free = self.producer.min_free_space.get();
        debug_assert!(nbytes < free, "commit without a matching reserve");

        let pos = self.producer.pos.load(Ordering::Relaxed);
        debug_assert!(pos + nbytes <= self.capacity());

        self.producer.min_free_space.set(free - nbytes);
        // Payload stores must be visible before the position bump is.
        self.producer.pos.store(pos + nbytes, Ordering::Release);
    }

    /// Returns a pointer to the first unread byte and the length of the
    /// largest contiguous committed span, or a zero length when the buffer
    /// is empty. Consumer side only.
    pub fn peek(&self) -> (*const u8, usize) {
        // One sample of the producer position for the whole computation.
        let cached_producer_pos = self.producer.pos.load(Ordering::Acquire);
        let mut consumer_pos = self.consumer.pos.load(Ordering::Relaxed);

        if cached_producer_pos < consumer_pos {
            // The producer wrapped; readable bytes run up to the marker it
            // left behind. The acquire load above orders this read.
            let end = self.producer.end_of_recorded_space.load(Ordering::Relaxed);
            let available = end - consumer_pos;
            if available > 0 {
                return (self.slot(consumer_pos), available);
            }

            // Reached the wrap marker; resume from the start of the buffer.
            self.consumer.pos.store(0, Ordering::Release);
            consumer_pos = 0;
        }

        (self.slot(consumer_pos), cached_producer_pos - consumer_pos)
    }

    /// Releases `nbytes` back to the producer. Must not exceed the span most
    /// recently reported by `peek`. Consumer side only.
    #[inline]
    pub fn consume(&self, nbytes: usize) {
        // Reads of the payload must complete before the bytes are recycled.
        cycles::lfence();
        let pos = self.consumer.pos.load(Ordering::Relaxed);
        debug_assert!(pos + nbytes <= self.capacity());
        self.consumer.pos.store(pos + nbytes, Ordering::Release);
    }

    /// Marks this buffer as abandoned by its producer. Invoked by the
    /// owning thread's exit sentinel, exactly once.
    pub fn mark_for_deallocation(&self) {
        self.should_deallocate.store(true, Ordering::Release);
    }

    /// True once the producer is gone and every committed byte has been
    /// consumed; the consumer may then drop the buffer.
    pub fn can_delete(&self) -> bool {
        self.should_deallocate.load(Ordering::Acquire)
            && self.consumer.pos.load(Ordering::Relaxed)
                == self.producer.pos.load(Ordering::Acquire)
    }

    /// Cycles the producer has spent blocked waiting for free space.
    pub fn cycles_producer_blocked(&self) -> u64 {
        self.producer.cycles_blocked.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    fn produce(buf: &StagingBuffer, bytes: &[u8]) {
        let ptr = buf.reserve_producer_space(bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        buf.finish_reservation(bytes.len());
    }

    fn drain(buf: &StagingBuffer) -> Vec<u8> {
        let mut out = vec![];
        loop {
            let (ptr, len) = buf.peek();
            if len == 0 {
                // a wrap may expose a second span
                let (_, len2) = buf.peek();
                if len2 == 0 {
                    return out;
                }
                continue;
            }
            out.extend_from_slice(unsafe { std::slice::from_raw_parts(ptr, len) });
            buf.consume(len);
        }
    }

    #[test]
    fn roundtrip_without_wrap() {
        let buf = StagingBuffer::with_capacity(0, 4096);
        produce(&buf, b"hello");
        produce(&buf, b"world");
        assert_eq!(drain(&buf), b"helloworld");
    }

    #[test]
    fn wrap_sets_marker_and_preserves_order() {
        let buf = StagingBuffer::with_capacity(1, 256);
        let mut expected = vec![];
        for round in 0..20u8 {
            let record = [round; 40];
            produce(&buf, &record);
            expected.extend_from_slice(&record);
            // keep the consumer ahead so the producer never blocks
            let drained = drain(&buf);
            let start = expected.len() - drained.len();
            assert_eq!(drained, &expected[start..]);
        }
    }

    #[test]
    fn empty_peek_reports_zero() {
        let buf = StagingBuffer::with_capacity(2, 1024);
        let (_, len) = buf.peek();
        assert_eq!(len, 0);
    }

    #[test]
    fn try_reserve_fails_when_full() {
        let buf = StagingBuffer::with_capacity(3, 256);
        // fill most of the ring without consuming
        produce(&buf, &[7; 100]);
        produce(&buf, &[8; 100]);
        assert!(buf.try_reserve(100).is_none());
        // draining frees the space again
        drain(&buf);
        assert!(buf.try_reserve(100).is_some());
    }

    #[test]
    fn can_delete_only_after_drain() {
        let buf = StagingBuffer::with_capacity(4, 1024);
        produce(&buf, b"tail");
        buf.mark_for_deallocation();
        assert!(!buf.can_delete());
        drain(&buf);
        assert!(buf.can_delete());
    }
}
