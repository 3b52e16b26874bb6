//! Lock-free single-producer single-consumer byte ring buffer.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Fixed-capacity byte FIFO shared by one producer and one consumer.
///
/// One slot is kept free to tell a full ring from an empty one, so a ring of
/// `N` bytes holds at most `N - 1`. The producer only ever advances `head` and
/// the consumer only ever advances `tail`; the index store is the publish
/// point (`Release`) and the opposite side observes it with `Acquire`, so
/// payload bytes are always visible before the index that covers them.
///
/// Methods taking `&mut self` are for single-context use. To share the ring
/// between an interrupt handler and a task, [`split`](RingBuffer::split) it.
///
/// ```
/// use usbd_daplink::ring::RingBuffer;
///
/// let mut ring: RingBuffer<8> = RingBuffer::new();
/// assert_eq!(ring.write(b"hello"), 5);
/// let mut out = [0; 8];
/// assert_eq!(ring.read(&mut out), 5);
/// assert_eq!(&out[..5], b"hello");
/// ```
pub struct RingBuffer<const N: usize> {
    storage: UnsafeCell<[u8; N]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// Safety: the only `&self` paths that touch `storage` are reached through
// `Producer` and `Consumer`, and `split` hands out exactly one of each.
unsafe impl<const N: usize> Sync for RingBuffer<N> {}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RingBuffer<N> {
    /// Create an empty ring.
    pub const fn new() -> Self {
        assert!(N > 1, "ring buffer needs at least two slots");
        Self {
            storage: UnsafeCell::new([0; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Number of bytes the ring can hold.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    /// Reset both indices. Contents become undefined.
    pub fn clear(&mut self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }

    /// Bytes waiting to be read.
    pub fn count_used(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + N - tail) % N
    }

    /// Bytes that can still be written.
    pub fn count_free(&self) -> usize {
        N - 1 - self.count_used()
    }

    /// Whether there is nothing to read.
    pub fn is_empty(&self) -> bool {
        self.count_used() == 0
    }

    /// Whether nothing more can be written.
    pub fn is_full(&self) -> bool {
        self.count_free() == 0
    }

    /// Append one byte, returning `false` if the ring is full.
    pub fn push(&mut self, byte: u8) -> bool {
        self.enqueue(&[byte]) == 1
    }

    /// Append one byte, evicting the oldest one when the ring is full.
    pub fn push_overwrite(&mut self, byte: u8) {
        if self.is_full() {
            self.dequeue(&mut [0]);
        }
        self.enqueue(&[byte]);
    }

    /// Remove the oldest byte.
    ///
    /// # Panics
    ///
    /// Panics if the ring is empty; check [`count_used`](Self::count_used)
    /// first or use [`try_pop`](Self::try_pop).
    pub fn pop(&mut self) -> u8 {
        match self.try_pop() {
            Some(byte) => byte,
            None => panic!("pop from an empty ring buffer"),
        }
    }

    /// Remove the oldest byte if there is one.
    pub fn try_pop(&mut self) -> Option<u8> {
        let mut byte = [0];
        (self.dequeue(&mut byte) == 1).then_some(byte[0])
    }

    /// Copy as much of `src` as fits, returning the number of bytes accepted.
    pub fn write(&mut self, src: &[u8]) -> usize {
        self.enqueue(src)
    }

    /// Move up to `dst.len()` bytes out of the ring.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        self.dequeue(dst)
    }

    /// Next contiguous readable run, without consuming it.
    ///
    /// The run stops at the end of the backing array, so it may be shorter
    /// than [`count_used`](Self::count_used). Release it with
    /// [`consume`](Self::consume).
    pub fn peek(&self) -> &[u8] {
        self.contiguous()
    }

    /// Drop up to `len` bytes from the read side.
    pub fn consume(&mut self, len: usize) -> usize {
        self.advance_tail(len)
    }

    /// Split into a producer and a consumer that may live in different
    /// execution contexts.
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        let ring = &*self;
        (Producer { ring }, Consumer { ring })
    }

    fn enqueue(&self, src: &[u8]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let free = N - 1 - (head + N - tail) % N;
        let len = src.len().min(free);
        let base = self.storage.get() as *mut u8;
        for (i, &byte) in src[..len].iter().enumerate() {
            // Safety: slots in [head, head + free) are owned by the producer
            // until `head` is published below.
            unsafe { base.add((head + i) % N).write(byte) };
        }
        self.head.store((head + len) % N, Ordering::Release);
        len
    }

    fn dequeue(&self, dst: &mut [u8]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let used = (head + N - tail) % N;
        let len = dst.len().min(used);
        let base = self.storage.get() as *const u8;
        for (i, slot) in dst[..len].iter_mut().enumerate() {
            // Safety: slots in [tail, tail + used) were published by the
            // producer and are not rewritten until `tail` moves past them.
            *slot = unsafe { base.add((tail + i) % N).read() };
        }
        self.tail.store((tail + len) % N, Ordering::Release);
        len
    }

    fn contiguous(&self) -> &[u8] {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let len = if head >= tail { head - tail } else { N - tail };
        // Safety: the run lies inside published, not yet consumed slots.
        unsafe { core::slice::from_raw_parts((self.storage.get() as *const u8).add(tail), len) }
    }

    fn advance_tail(&self, len: usize) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let len = len.min((head + N - tail) % N);
        self.tail.store((tail + len) % N, Ordering::Release);
        len
    }
}

/// Write side of a split [`RingBuffer`].
pub struct Producer<'a, const N: usize> {
    ring: &'a RingBuffer<N>,
}

impl<const N: usize> Producer<'_, N> {
    /// Append one byte, returning `false` if the ring is full.
    pub fn push(&mut self, byte: u8) -> bool {
        self.ring.enqueue(&[byte]) == 1
    }

    /// Copy as much of `src` as fits.
    pub fn write(&mut self, src: &[u8]) -> usize {
        self.ring.enqueue(src)
    }

    /// Bytes that can still be written.
    pub fn count_free(&self) -> usize {
        self.ring.count_free()
    }
}

/// Read side of a split [`RingBuffer`].
pub struct Consumer<'a, const N: usize> {
    ring: &'a RingBuffer<N>,
}

impl<const N: usize> Consumer<'_, N> {
    /// Remove the oldest byte if there is one.
    pub fn pop(&mut self) -> Option<u8> {
        let mut byte = [0];
        (self.ring.dequeue(&mut byte) == 1).then_some(byte[0])
    }

    /// Move up to `dst.len()` bytes out of the ring.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        self.ring.dequeue(dst)
    }

    /// Next contiguous readable run, see [`RingBuffer::peek`].
    pub fn peek(&self) -> &[u8] {
        self.ring.contiguous()
    }

    /// Drop up to `len` bytes from the read side.
    pub fn consume(&mut self, len: usize) -> usize {
        self.ring.advance_tail(len)
    }

    /// Bytes waiting to be read.
    pub fn count_used(&self) -> usize {
        self.ring.count_used()
    }
}
