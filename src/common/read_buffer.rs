//! A striped, lossy MPSC buffer recording read events.
//!
//! Cache reads only perform a counter claim and one atomic pointer store
//! here, so the hot read path never serializes on the policy structures.
//! The maintenance routine is the single consumer and drains every stripe
//! into the eviction policy.
//!
//! Offers may be rejected: `Full` when the selected ring has no room (a
//! signal that the cache is producing events faster than it drains them,
//! so the caller must schedule maintenance eagerly) and `Failed` when the
//! claim lost a race. A failed producer rehashes its probe so it lands on a
//! different stripe next time, and the table doubles, up to a fixed cap, to
//! spread the contention.

use std::{
    cell::Cell,
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;
use once_cell::sync::OnceCell;

use super::math;

/// Slots per ring. Must be a power of two.
const RING_SIZE: usize = 16;
const RING_MASK: usize = RING_SIZE - 1;

/// The outcome of recording a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BufferResult {
    Added,
    /// Lost a claim race; the event is dropped and the producer's probe is
    /// rehashed.
    Failed,
    /// The ring is full; the event is dropped and a drain is overdue.
    Full,
}

/// One fixed-size ring. Producers claim a slot by CAS on `write_count` and
/// publish the element with a release store; the single consumer reads
/// claimed slots in order and stops at the first not-yet-published one.
struct Ring<T> {
    read_count: CachePadded<AtomicUsize>,
    write_count: CachePadded<AtomicUsize>,
    slots: Box<[AtomicPtr<T>]>,
}

impl<T> Ring<T> {
    fn new() -> Self {
        let slots = (0..RING_SIZE)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            read_count: CachePadded::new(AtomicUsize::new(0)),
            write_count: CachePadded::new(AtomicUsize::new(0)),
            slots,
        }
    }

    fn offer(&self, value: Box<T>) -> BufferResult {
        let head = self.read_count.load(Ordering::Acquire);
        let tail = self.write_count.load(Ordering::Relaxed);
        if tail.wrapping_sub(head) >= RING_SIZE {
            return BufferResult::Full;
        }

        if self
            .write_count
            .compare_exchange(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.slots[tail & RING_MASK].store(Box::into_raw(value), Ordering::Release);
            BufferResult::Added
        } else {
            BufferResult::Failed
        }
    }

    /// Consumes published elements in claim order. Stops at the first slot
    /// whose producer has not finished publishing; that element is picked
    /// up by the next drain.
    fn drain(&self, f: &mut dyn FnMut(T)) {
        let mut head = self.read_count.load(Ordering::Relaxed);
        let tail = self.write_count.load(Ordering::Acquire);

        while head != tail {
            let p = self.slots[head & RING_MASK].swap(ptr::null_mut(), Ordering::AcqRel);
            if p.is_null() {
                break;
            }
            f(*unsafe { Box::from_raw(p) });
            head = head.wrapping_add(1);
        }
        self.read_count.store(head, Ordering::Release);
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

static PROBE_INIT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// The per-thread probe selecting a stripe. Rehashed on contention.
    static PROBE: Cell<u64> = Cell::new(
        (PROBE_INIT.fetch_add(1, Ordering::Relaxed) as u64)
            .wrapping_add(1)
            .wrapping_mul(0x9e37_79b9_7f4a_7c15),
    );
}

/// The striped read buffer.
pub(crate) struct ReadBuffer<T> {
    /// Stripes, initialized lazily as the table grows.
    table: Box<[OnceCell<Ring<T>>]>,
    /// The number of active stripes; a power of two, doubled on contention
    /// up to `table.len()`.
    table_size: AtomicUsize,
}

unsafe impl<T: Send> Send for ReadBuffer<T> {}
unsafe impl<T: Send> Sync for ReadBuffer<T> {}

impl<T> ReadBuffer<T> {
    pub(crate) fn new() -> Self {
        let cpus = crate::common::available_parallelism().min(1 << 16) as u32;
        let max_stripes = 4 * math::next_power_of_two_above(cpus) as usize;
        let table = (0..max_stripes)
            .map(|_| OnceCell::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            table,
            table_size: AtomicUsize::new(1),
        }
    }

    /// Records a read. Wait-free for the producer apart from a single CAS
    /// attempt; events are dropped on `Failed` and `Full`.
    pub(crate) fn offer(&self, value: T) -> BufferResult {
        let size = self.table_size.load(Ordering::Acquire);
        let probe = PROBE.with(Cell::get);
        let index = (probe as usize) & (size - 1);
        let ring = self.table[index].get_or_init(Ring::new);

        let result = ring.offer(Box::new(value));
        if result == BufferResult::Failed {
            PROBE.with(|p| p.set(rehash(probe)));
            self.expand(size);
        }
        result
    }

    /// Drains every stripe. Must only be called by the single consumer (the
    /// maintenance routine, under the eviction lock).
    pub(crate) fn drain(&self, mut f: impl FnMut(T)) {
        for cell in self.table.iter() {
            if let Some(ring) = cell.get() {
                ring.drain(&mut f);
            }
        }
    }

    fn expand(&self, observed_size: usize) {
        if observed_size < self.table.len() {
            let _ = self.table_size.compare_exchange(
                observed_size,
                observed_size * 2,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }
}

fn rehash(mut probe: u64) -> u64 {
    probe ^= probe << 13;
    probe ^= probe >> 7;
    probe ^= probe << 17;
    probe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_and_drain_round_trip() {
        let buffer: ReadBuffer<u64> = ReadBuffer::new();
        assert_eq!(buffer.offer(42), BufferResult::Added);
        assert_eq!(buffer.offer(99), BufferResult::Added);

        let mut out = Vec::new();
        buffer.drain(|v| out.push(v));
        out.sort_unstable();
        assert_eq!(out, vec![42, 99]);

        out.clear();
        buffer.drain(|v| out.push(v));
        assert!(out.is_empty());
    }

    #[test]
    fn full_ring_rejects_offers() {
        let buffer: ReadBuffer<usize> = ReadBuffer::new();

        // A single thread always lands on the same stripe, so the ring
        // fills after RING_SIZE offers.
        for i in 0..RING_SIZE {
            assert_eq!(buffer.offer(i), BufferResult::Added);
        }
        assert_eq!(buffer.offer(usize::MAX), BufferResult::Full);

        let mut out = Vec::new();
        buffer.drain(|v| out.push(v));
        assert_eq!(out.len(), RING_SIZE);

        // Draining frees the ring again.
        assert_eq!(buffer.offer(7), BufferResult::Added);
    }

    #[test]
    fn concurrent_offers_and_drain() {
        use std::sync::Arc;

        let buffer: Arc<ReadBuffer<u64>> = Arc::new(ReadBuffer::new());
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let buffer = Arc::clone(&buffer);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    buffer.offer(t * 1_000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut out = Vec::new();
        buffer.drain(|v| out.push(v));
        // Lossy, so we cannot assert an exact count.
        assert!(!out.is_empty());
    }
}
