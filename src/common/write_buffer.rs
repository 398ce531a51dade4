//! A lossless, growable, bounded MPSC queue recording write operations.
//!
//! Writers never block on the eviction lock; they enqueue an operation here
//! and the maintenance routine (the single consumer) applies the batch
//! under one lock acquisition. Operations drive capacity accounting, so
//! unlike the read buffer this queue must never drop an element: when it is
//! full the producer runs maintenance itself to make room.
//!
//! The storage starts as a single fixed-size chunk of slots and grows by
//! chaining further chunks: the producer that steps past the end of the
//! last chunk allocates the next one and publishes it through the chunk's
//! atomic `next` pointer (the jump link); the consumer follows the same
//! link on drain. Once enough chunks exist to cover the configured maximum
//! capacity, the last jump link closes the chain into a ring and the slots
//! are reused. Each slot carries a sequence number (the classic bounded
//! queue protocol), so a slot is only reused after its previous element
//! was consumed.

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

struct Slot<T> {
    /// The slot state: equal to the absolute index when free for that lap's
    /// producer, absolute index + 1 once published, and advanced by the
    /// maximum capacity when consumed.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

struct Chunk<T> {
    /// The position of this chunk in the chain.
    index: usize,
    slots: Box<[Slot<T>]>,
    /// The jump link to the successor, null until a producer publishes it.
    next: AtomicPtr<Chunk<T>>,
}

impl<T> Chunk<T> {
    fn new(index: usize, chunk_len: usize, max_capacity: usize) -> Self {
        // Slot j first serves the absolute index `index * chunk_len + j`,
        // and every `max_capacity` indices after that.
        let base = index * chunk_len;
        let slots = (0..chunk_len)
            .map(|j| Slot {
                seq: AtomicUsize::new(base + j),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        debug_assert!(base + chunk_len <= max_capacity);
        Self {
            index,
            slots,
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

pub(crate) struct WriteBuffer<T> {
    producer_index: CachePadded<AtomicUsize>,
    consumer_index: CachePadded<AtomicUsize>,
    /// The producers' chunk hint: at or before the chunk of the next claim.
    producer_chunk: AtomicPtr<Chunk<T>>,
    /// The consumer's current chunk. Single-threaded by contract.
    consumer_chunk: UnsafeCell<*mut Chunk<T>>,
    /// The first chunk; the anchor of the chain and of the closed ring.
    head_chunk: *mut Chunk<T>,
    /// Chunks allocated so far; grows from one to `max / chunk_len`.
    allocated_chunks: AtomicUsize,
    max_capacity: usize,
    chunk_len: usize,
    chunk_shift: u32,
    chunk_mask: usize,
    marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for WriteBuffer<T> {}
unsafe impl<T: Send> Sync for WriteBuffer<T> {}

impl<T> WriteBuffer<T> {
    /// Creates a buffer with one chunk of `initial` slots that grows, one
    /// chunk at a time, up to `max` slots in total. Both are rounded up to
    /// powers of two.
    pub(crate) fn new(initial: usize, max: usize) -> Self {
        let chunk_len = initial.max(1).next_power_of_two();
        let max_capacity = max.max(chunk_len).next_power_of_two();
        let num_chunks = max_capacity / chunk_len;
        let head_chunk = Box::into_raw(Box::new(Chunk::new(0, chunk_len, max_capacity)));
        Self {
            producer_index: CachePadded::new(AtomicUsize::new(0)),
            consumer_index: CachePadded::new(AtomicUsize::new(0)),
            producer_chunk: AtomicPtr::new(head_chunk),
            consumer_chunk: UnsafeCell::new(head_chunk),
            head_chunk,
            allocated_chunks: AtomicUsize::new(1),
            max_capacity,
            chunk_len,
            chunk_shift: chunk_len.trailing_zeros(),
            chunk_mask: num_chunks - 1,
            marker: PhantomData,
        }
    }

    /// The slots currently backing the queue. Starts at the initial chunk
    /// size and reaches the configured maximum as chunks are chained on.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.allocated_chunks.load(Ordering::Acquire) * self.chunk_len
    }

    pub(crate) fn len(&self) -> usize {
        let ci = self.consumer_index.load(Ordering::Relaxed);
        let pi = self.producer_index.load(Ordering::Relaxed);
        pi.wrapping_sub(ci)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `value`, returning it back when all `max` slots hold
    /// unconsumed elements. Safe to call from any number of producers.
    pub(crate) fn enqueue(&self, value: T) -> Result<(), T> {
        loop {
            let pi = self.producer_index.load(Ordering::Relaxed);
            let chunk = self.producer_chunk_for(pi);
            let slot = &chunk.slots[pi & (self.chunk_len - 1)];
            let seq = slot.seq.load(Ordering::Acquire);

            if seq == pi {
                if self
                    .producer_index
                    .compare_exchange_weak(
                        pi,
                        pi.wrapping_add(1),
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    unsafe { (*slot.value.get()).write(value) };
                    slot.seq.store(pi.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
            } else if (seq as isize).wrapping_sub(pi as isize) < 0 {
                // The slot still holds an element from the previous lap and
                // every chunk is allocated: the queue is at its maximum.
                return Err(value);
            }
            // Another producer claimed this index; reload and retry.
        }
    }

    /// Dequeues the next operation. Must only be called by the single
    /// consumer.
    pub(crate) fn dequeue(&self) -> Option<T> {
        let ci = self.consumer_index.load(Ordering::Relaxed);
        let target = (ci >> self.chunk_shift) & self.chunk_mask;

        // Follow the jump links up to the chunk holding `ci`. A null link
        // means no producer has published anything that far yet.
        let mut chunk = unsafe { &**self.consumer_chunk.get() };
        while chunk.index != target {
            let next = chunk.next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            unsafe { *self.consumer_chunk.get() = next };
            chunk = unsafe { &*next };
        }

        let slot = &chunk.slots[ci & (self.chunk_len - 1)];
        let seq = slot.seq.load(Ordering::Acquire);
        if seq != ci.wrapping_add(1) {
            return None;
        }

        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq
            .store(ci.wrapping_add(self.max_capacity), Ordering::Release);
        self.consumer_index
            .store(ci.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Returns the chunk covering the absolute index `pi`, extending the
    /// chain when `pi` steps past the last allocated chunk.
    ///
    /// The walk is safe even when `pi` is stale: chunks are never freed
    /// while the buffer is alive, and a stale claim fails its index CAS and
    /// retries.
    fn producer_chunk_for(&self, pi: usize) -> &Chunk<T> {
        let target = (pi >> self.chunk_shift) & self.chunk_mask;
        let mut chunk = unsafe { &*self.producer_chunk.load(Ordering::Acquire) };

        while chunk.index != target {
            let next = chunk.next.load(Ordering::Acquire);
            let next = if next.is_null() {
                // This chunk is exhausted; grow by one chunk, or close the
                // chain into a ring once every chunk exists.
                self.publish_next_chunk(chunk)
            } else {
                next
            };
            chunk = unsafe { &*next };
        }

        self.producer_chunk
            .store(chunk as *const _ as *mut _, Ordering::Release);
        chunk
    }

    /// Allocates the successor of `chunk` and publishes it through the
    /// jump link. Exactly one producer wins the race; the losers free
    /// their allocation and follow the winner's.
    fn publish_next_chunk(&self, chunk: &Chunk<T>) -> *mut Chunk<T> {
        let num_chunks = self.chunk_mask + 1;
        let successor = if chunk.index + 1 == num_chunks {
            // Fully grown: the last jump link wraps back to the head.
            self.head_chunk
        } else {
            Box::into_raw(Box::new(Chunk::new(
                chunk.index + 1,
                self.chunk_len,
                self.max_capacity,
            )))
        };

        match chunk.next.compare_exchange(
            ptr::null_mut(),
            successor,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if successor != self.head_chunk {
                    self.allocated_chunks.fetch_add(1, Ordering::AcqRel);
                }
                successor
            }
            Err(published) => {
                if successor != self.head_chunk {
                    drop(unsafe { Box::from_raw(successor) });
                }
                published
            }
        }
    }
}

impl<T> Drop for WriteBuffer<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}

        let mut chunk = self.head_chunk;
        loop {
            let next = unsafe { (*chunk).next.load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(chunk) });
            if next.is_null() || next == self.head_chunk {
                break;
            }
            chunk = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_one_chunk_at_a_time() {
        let buffer: WriteBuffer<u32> = WriteBuffer::new(2, 8);
        assert_eq!(buffer.capacity(), 2);

        buffer.enqueue(0).unwrap();
        buffer.enqueue(1).unwrap();
        assert_eq!(buffer.capacity(), 2);

        // Stepping past the first chunk publishes the next one.
        buffer.enqueue(2).unwrap();
        assert_eq!(buffer.capacity(), 4);
        buffer.enqueue(3).unwrap();
        assert_eq!(buffer.capacity(), 4);

        buffer.enqueue(4).unwrap();
        assert_eq!(buffer.capacity(), 6);
        buffer.enqueue(5).unwrap();
        buffer.enqueue(6).unwrap();
        buffer.enqueue(7).unwrap();
        assert_eq!(buffer.capacity(), 8);
    }

    #[test]
    fn fifo_order_across_chunks() {
        let buffer: WriteBuffer<u32> = WriteBuffer::new(2, 4);
        assert_eq!(buffer.capacity(), 2);

        for i in 0..4 {
            assert!(buffer.enqueue(i).is_ok());
        }
        assert_eq!(buffer.capacity(), 4);

        let mut received = Vec::new();
        while let Some(v) = buffer.dequeue() {
            received.push(v);
        }
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_only_at_the_maximum() {
        let buffer: WriteBuffer<u32> = WriteBuffer::new(2, 4);
        for i in 0..4 {
            assert!(buffer.enqueue(i).is_ok());
        }
        assert_eq!(buffer.enqueue(99), Err(99));
        assert_eq!(buffer.len(), 4);

        assert_eq!(buffer.dequeue(), Some(0));
        assert!(buffer.enqueue(99).is_ok());
    }

    #[test]
    fn slots_are_reused_across_laps() {
        let buffer: WriteBuffer<usize> = WriteBuffer::new(2, 4);
        let mut next = 0;
        for _ in 0..5 {
            for _ in 0..4 {
                assert!(buffer.enqueue(next).is_ok());
                next += 1;
            }
            let mut expected = next - 4;
            while let Some(v) = buffer.dequeue() {
                assert_eq!(v, expected);
                expected += 1;
            }
            assert!(buffer.is_empty());
        }
        // Fully grown and wrapped; no further allocations happened.
        assert_eq!(buffer.capacity(), 4);
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        use std::sync::Arc;

        const PER_THREAD: usize = 1_000;
        let buffer: Arc<WriteBuffer<usize>> = Arc::new(WriteBuffer::new(16, 128));
        let mut handles = Vec::new();
        for t in 0..4 {
            let buffer = Arc::clone(&buffer);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let mut v = t * PER_THREAD + i;
                    loop {
                        match buffer.enqueue(v) {
                            Ok(()) => break,
                            Err(v1) => {
                                v = v1;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let mut seen = Vec::new();
        while seen.len() < 4 * PER_THREAD {
            match buffer.dequeue() {
                Some(v) => seen.push(v),
                None => std::thread::yield_now(),
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        seen.sort_unstable();
        let expected = (0..4 * PER_THREAD).collect::<Vec<_>>();
        assert_eq!(seen, expected);
    }

    #[test]
    fn drop_releases_pending_elements() {
        use std::sync::Arc;

        let counter = Arc::new(());
        let buffer: WriteBuffer<Arc<()>> = WriteBuffer::new(2, 8);
        for _ in 0..5 {
            buffer.enqueue(Arc::clone(&counter)).unwrap();
        }
        assert_eq!(Arc::strong_count(&counter), 6);
        drop(buffer);
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
