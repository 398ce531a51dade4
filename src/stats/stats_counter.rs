use std::{
    ops::Add,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::{atomic::AtomicCell, CachePadded};
use once_cell::sync::Lazy;

use super::CacheStats;
use crate::notification::RemovalCause;

fn saturating_add(counter: &AtomicCell<u64>, value: u64) {
    let mut v0 = counter.load();
    loop {
        let v1 = v0.saturating_add(value);
        match counter.compare_exchange(v0, v1) {
            Ok(_) => break,
            Err(v2) => v0 = v2,
        }
    }
}

/// Accumulates cache events. Implementations must tolerate concurrent
/// calls from many threads.
pub trait StatsCounter {
    type Stats;

    #[allow(unused_variables)]
    fn record_hits(&self, count: u32) {}

    #[allow(unused_variables)]
    fn record_misses(&self, count: u32) {}

    #[allow(unused_variables)]
    fn record_load_success(&self, load_time_nanos: u64) {}

    #[allow(unused_variables)]
    fn record_load_failure(&self, load_time_nanos: u64) {}

    #[allow(unused_variables)]
    fn record_eviction(&self, weight: u32, cause: RemovalCause) {}

    fn snapshot(&self) -> Self::Stats;
}

/// A `StatsCounter` that does not record any cache events.
#[derive(Default)]
pub struct DisabledStatsCounter;

impl StatsCounter for DisabledStatsCounter {
    type Stats = CacheStats;

    fn snapshot(&self) -> Self::Stats {
        CacheStats::default()
    }
}

/// The standard counter: lock-free saturating accumulators.
#[derive(Default)]
pub struct DefaultStatsCounter {
    hit_count: AtomicCell<u64>,
    miss_count: AtomicCell<u64>,
    load_success_count: AtomicCell<u64>,
    load_failure_count: AtomicCell<u64>,
    total_load_time: AtomicCell<u64>,
    eviction_count: AtomicCell<u64>,
    eviction_weight: AtomicCell<u64>,
}

impl DefaultStatsCounter {
    pub fn striped() -> StripedStatsCounter<Self> {
        Default::default()
    }
}

impl StatsCounter for DefaultStatsCounter {
    type Stats = CacheStats;

    fn record_hits(&self, count: u32) {
        saturating_add(&self.hit_count, count as u64);
    }

    fn record_misses(&self, count: u32) {
        saturating_add(&self.miss_count, count as u64);
    }

    fn record_load_success(&self, load_time_nanos: u64) {
        saturating_add(&self.load_success_count, 1);
        saturating_add(&self.total_load_time, load_time_nanos);
    }

    fn record_load_failure(&self, load_time_nanos: u64) {
        saturating_add(&self.load_failure_count, 1);
        saturating_add(&self.total_load_time, load_time_nanos);
    }

    /// Counts only evictions decided by the cache (`Expired` or `Size`);
    /// manual removals and replacements are ignored.
    fn record_eviction(&self, weight: u32, cause: RemovalCause) {
        if cause.was_evicted() {
            saturating_add(&self.eviction_count, 1);
            saturating_add(&self.eviction_weight, weight as u64);
        }
    }

    fn snapshot(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        stats.set_req_counts(self.hit_count.load(), self.miss_count.load());
        stats.set_load_counts(
            self.load_success_count.load(),
            self.load_failure_count.load(),
            self.total_load_time.load(),
        );
        stats.set_eviction_counts(self.eviction_count.load(), self.eviction_weight.load());
        stats
    }
}

/// A `StatsCounter` that wraps an array of another `StatsCounter` type to
/// improve concurrency. Each thread records into its own slot; the
/// snapshot is the sum over the slots.
pub struct StripedStatsCounter<C> {
    // Pad each counter so concurrent updates do not invalidate each
    // other's cache lines.
    counters: Box<[CachePadded<C>]>,
}

static NUM_COUNTERS: Lazy<usize> = Lazy::new(crate::common::available_parallelism);

impl<C> Default for StripedStatsCounter<C>
where
    C: Default,
{
    fn default() -> Self {
        Self::new_with(Default::default)
    }
}

impl<C> StripedStatsCounter<C> {
    pub fn new_with(f: impl FnMut() -> C) -> Self {
        let counters = std::iter::repeat_with(f)
            .map(CachePadded::new)
            .take(*NUM_COUNTERS)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self { counters }
    }

    /// Returns the counter for the current thread.
    fn counter(&self) -> &C {
        thread_local! { static MY_INDEX: usize = next_index() };
        MY_INDEX.with(|i| &self.counters[*i % self.counters.len()])
    }
}

impl<C> StatsCounter for StripedStatsCounter<C>
where
    C: StatsCounter,
    for<'a> &'a C::Stats: Add<Output = C::Stats>,
{
    type Stats = C::Stats;

    fn record_hits(&self, count: u32) {
        self.counter().record_hits(count);
    }

    fn record_misses(&self, count: u32) {
        self.counter().record_misses(count);
    }

    fn record_load_success(&self, load_time_nanos: u64) {
        self.counter().record_load_success(load_time_nanos);
    }

    fn record_load_failure(&self, load_time_nanos: u64) {
        self.counter().record_load_failure(load_time_nanos);
    }

    fn record_eviction(&self, weight: u32, cause: RemovalCause) {
        self.counter().record_eviction(weight, cause);
    }

    fn snapshot(&self) -> Self::Stats {
        let mut iter = self.counters.iter();
        let first = iter.next().expect("There is no counter").snapshot();
        iter.fold(first, |acc, counter| &acc + &counter.snapshot())
    }
}

fn next_index() -> usize {
    static INDEX: Lazy<AtomicUsize> = Lazy::new(Default::default);

    let mut i0 = INDEX.load(Ordering::Acquire);
    loop {
        let i1 = (i0 + 1) % *NUM_COUNTERS;
        match INDEX.compare_exchange_weak(i0, i1, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return i0,
            Err(i2) => i0 = i2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_counter_records_and_snapshots() {
        let counter = DefaultStatsCounter::default();
        counter.record_hits(3);
        counter.record_misses(2);
        counter.record_load_success(100);
        counter.record_load_failure(50);
        counter.record_eviction(7, RemovalCause::Size);
        counter.record_eviction(9, RemovalCause::Explicit); // ignored

        let stats = counter.snapshot();
        assert_eq!(stats.hit_count(), 3);
        assert_eq!(stats.miss_count(), 2);
        assert_eq!(stats.load_success_count(), 1);
        assert_eq!(stats.load_failure_count(), 1);
        assert_eq!(stats.total_load_time_nanos(), 150);
        assert_eq!(stats.eviction_count(), 1);
        assert_eq!(stats.eviction_weight(), 7);
    }

    #[test]
    fn striped_counter_sums_over_threads() {
        use std::sync::Arc;

        let counter = Arc::new(DefaultStatsCounter::striped());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    counter.record_hits(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.snapshot().hit_count(), 400);
    }
}
