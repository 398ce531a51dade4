//! A hierarchical timer wheel for per-entry variable expiration in
//! amortized O(1) time.
//!
//! Expiration events are deferred until the wheel is advanced, which is
//! done as part of the cache's maintenance cycle. Each level covers a time
//! span an order of magnitude coarser than the previous one; an entry is
//! linked into the bucket whose span covers its remaining lifetime and
//! cascades into finer buckets as the wheel turns.

use std::{ptr::NonNull, time::Duration};

use parking_lot::Mutex;
use triomphe::Arc as TrioArc;

use super::{
    deque::{CacheRegion, DeqNode, Deque},
    entry::{DeqNodes, EntryInfo},
    math,
    time::Instant,
};

const BUCKET_COUNTS: &[u64] = &[
    64, // roughly seconds
    64, // roughly minutes
    32, // roughly hours
    4,  // roughly days
    1,  // overflow (> ~6.5 days)
];

const OVERFLOW_QUEUE_INDEX: usize = BUCKET_COUNTS.len() - 1;
const NUM_LEVELS: usize = OVERFLOW_QUEUE_INDEX - 1;

const DAY: Duration = Duration::from_secs(60 * 60 * 24);

const SPANS: &[u64] = &[
    aligned_duration(Duration::from_secs(1)),       // 1.07s
    aligned_duration(Duration::from_secs(60)),      // 1.14m
    aligned_duration(Duration::from_secs(60 * 60)), // 1.22h
    aligned_duration(DAY),                          // 1.63d
    BUCKET_COUNTS[3] * aligned_duration(DAY),       // 6.5d
    BUCKET_COUNTS[3] * aligned_duration(DAY),       // 6.5d
];

const SHIFT: &[u64] = &[
    span_shift(SPANS[0]),
    span_shift(SPANS[1]),
    span_shift(SPANS[2]),
    span_shift(SPANS[3]),
    span_shift(SPANS[4]),
];

/// Rounds the duration in nanoseconds up to the next power of two.
const fn aligned_duration(duration: Duration) -> u64 {
    // NOTE: as_nanos() returns u128; the spans all fit in u64.
    math::next_power_of_two_above_u64((duration.as_nanos() as u64) - 1)
}

/// The number of low bits spanned by one bucket at this level.
const fn span_shift(span: u64) -> u64 {
    (u64::BITS - math::leading_zeros_u64(span - 1)) as u64
}

/// The element stored in a wheel bucket: the entry plus its current bucket
/// coordinates (`u8::MAX` when unlinked).
pub(crate) struct TimerNode<K> {
    level: u8,
    index: u8,
    entry_info: TrioArc<EntryInfo<K>>,
    deq_nodes: TrioArc<Mutex<DeqNodes<K>>>,
}

impl<K> TimerNode<K> {
    fn new(
        entry_info: TrioArc<EntryInfo<K>>,
        deq_nodes: TrioArc<Mutex<DeqNodes<K>>>,
        level: usize,
        index: usize,
    ) -> Self {
        Self {
            level: level as u8,
            index: index as u8,
            entry_info,
            deq_nodes,
        }
    }

    pub(crate) fn entry_info(&self) -> &TrioArc<EntryInfo<K>> {
        &self.entry_info
    }

    pub(crate) fn deq_nodes(&self) -> &TrioArc<Mutex<DeqNodes<K>>> {
        &self.deq_nodes
    }

    fn unset_timer_node_in_deq_nodes(&self) {
        self.deq_nodes.lock().set_timer_node(None);
    }
}

type Bucket<K> = Deque<TimerNode<K>>;

#[must_use = "a `Removed` result carries the unlinked node, which the caller must drop"]
pub(crate) enum ReschedulingResult<K> {
    /// The timer event was moved to the bucket covering its new deadline.
    Rescheduled,
    /// The entry no longer has an expiration time, so its node was removed.
    Removed(Box<DeqNode<TimerNode<K>>>),
}

/// The timer wheel. All access happens under the eviction lock.
pub(crate) struct TimerWheel<K> {
    wheels: Box<[Box<[Bucket<K>]>]>,
    /// The time of the last advance.
    current: Instant,
}

unsafe impl<K: Send + Sync> Send for TimerWheel<K> {}

impl<K> TimerWheel<K> {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            wheels: Box::default(),
            current: now,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !self.wheels.is_empty()
    }

    /// Allocates the buckets. Deferred until the first entry with a
    /// per-entry expiration shows up.
    pub(crate) fn enable(&mut self, now: Instant) {
        debug_assert!(!self.is_enabled());
        self.wheels = BUCKET_COUNTS
            .iter()
            .map(|b| {
                (0..*b)
                    .map(|_| Deque::new(CacheRegion::Other))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        self.current = now;
    }

    /// Schedules a timer event for the entry and records the node pointer
    /// in the entry's deque node registry.
    pub(crate) fn schedule(
        &mut self,
        entry_info: TrioArc<EntryInfo<K>>,
        deq_nodes: TrioArc<Mutex<DeqNodes<K>>>,
    ) {
        debug_assert!(self.is_enabled());

        if let Some(t) = entry_info.expiration_time() {
            let (level, index) = self.bucket_indices(t);
            let node = Box::new(DeqNode::new(TimerNode::new(
                entry_info,
                TrioArc::clone(&deq_nodes),
                level,
                index,
            )));
            let node = self.wheels[level][index].push_back(node);
            deq_nodes.lock().set_timer_node(Some(node));
        }
    }

    /// Moves an active timer event to the bucket covering the entry's
    /// updated deadline.
    pub(crate) fn reschedule(&mut self, node: NonNull<DeqNode<TimerNode<K>>>) -> ReschedulingResult<K> {
        debug_assert!(self.is_enabled());
        unsafe { self.unlink_timer(node) };
        self.schedule_existing_node(node)
    }

    /// Removes the timer event for this node.
    pub(crate) fn deschedule(&mut self, node: NonNull<DeqNode<TimerNode<K>>>) {
        debug_assert!(self.is_enabled());
        unsafe {
            self.unlink_timer(node);
            node.as_ref().element.unset_timer_node_in_deq_nodes();
            drop(Box::from_raw(node.as_ptr()));
        }
    }

    /// Re-links an unlinked node. The cache entry keeps a pointer to this
    /// node, so the allocation is reused rather than replaced.
    fn schedule_existing_node(
        &mut self,
        mut node: NonNull<DeqNode<TimerNode<K>>>,
    ) -> ReschedulingResult<K> {
        debug_assert!(self.is_enabled());

        let expiration_time = unsafe { node.as_ref() }.element.entry_info().expiration_time();
        if let Some(t) = expiration_time {
            let (level, index) = self.bucket_indices(t);
            {
                let elem = &mut unsafe { node.as_mut() }.element;
                elem.level = level as u8;
                elem.index = index as u8;
            }
            let node = unsafe { Box::from_raw(node.as_ptr()) };
            self.wheels[level][index].push_back(node);
            ReschedulingResult::Rescheduled
        } else {
            let elem = unsafe { &node.as_ref().element };
            elem.unset_timer_node_in_deq_nodes();
            ReschedulingResult::Removed(unsafe { Box::from_raw(node.as_ptr()) })
        }
    }

    /// Unlinks the node from its bucket without dropping it.
    unsafe fn unlink_timer(&mut self, node: NonNull<DeqNode<TimerNode<K>>>) {
        let elem = &node.as_ref().element;
        let (level, index) = (elem.level, elem.index);
        if level != u8::MAX && index != u8::MAX {
            self.wheels[level as usize][index as usize].unlink(node);
        }
    }

    /// Advances the wheel to `current_time` and returns an iterator over
    /// the timer events up to it. Dropping the iterator before exhaustion
    /// rolls the wheel back to the previous time, so the remaining buckets
    /// are retried on the next advance.
    pub(crate) fn advance(
        &mut self,
        current_time: Instant,
    ) -> impl Iterator<Item = TimerEvent<K>> + '_ {
        debug_assert!(self.is_enabled());

        let previous_time = self.current;
        self.current = current_time;
        TimerEventsIter::new(self, previous_time, current_time)
    }

    fn pop_timer_node(&mut self, level: usize, index: usize) -> Option<Box<DeqNode<TimerNode<K>>>> {
        self.wheels[level][index].pop_front()
    }

    /// Returns the bucket coordinates for the given deadline. A deadline in
    /// the past maps to the current tick of level 0.
    fn bucket_indices(&self, time: Instant) -> (usize, usize) {
        let duration_nanos =
            Instant::duration_to_saturating_nanos(time.saturating_duration_since(self.current));
        // Clamp a past-due deadline to the current tick so the next advance
        // visits its bucket instead of waiting for a full wheel rotation.
        let time_nanos = time.max(self.current).as_nanos();
        for level in 0..=NUM_LEVELS {
            if duration_nanos < SPANS[level + 1] {
                let ticks = time_nanos >> SHIFT[level];
                let index = ticks & (BUCKET_COUNTS[level] - 1);
                return (level, index as usize);
            }
        }
        (OVERFLOW_QUEUE_INDEX, 0)
    }
}

/// A timer event produced by `TimerWheel::advance`.
pub(crate) enum TimerEvent<K> {
    /// This cache entry has passed its deadline. The wheel has already
    /// cleared the entry's pointer to the timer node.
    Expired(Box<DeqNode<TimerNode<K>>>),
    /// This cache entry was moved to a finer bucket. (Observed by tests.)
    Rescheduled(TrioArc<EntryInfo<K>>),
    /// This entry's expiration was unset, so its timer node was removed.
    Descheduled(Box<DeqNode<TimerNode<K>>>),
}

impl<K> std::fmt::Debug for TimerEvent<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expired(_) => f.debug_tuple("Expired").finish(),
            Self::Rescheduled(_) => f.debug_tuple("Rescheduled").finish(),
            Self::Descheduled(_) => f.debug_tuple("Descheduled").finish(),
        }
    }
}

pub(crate) struct TimerEventsIter<'iter, K> {
    timer_wheel: &'iter mut TimerWheel<K>,
    previous_time: Instant,
    current_time: Instant,
    is_done: bool,
    level: usize,
    index: u8,
    end_index: u8,
    index_mask: u64,
    is_index_set: bool,
}

impl<'iter, K> TimerEventsIter<'iter, K> {
    fn new(
        timer_wheel: &'iter mut TimerWheel<K>,
        previous_time: Instant,
        current_time: Instant,
    ) -> Self {
        Self {
            timer_wheel,
            previous_time,
            current_time,
            is_done: false,
            level: 0,
            index: 0,
            end_index: 0,
            index_mask: 0,
            is_index_set: false,
        }
    }
}

impl<'iter, K> Drop for TimerEventsIter<'iter, K> {
    fn drop(&mut self) {
        // Not fully consumed; roll the wheel back so the remaining buckets
        // are visited again by the next advance.
        if !self.is_done {
            self.timer_wheel.current = self.previous_time;
        }
    }
}

impl<'iter, K> Iterator for TimerEventsIter<'iter, K> {
    type Item = TimerEvent<K>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done {
            return None;
        }

        loop {
            // Compute the tick range for the current level.
            if !self.is_index_set {
                let previous_ticks = self.previous_time.as_nanos() >> SHIFT[self.level];
                let current_ticks = self.current_time.as_nanos() >> SHIFT[self.level];

                if current_ticks <= previous_ticks {
                    self.is_done = true;
                    return None;
                }

                self.index_mask = BUCKET_COUNTS[self.level] - 1;
                self.index = (previous_ticks & self.index_mask) as u8;
                let steps =
                    (current_ticks - previous_ticks + 1).min(BUCKET_COUNTS[self.level]) as u8;
                self.end_index = self.index + steps;
                self.is_index_set = true;
            }

            let i = self.index & self.index_mask as u8;
            match self.timer_wheel.pop_timer_node(self.level, i as usize) {
                Some(node) => {
                    let expiration_time = node.as_ref().element.entry_info().expiration_time();
                    if let Some(t) = expiration_time {
                        if t <= self.current_time {
                            node.as_ref().element.unset_timer_node_in_deq_nodes();
                            return Some(TimerEvent::Expired(node));
                        }
                        // Not yet expired; cascade into a finer bucket.
                        let node_p = NonNull::new(Box::into_raw(node)).expect("Got a null ptr");
                        match self.timer_wheel.schedule_existing_node(node_p) {
                            ReschedulingResult::Rescheduled => {
                                let entry_info = unsafe { node_p.as_ref() }.element.entry_info();
                                return Some(TimerEvent::Rescheduled(TrioArc::clone(entry_info)));
                            }
                            ReschedulingResult::Removed(node) => {
                                return Some(TimerEvent::Descheduled(node));
                            }
                        }
                    } else {
                        node.as_ref().element.unset_timer_node_in_deq_nodes();
                        return Some(TimerEvent::Descheduled(node));
                    }
                }
                // This bucket is drained; move to the next one, or level.
                None => {
                    self.index += 1;
                    if self.index >= self.end_index {
                        self.level += 1;
                        if self.level >= BUCKET_COUNTS.len() {
                            self.is_done = true;
                            return None;
                        }
                        self.is_index_set = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use parking_lot::Mutex;
    use triomphe::Arc as TrioArc;

    use super::{TimerEvent, TimerWheel, SPANS};
    use crate::common::{
        entry::{DeqNodes, EntryInfo, KeyHash},
        time::{Clock, Instant, Mock},
    };

    #[test]
    fn bucket_placement() {
        fn place(timer: &TimerWheel<()>, now: Instant, dur: Duration) -> (usize, usize) {
            timer.bucket_indices(now.checked_add(dur).unwrap())
        }

        let (clock, mock) = Clock::mock();
        let now = clock.now();
        let mut timer = TimerWheel::<()>::new(now);
        timer.enable(now);

        assert_eq!(timer.bucket_indices(now), (0, 0));

        // Level 0 holds deadlines within 64 ticks of ~1.07s each.
        assert_eq!(place(&timer, now, ns(SPANS[0] * 7)), (0, 7));
        assert_eq!(place(&timer, now, ns(SPANS[0] * 63)), (0, 63));

        // One full level-0 rotation ahead lands on the minutes level.
        assert_eq!(place(&timer, now, ns(SPANS[0] * 64)), (1, 1));
        assert_eq!(place(&timer, now, ns(SPANS[1] * 5)), (1, 5));

        // Hours, then days.
        assert_eq!(place(&timer, now, ns(SPANS[2] * 9)), (2, 9));
        assert_eq!(place(&timer, now, ns(SPANS[3] * 2)), (3, 2));

        // Beyond ~6.5 days everything shares the single overflow queue.
        assert_eq!(place(&timer, now, ns(SPANS[3] * 4)), (4, 0));
        assert_eq!(place(&timer, now, ns(SPANS[4] * 10)), (4, 0));

        // Move the wheel three ticks forward. Bucket indices are absolute
        // (derived from the deadline itself), so level 0 wraps modulo 64.
        let now = move_clock(&clock, &mock, ns(SPANS[0] * 3));
        timer.current = now;

        assert_eq!(place(&timer, now, ns(SPANS[0] - 1)), (0, 3));
        assert_eq!(place(&timer, now, ns(SPANS[0] * 61)), (0, 0));
        assert_eq!(place(&timer, now, ns(SPANS[1])), (1, 1));

        // A deadline already in the past is clamped to the current tick,
        // so the next advance fires it instead of waiting for a rotation.
        assert_eq!(timer.bucket_indices(Instant::from_nanos(SPANS[0])), (0, 3));
    }

    #[test]
    fn advance_fires_due_timers() {
        fn schedule(timer: &mut TimerWheel<u32>, key: u32, now: Instant, ttl: Duration) {
            let key_hash = KeyHash::new(Arc::new(key), u64::from(key));
            let entry_info = TrioArc::new(EntryInfo::new(key_hash, now, 0));
            entry_info.set_expiration_time(Some(now.checked_add(ttl).unwrap()));
            timer.schedule(entry_info, TrioArc::new(Mutex::new(DeqNodes::default())));
        }

        fn next_expired(events: &mut impl Iterator<Item = TimerEvent<u32>>) -> Option<u32> {
            match events.next() {
                Some(TimerEvent::Expired(node)) => {
                    Some(*node.element.entry_info().key_hash().key)
                }
                Some(other) => panic!("expected an expired timer, got {other:?}"),
                None => None,
            }
        }

        fn next_rescheduled(events: &mut impl Iterator<Item = TimerEvent<u32>>) -> Option<u32> {
            match events.next() {
                Some(TimerEvent::Rescheduled(info)) => Some(*info.key_hash().key),
                Some(other) => panic!("expected a rescheduled timer, got {other:?}"),
                None => None,
            }
        }

        let (clock, mock) = Clock::mock();
        let now = move_clock(&clock, &mock, secs(7));
        let mut timer = TimerWheel::<u32>::new(now);
        timer.enable(now);

        // Seconds-level timers, due at 9s, 16s and 37s.
        schedule(&mut timer, 10, now, secs(2));
        schedule(&mut timer, 11, now, secs(9));
        schedule(&mut timer, 12, now, secs(30));

        let now = move_clock(&clock, &mock, secs(5)); // 12s
        let mut events = timer.advance(now);
        assert_eq!(next_expired(&mut events), Some(10));
        assert_eq!(next_expired(&mut events), None);
        drop(events);

        let now = move_clock(&clock, &mock, secs(5)); // 17s
        let mut events = timer.advance(now);
        assert_eq!(next_expired(&mut events), Some(11));
        assert_eq!(next_expired(&mut events), None);
        drop(events);

        let now = move_clock(&clock, &mock, secs(21)); // 38s
        let mut events = timer.advance(now);
        assert_eq!(next_expired(&mut events), Some(12));
        assert_eq!(next_expired(&mut events), None);
        drop(events);

        // Minutes-level timers, due at 218s and 638s.
        schedule(&mut timer, 20, now, secs(180));
        schedule(&mut timer, 21, now, secs(600));

        // Far from either deadline: a sweep fires nothing.
        let now = move_clock(&clock, &mock, secs(162)); // 200s
        let mut events = timer.advance(now);
        assert_eq!(next_expired(&mut events), None);
        drop(events);

        let now = move_clock(&clock, &mock, secs(40)); // 240s
        let mut events = timer.advance(now);
        assert_eq!(next_expired(&mut events), Some(20));
        assert_eq!(next_expired(&mut events), None);
        drop(events);

        let now = move_clock(&clock, &mock, secs(360)); // 600s
        let mut events = timer.advance(now);
        assert_eq!(next_expired(&mut events), None);
        drop(events);

        // At 630s the 638s deadline is within a minute-bucket of the
        // present, so it cascades into the seconds level instead of
        // firing.
        let now = move_clock(&clock, &mock, secs(30)); // 630s
        let mut events = timer.advance(now);
        assert_eq!(next_rescheduled(&mut events), Some(21));
        assert!(events.next().is_none());
        drop(events);

        let now = move_clock(&clock, &mock, secs(10)); // 640s
        let mut events = timer.advance(now);
        assert_eq!(next_expired(&mut events), Some(21));
        assert_eq!(next_expired(&mut events), None);
        drop(events);

        // A ten-day timer waits in the overflow queue, cascades onto the
        // days level once its deadline is within range, and then fires.
        const DAY: u64 = 24 * 60 * 60;
        schedule(&mut timer, 30, now, secs(10 * DAY));

        let now = move_clock(&clock, &mock, secs(7 * DAY));
        let mut events = timer.advance(now);
        assert_eq!(next_rescheduled(&mut events), Some(30));
        assert!(events.next().is_none());
        drop(events);

        let now = move_clock(&clock, &mock, secs(4 * DAY));
        let mut events = timer.advance(now);
        assert_eq!(next_expired(&mut events), Some(30));
        assert_eq!(next_expired(&mut events), None);
        drop(events);
    }

    fn move_clock(clock: &Clock, mock: &Arc<Mock>, duration: Duration) -> Instant {
        mock.increment(duration);
        clock.now()
    }

    fn ns(nanos: u64) -> Duration {
        Duration::from_nanos(nanos)
    }

    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }
}
