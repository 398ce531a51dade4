//! The cache engine shared by the public `Cache` type: the sharded node
//! store, the read/write event buffers, and the maintenance routine that
//! applies the buffered events to the W-TinyLFU policy structures.

use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use triomphe::Arc as TrioArc;

use crate::{
    common::{
        self,
        atomic_time::AtomicInstant,
        deque::CacheRegion,
        deques::Deques,
        entry::{EntryInfo, EntryState, KeyHash, KvEntry, ReadOp, ValueEntry, Weigher, WriteOp},
        executor::Executor,
        frequency_sketch::FrequencySketch,
        housekeeper::{Housekeeper, InnerSync},
        read_buffer::{BufferResult, ReadBuffer},
        store::{GetOrInsert, StripedHashMap},
        time::{Clock, Instant},
        timer_wheel::{TimerEvent, TimerWheel},
        write_buffer::WriteBuffer,
    },
    error::WriterError,
    loader::CacheLoader,
    notification::{notifier::RemovalNotifier, EvictionListener, RemovalCause},
    policy::{ExpirationPolicy, Policy},
    stats::{CacheStats, StatsCounter},
    writer::CacheWriter,
};

/// The upper bound for expiration and refresh deadlines. Keeps every
/// nanosecond addition representable in 63 bits.
pub(crate) const MAX_EXPIRY: Duration = Duration::from_nanos(u64::MAX >> 1);

/// An update arriving within this window of the previous write keeps the
/// old write time, so hot keys do not storm the write-order queue.
const WRITE_TIME_TOLERANCE: Duration = Duration::from_secs(1);

/// How many failed enqueue attempts a writer makes before draining the
/// write buffer itself.
const WRITE_RETRY_LIMIT: usize = 100;

/// How many times one maintenance run re-drains the buffers when they
/// refill while it works.
const MAX_LOG_SYNC_REPEATS: usize = 4;

const WRITE_LOG_FLUSH_POINT: usize = 64;

/// The most entries one maintenance run will expire or evict per queue.
const EVICTION_BATCH_SIZE: usize = 500;

const WRITE_BUFFER_INITIAL_SIZE: usize = 16;

/// A candidate whose frequency is at or below this is never admitted over
/// a victim with an equal or higher frequency.
const ADMIT_HILL_CLIMB_THRESHOLD: u8 = 5;

pub(crate) type StatsCounterArc =
    Arc<dyn StatsCounter<Stats = CacheStats> + Send + Sync + 'static>;

pub(crate) struct BaseCache<K, V, S = RandomState> {
    pub(crate) inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> Clone for BaseCache<K, V, S> {
    /// Makes a clone of this shared cache. This is a cheap operation; the
    /// clones share the same internal data structures.
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed | 1, // must be nonzero
        }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }
}

/// The size accounting a maintenance run works against. Loaded from the
/// shared cells at the start of a run and stored back when it finishes.
struct EvictionCounters {
    entry_count: u64,
    weighted_size: u64,
    eden_weighted_size: u64,
    protected_weighted_size: u64,
}

impl EvictionCounters {
    fn add_entry(&mut self, weight: u32) {
        self.entry_count += 1;
        self.weighted_size = self.weighted_size.saturating_add(weight as u64);
        self.eden_weighted_size = self.eden_weighted_size.saturating_add(weight as u64);
    }

    fn remove_entry(&mut self, weight: u32, region: Option<CacheRegion>) {
        self.entry_count = self.entry_count.saturating_sub(1);
        self.weighted_size = self.weighted_size.saturating_sub(weight as u64);
        self.sub_region_weight(region, weight);
    }

    fn update_weight(&mut self, old_weight: u32, new_weight: u32, region: Option<CacheRegion>) {
        self.weighted_size = self
            .weighted_size
            .saturating_sub(old_weight as u64)
            .saturating_add(new_weight as u64);
        match region {
            Some(CacheRegion::Eden) => {
                self.eden_weighted_size = self
                    .eden_weighted_size
                    .saturating_sub(old_weight as u64)
                    .saturating_add(new_weight as u64);
            }
            Some(CacheRegion::MainProtected) => {
                self.protected_weighted_size = self
                    .protected_weighted_size
                    .saturating_sub(old_weight as u64)
                    .saturating_add(new_weight as u64);
            }
            _ => (),
        }
    }

    fn sub_region_weight(&mut self, region: Option<CacheRegion>, weight: u32) {
        match region {
            Some(CacheRegion::Eden) => {
                self.eden_weighted_size = self.eden_weighted_size.saturating_sub(weight as u64);
            }
            Some(CacheRegion::MainProtected) => {
                self.protected_weighted_size =
                    self.protected_weighted_size.saturating_sub(weight as u64);
            }
            _ => (),
        }
    }
}

pub(crate) struct Inner<K, V, S> {
    name: Option<String>,
    max_capacity: AtomicCell<Option<u64>>,
    entry_count: AtomicCell<u64>,
    weighted_size: AtomicCell<u64>,
    eden_weighted_size: AtomicCell<u64>,
    protected_weighted_size: AtomicCell<u64>,
    store: StripedHashMap<K, TrioArc<ValueEntry<K, V>>, S>,
    read_buffer: ReadBuffer<ReadOp<K, V>>,
    write_buffer: WriteBuffer<WriteOp<K, V>>,
    /// The eviction lock. Owns every policy structure; always acquired
    /// before `timer_wheel`.
    deques: Mutex<Deques<K>>,
    timer_wheel: Mutex<TimerWheel<K>>,
    frequency_sketch: RwLock<FrequencySketch>,
    frequency_sketch_enabled: AtomicBool,
    admission_seed: AtomicCell<u64>,
    expiration: ExpirationPolicy<K, V>,
    refresh_after_write: Option<Duration>,
    valid_after: AtomicInstant,
    weigher: Option<Weigher<K, V>>,
    writer: Option<Arc<dyn CacheWriter<K, V>>>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    removal_notifier: Option<RemovalNotifier<K, V>>,
    stats_counter: Option<StatsCounterArc>,
    executor: Executor,
    housekeeper: Housekeeper,
    clock: Clock,
}

impl<K, V, S> BaseCache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: Option<String>,
        max_capacity: Option<u64>,
        initial_capacity: Option<usize>,
        build_hasher: S,
        weigher: Option<Weigher<K, V>>,
        writer: Option<Arc<dyn CacheWriter<K, V>>>,
        loader: Option<Arc<dyn CacheLoader<K, V>>>,
        eviction_listener: Option<EvictionListener<K, V>>,
        expiration: ExpirationPolicy<K, V>,
        refresh_after_write: Option<Duration>,
        stats_counter: Option<StatsCounterArc>,
        executor: Executor,
        clock: Clock,
    ) -> Self {
        let (num_shards, initial_capacity) = if max_capacity == Some(0) {
            (1, 0)
        } else {
            (64, initial_capacity.unwrap_or_default())
        };
        let store = StripedHashMap::with_num_shards_capacity_and_hasher(
            num_shards,
            initial_capacity,
            build_hasher,
        );

        let write_buffer_max = (128 * common::available_parallelism())
            .next_power_of_two()
            .min(32_768);

        let removal_notifier = eviction_listener
            .map(|listener| RemovalNotifier::new(listener, executor.clone(), name.clone()));

        let now = clock.now();
        let inner = Inner {
            name,
            max_capacity: AtomicCell::new(max_capacity),
            entry_count: AtomicCell::new(0),
            weighted_size: AtomicCell::new(0),
            eden_weighted_size: AtomicCell::new(0),
            protected_weighted_size: AtomicCell::new(0),
            store,
            read_buffer: ReadBuffer::new(),
            write_buffer: WriteBuffer::new(WRITE_BUFFER_INITIAL_SIZE, write_buffer_max),
            deques: Mutex::new(Deques::default()),
            timer_wheel: Mutex::new(TimerWheel::new(now)),
            frequency_sketch: RwLock::new(FrequencySketch::default()),
            frequency_sketch_enabled: AtomicBool::default(),
            admission_seed: AtomicCell::new(0x9e37_79b9_7f4a_7c15),
            expiration,
            refresh_after_write,
            valid_after: AtomicInstant::default(),
            weigher,
            writer,
            loader,
            removal_notifier,
            stats_counter,
            executor,
            housekeeper: Housekeeper::default(),
            clock,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub(crate) fn policy(&self) -> Policy {
        let exp = &self.inner.expiration;
        Policy::new(
            self.inner.max_capacity.load(),
            self.inner.store_num_shards(),
            exp.time_to_live(),
            exp.time_to_idle(),
            self.inner.refresh_after_write,
        )
    }

    pub(crate) fn entry_count(&self) -> u64 {
        self.inner.entry_count.load()
    }

    pub(crate) fn weighted_size(&self) -> u64 {
        self.inner.weighted_size.load()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        self.inner
            .stats_counter
            .as_ref()
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    pub(crate) fn inner_loader(&self) -> Option<Arc<dyn CacheLoader<K, V>>> {
        self.inner.loader.as_ref().map(Arc::clone)
    }

    #[inline]
    pub(crate) fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.inner.store.hash(key)
    }

    pub(crate) fn contains_key_with_hash<Q>(&self, key: &Q, hash: u64) -> bool
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.inner.is_disabled() {
            return false;
        }
        let now = self.inner.clock.now();
        self.inner
            .store
            .get_key_value_and(hash, key, |_k, entry| !self.inner.is_invalid_or_expired(entry, now))
            .unwrap_or_default()
    }

    /// The read path: validates liveness, applies the read expiry hook,
    /// records the access and possibly triggers a refresh.
    pub(crate) fn get_with_hash<Q>(&self, key: &Q, hash: u64) -> Option<V>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.inner.is_disabled() {
            self.inner.record_misses(1);
            return None;
        }

        let now = self.inner.clock.now();
        let maybe_entry = self
            .inner
            .store
            .get_key_value_and_then(hash, key, |_k, entry| {
                if self.inner.is_invalid_or_expired(entry, now) {
                    None
                } else {
                    Some(TrioArc::clone(entry))
                }
            });

        if let Some(entry) = maybe_entry {
            let is_expiry_modified = self.inner.apply_expiry_on_read(&entry, now);
            entry.entry_info().set_last_accessed(now);

            if self.inner.refresh_after_write.is_some() {
                self.maybe_refresh(&entry, now);
            }

            let v = entry.value.clone();
            self.record_read(
                ReadOp::Hit {
                    value_entry: entry,
                    is_expiry_modified,
                },
                now,
            );
            self.inner.record_hits(1);
            Some(v)
        } else {
            self.record_read(ReadOp::Miss(hash), now);
            self.inner.record_misses(1);
            None
        }
    }

    #[inline]
    fn record_read(&self, op: ReadOp<K, V>, now: Instant) {
        match self.inner.read_buffer.offer(op) {
            // The buffer is filling faster than it drains; apply the
            // pending events now.
            BufferResult::Full => self.inner.housekeeper.try_schedule(&*self.inner),
            BufferResult::Added | BufferResult::Failed => {
                if self.inner.housekeeper.is_run_due(now) {
                    self.inner.housekeeper.try_schedule(&*self.inner);
                }
            }
        }
    }

    /// The write path for explicit inserts and updates.
    pub(crate) fn insert_with_hash(
        &self,
        key: Arc<K>,
        hash: u64,
        value: V,
    ) -> Result<(), WriterError> {
        if self.inner.is_disabled() {
            // A zero-capacity cache never retains the entry, but the
            // write-through contract still holds.
            if let Some(writer) = &self.inner.writer {
                writer.write(&key, &value).map_err(WriterError::write)?;
            }
            return Ok(());
        }

        let inner = &self.inner;
        let weight = inner.weigh(&key, &value);
        let now = inner.clock.now();

        // Both closures run under the key's shard lock; the write-through
        // callback failing aborts the mutation.
        let mut modified = None;
        let (entry, _old) = inner.store.insert_with_or_modify(
            Arc::clone(&key),
            hash,
            || {
                if let Some(writer) = &inner.writer {
                    writer.write(&key, &value).map_err(WriterError::write)?;
                }
                Ok(inner.make_insert(&key, hash, value.clone(), weight, now))
            },
            |_k, old_entry| {
                if let Some(writer) = &inner.writer {
                    writer.write(&key, &value).map_err(WriterError::write)?;
                }
                let upd = inner.make_update(&key, hash, value.clone(), weight, old_entry, now);
                modified = Some((
                    TrioArc::clone(old_entry),
                    upd.old_weight,
                    upd.old_last_accessed,
                    upd.old_last_modified,
                ));
                Ok(upd.entry)
            },
        )?;

        let old_weight = match modified {
            Some((old_entry, old_weight, old_la, old_lm)) => {
                inner.notify_upsert(Arc::clone(&key), &old_entry, old_la, old_lm, now);
                old_weight
            }
            None => 0,
        };
        self.schedule_write_op(WriteOp::Upsert {
            key_hash: KeyHash::new(key, hash),
            value_entry: entry,
            old_weight,
            new_weight: weight,
        });
        Ok(())
    }

    /// Atomic compute-if-absent. `init` runs at most once per key per
    /// concurrent attempt, under the key's shard lock; it must not call
    /// back into this cache.
    pub(crate) fn get_or_insert_with(&self, key: Arc<K>, hash: u64, init: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get_with_hash(&key, hash) {
            return v;
        }

        if self.inner.is_disabled() {
            return init();
        }

        let inner = &self.inner;
        let now = inner.clock.now();
        let mut load_nanos = 0;
        let result = inner.store.get_or_insert_with(
            Arc::clone(&key),
            hash,
            |_k, existing| {
                // Re-check under the lock; another thread may have won the
                // race after our miss above.
                let alive = !inner.is_invalid_or_expired(existing, now);
                if alive {
                    existing.entry_info().set_last_accessed(now);
                }
                alive
            },
            || {
                let load_start = inner.clock.fast_now();
                let value = init();
                load_nanos = inner
                    .clock
                    .fast_now()
                    .saturating_duration_since(load_start)
                    .as_nanos() as u64;
                let weight = inner.weigh(&key, &value);
                inner.make_insert(&key, hash, value, weight, now)
            },
        );

        match result {
            GetOrInsert::Present(entry) => entry.value.clone(),
            GetOrInsert::Inserted { entry, displaced } => {
                inner.record_load_success(load_nanos);

                let mut ops: SmallVec<[WriteOp<K, V>; 2]> = SmallVec::new();
                // The displaced mapping had failed the liveness check; its
                // removal is notified with the cause that killed it.
                if let Some(old_entry) = displaced {
                    old_entry.entry_info().set_state(EntryState::Retired);
                    old_entry.entry_info().set_dirty(true);
                    let cause = inner.removal_cause_for(&old_entry, now);
                    inner.notify_removal(Arc::clone(&key), old_entry.value.clone(), cause);
                    ops.push(WriteOp::Remove(KvEntry::new(Arc::clone(&key), old_entry)));
                }
                ops.push(WriteOp::Upsert {
                    key_hash: KeyHash::new(key, hash),
                    value_entry: TrioArc::clone(&entry),
                    old_weight: 0,
                    new_weight: entry.policy_weight(),
                });
                for op in ops {
                    self.schedule_write_op(op);
                }
                entry.value.clone()
            }
        }
    }

    /// Removes the mapping. Returns the removed value unless the entry was
    /// already expired, in which case the removal still happens but the
    /// caller observes an absent entry.
    pub(crate) fn remove_with_hash<Q>(&self, key: &Q, hash: u64) -> Result<Option<V>, WriterError>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.inner.is_disabled() {
            return Ok(None);
        }

        let now = self.inner.clock.now();
        let removed = {
            let shard = self.inner.store.shard(hash);
            let mut map = shard.write();

            let Some(entry_ref) = map.get(key) else {
                return Ok(None);
            };
            let entry = TrioArc::clone(entry_ref);
            let cause = self.inner.removal_cause_for(&entry, now);

            if let Some(writer) = &self.inner.writer {
                writer
                    .delete(&entry.entry_info().key_hash().key, &entry.value, cause)
                    .map_err(WriterError::delete)?;
            }

            let (stored_key, entry) = map.remove_entry(key).expect("the entry vanished");
            drop(map);

            entry.entry_info().set_state(EntryState::Retired);
            entry.entry_info().set_dirty(true);
            self.inner
                .notify_removal(Arc::clone(&stored_key), entry.value.clone(), cause);

            let value = if cause == RemovalCause::Explicit {
                Some(entry.value.clone())
            } else {
                None
            };
            self.schedule_write_op(WriteOp::Remove(KvEntry::new(stored_key, entry)));
            value
        };
        Ok(removed)
    }

    /// Discards every entry written before now. The entries are removed
    /// lazily: reads treat them as absent immediately and maintenance
    /// unlinks them as it encounters them.
    pub(crate) fn invalidate_all(&self) {
        let now = self.inner.clock.now();
        self.inner.valid_after.set_instant(now);
        self.inner.housekeeper.try_schedule(&*self.inner);
    }

    /// A non-blocking refresh through the configured loader. Returns
    /// `true` when a reload was started (or completed, with a same-thread
    /// executor).
    pub(crate) fn refresh_with_hash<Q>(&self, key: &Q, hash: u64) -> bool
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.inner.loader.is_none() || self.inner.is_disabled() {
            return false;
        }
        let now = self.inner.clock.now();
        let Some(entry) = self.inner.store.get(hash, key) else {
            return false;
        };
        if self.inner.is_invalid_or_expired(&entry, now) {
            return false;
        }
        self.start_refresh(entry, hash, now)
    }

    fn maybe_refresh(&self, entry: &TrioArc<ValueEntry<K, V>>, now: Instant) {
        let Some(refresh_after) = self.inner.refresh_after_write else {
            return;
        };
        if self.inner.loader.is_none() {
            return;
        }
        let Some(lm) = entry.last_modified() else {
            return;
        };
        // A write time in the future is the in-flight refresh sentinel.
        match now.checked_duration_since(lm) {
            Some(age) if age > refresh_after => (),
            _ => return,
        }
        let hash = entry.entry_info().key_hash().hash;
        self.start_refresh(TrioArc::clone(entry), hash, now);
    }

    /// Claims the entry for refreshing by swinging its write time to a
    /// far-future sentinel, then runs the reload on the executor.
    fn start_refresh(&self, entry: TrioArc<ValueEntry<K, V>>, hash: u64, now: Instant) -> bool {
        let Some(old_lm) = entry.last_modified() else {
            return false;
        };
        if old_lm > now {
            // Another refresh is in flight.
            return false;
        }
        let sentinel = now.saturating_add(MAX_EXPIRY);
        if !entry.entry_info().cas_last_modified(old_lm, sentinel) {
            return false;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.executor.run(Box::new(move || {
            Inner::run_reload(inner, entry, hash, old_lm, sentinel);
        }));
        true
    }

    /// Appends a write operation, draining the buffer ourselves if
    /// producers outrun the maintenance routine, then schedules a drain.
    fn schedule_write_op(&self, op: WriteOp<K, V>) {
        let mut op = op;
        let mut retries = 0;
        loop {
            match self.inner.write_buffer.enqueue(op) {
                Ok(()) => break,
                Err(rejected) => {
                    op = rejected;
                    retries += 1;
                    if retries >= WRITE_RETRY_LIMIT {
                        self.inner.housekeeper.run_now(&*self.inner);
                        retries = 0;
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
        self.inner.housekeeper.try_schedule(&*self.inner);
    }

    pub(crate) fn run_pending_tasks(&self) {
        self.inner.housekeeper.run_now(&*self.inner);
    }

    //
    // The policy facade.
    //

    pub(crate) fn set_max_capacity(&self, max_capacity: u64) {
        if self.inner.max_capacity.load().is_none() {
            // An unbounded cache has no policy structures to resize.
            return;
        }
        self.inner.max_capacity.store(Some(max_capacity));
        if self.inner.frequency_sketch_enabled.load(Ordering::Acquire) {
            self.inner
                .frequency_sketch
                .write()
                .ensure_capacity(common::sketch_capacity(max_capacity));
        }
        self.inner.housekeeper.try_schedule(&*self.inner);
    }

    pub(crate) fn weight_of<Q>(&self, key: &Q, hash: u64) -> Option<u32>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = self.inner.clock.now();
        self.inner.store.get_key_value_and_then(hash, key, |_k, entry| {
            if self.inner.is_invalid_or_expired(entry, now) {
                None
            } else {
                Some(entry.policy_weight())
            }
        })
    }

    /// Entries ordered by estimated frequency, most popular first.
    pub(crate) fn hottest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        let mut snapshot = self.frequency_snapshot();
        snapshot.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        snapshot.truncate(limit);
        snapshot.into_iter().map(|(kv, _, _)| kv).collect()
    }

    /// Entries ordered by estimated frequency, least popular first.
    pub(crate) fn coldest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        let mut snapshot = self.frequency_snapshot();
        snapshot.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));
        snapshot.truncate(limit);
        snapshot.into_iter().map(|(kv, _, _)| kv).collect()
    }

    /// Entries ordered by write time, most recently written first.
    pub(crate) fn youngest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        let mut snapshot = self.write_time_snapshot();
        snapshot.sort_by(|a, b| b.1.cmp(&a.1));
        snapshot.truncate(limit);
        snapshot.into_iter().map(|(kv, _)| kv).collect()
    }

    /// Entries ordered by write time, least recently written first.
    pub(crate) fn oldest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        let mut snapshot = self.write_time_snapshot();
        snapshot.sort_by(|a, b| a.1.cmp(&b.1));
        snapshot.truncate(limit);
        snapshot.into_iter().map(|(kv, _)| kv).collect()
    }

    /// Entries with a per-entry expiration, ordered by deadline, soonest
    /// first.
    pub(crate) fn expiring_soonest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        let mut snapshot = self.expiration_snapshot();
        snapshot.sort_by(|a, b| a.1.cmp(&b.1));
        snapshot.truncate(limit);
        snapshot.into_iter().map(|(kv, _)| kv).collect()
    }

    /// Entries with a per-entry expiration, ordered by deadline, latest
    /// first.
    pub(crate) fn expiring_latest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        let mut snapshot = self.expiration_snapshot();
        snapshot.sort_by(|a, b| b.1.cmp(&a.1));
        snapshot.truncate(limit);
        snapshot.into_iter().map(|(kv, _)| kv).collect()
    }

    fn live_entries(&self) -> Vec<(Arc<K>, TrioArc<ValueEntry<K, V>>)> {
        let now = self.inner.clock.now();
        let mut entries = Vec::new();
        self.inner.store.for_each_entry(|k, entry| {
            if !self.inner.is_invalid_or_expired(entry, now) {
                entries.push((Arc::clone(k), TrioArc::clone(entry)));
            }
        });
        entries
    }

    #[allow(clippy::type_complexity)]
    fn frequency_snapshot(&self) -> Vec<((Arc<K>, V), u8, Option<Instant>)> {
        let entries = self.live_entries();
        let freq = self.inner.frequency_sketch.read();
        entries
            .into_iter()
            .map(|(k, entry)| {
                let frequency = freq.frequency(entry.entry_info().key_hash().hash);
                let last_accessed = entry.last_accessed();
                ((k, entry.value.clone()), frequency, last_accessed)
            })
            .collect()
    }

    #[allow(clippy::type_complexity)]
    fn write_time_snapshot(&self) -> Vec<((Arc<K>, V), Option<Instant>)> {
        self.live_entries()
            .into_iter()
            .map(|(k, entry)| {
                let lm = entry.last_modified();
                ((k, entry.value.clone()), lm)
            })
            .collect()
    }

    #[allow(clippy::type_complexity)]
    fn expiration_snapshot(&self) -> Vec<((Arc<K>, V), Instant)> {
        self.live_entries()
            .into_iter()
            .filter_map(|(k, entry)| {
                entry
                    .entry_info()
                    .expiration_time()
                    .map(|t| ((k, entry.value.clone()), t))
            })
            .collect()
    }
}

//
// Test support
//
#[cfg(test)]
impl<K, V, S> BaseCache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn reconfigure_for_testing(&self) {
        // Enable the frequency sketch eagerly instead of waiting for the
        // cache to be half full.
        if let Some(max) = self.inner.max_capacity.load() {
            self.inner
                .frequency_sketch
                .write()
                .ensure_capacity(common::sketch_capacity(max));
            self.inner
                .frequency_sketch_enabled
                .store(true, Ordering::Release);
        }
        // Tests drive maintenance explicitly through `run_pending_tasks`.
        self.inner.housekeeper.disable_auto_run();
    }
}

struct UpdateOutcome<K, V> {
    entry: TrioArc<ValueEntry<K, V>>,
    old_weight: u32,
    old_last_accessed: Option<Instant>,
    old_last_modified: Option<Instant>,
}

//
// Internal helpers shared by the public operation paths.
//
impl<K, V, S> Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    #[inline]
    fn is_disabled(&self) -> bool {
        self.max_capacity.load() == Some(0)
    }

    #[inline]
    fn evicts(&self) -> bool {
        self.max_capacity.load().is_some()
    }

    fn store_num_shards(&self) -> usize {
        // The shard count is a fixed power of two chosen at build time.
        if self.is_disabled() {
            1
        } else {
            64
        }
    }

    #[inline]
    fn weigh(&self, key: &K, value: &V) -> u32 {
        self.weigher.as_ref().map_or(1, |w| w(key, value))
    }

    #[inline]
    fn has_access_order_queues(&self) -> bool {
        self.evicts() || self.expiration.time_to_idle().is_some()
    }

    #[inline]
    fn has_write_order_queue(&self) -> bool {
        self.expiration.time_to_live().is_some()
    }

    /// Checks every configured policy against the current timestamps.
    fn is_invalid_or_expired(&self, entry: &TrioArc<ValueEntry<K, V>>, now: Instant) -> bool {
        let info = entry.entry_info();
        if info.state() != EntryState::Alive {
            return true;
        }
        if let Some(t) = info.expiration_time() {
            if t <= now {
                return true;
            }
        }
        if let (Some(ttl), Some(lm)) = (self.expiration.time_to_live(), info.last_modified()) {
            // A far-future write time is the refresh sentinel; saturating
            // arithmetic keeps the entry alive in that window.
            if lm.saturating_add(ttl) <= now {
                return true;
            }
        }
        if let (Some(tti), Some(la)) = (self.expiration.time_to_idle(), info.last_accessed()) {
            if la.saturating_add(tti) <= now {
                return true;
            }
        }
        if let (Some(va), Some(lm)) = (self.valid_after.instant(), info.last_modified()) {
            if lm < va {
                return true;
            }
        }
        false
    }

    /// The removal cause for an entry leaving the cache right now through
    /// an explicit operation.
    fn removal_cause_for(&self, entry: &TrioArc<ValueEntry<K, V>>, now: Instant) -> RemovalCause {
        let info = entry.entry_info();
        let expired = info.expiration_time().map_or(false, |t| t <= now)
            || matches!(
                (self.expiration.time_to_live(), info.last_modified()),
                (Some(ttl), Some(lm)) if lm.saturating_add(ttl) <= now
            )
            || matches!(
                (self.expiration.time_to_idle(), info.last_accessed()),
                (Some(tti), Some(la)) if la.saturating_add(tti) <= now
            );
        if expired {
            RemovalCause::Expired
        } else {
            RemovalCause::Explicit
        }
    }

    fn make_insert(
        &self,
        key: &Arc<K>,
        hash: u64,
        value: V,
        weight: u32,
        now: Instant,
    ) -> TrioArc<ValueEntry<K, V>> {
        let key_hash = KeyHash::new(Arc::clone(key), hash);
        let info = TrioArc::new(EntryInfo::new(key_hash, now, weight));
        if let Some(expiry) = self.expiration.expiry() {
            let duration = expiry.expire_after_create(key, &value, self.clock.to_std_instant(now));
            let expiration_time =
                duration.map(|d| now.saturating_add(d.min(MAX_EXPIRY)));
            info.set_expiration_time(expiration_time);
        }
        TrioArc::new(ValueEntry::new(value, info))
    }

    fn make_update(
        &self,
        key: &Arc<K>,
        _hash: u64,
        value: V,
        weight: u32,
        old_entry: &TrioArc<ValueEntry<K, V>>,
        now: Instant,
    ) -> UpdateOutcome<K, V> {
        let info = old_entry.entry_info();
        let old_weight = info.policy_weight();
        let old_last_accessed = info.last_accessed();
        let old_last_modified = info.last_modified();

        match old_last_modified {
            // A write time in the future is the refresh sentinel; an
            // explicit update supersedes the in-flight refresh.
            Some(lm) if lm > now => info.set_last_modified(now),
            // Updates within the tolerance keep the old write time to
            // avoid write-order churn on hot keys.
            Some(lm) if now.saturating_duration_since(lm) > WRITE_TIME_TOLERANCE => {
                info.set_last_modified(now)
            }
            Some(_) => (),
            None => info.set_last_modified(now),
        }
        info.set_last_accessed(now);
        info.set_policy_weight(weight);
        info.set_dirty(true);

        let entry = TrioArc::new(ValueEntry::new_from(value, old_entry));
        self.apply_expiry_on_update(&entry, now);
        UpdateOutcome {
            entry,
            old_weight,
            old_last_accessed,
            old_last_modified,
        }
    }

    /// The remaining lifetime of the entry under every configured policy.
    fn current_expiry_duration(
        &self,
        entry: &TrioArc<ValueEntry<K, V>>,
        now: Instant,
    ) -> Option<Duration> {
        let info = entry.entry_info();
        let candidates = [
            info.expiration_time(),
            self.expiration
                .time_to_live()
                .and_then(|ttl| info.last_modified().map(|lm| lm.saturating_add(ttl))),
            self.expiration
                .time_to_idle()
                .and_then(|tti| info.last_accessed().map(|la| la.saturating_add(tti))),
        ];
        candidates
            .into_iter()
            .flatten()
            .min()
            .map(|t| t.saturating_duration_since(now))
    }

    /// Runs the user's read hook; returns `true` when the per-entry
    /// expiration changed and the timer wheel needs a reschedule.
    fn apply_expiry_on_read(&self, entry: &TrioArc<ValueEntry<K, V>>, now: Instant) -> bool {
        let Some(expiry) = self.expiration.expiry() else {
            return false;
        };
        let info = entry.entry_info();
        let lm = info.last_modified().unwrap_or(now);
        // The entry may have been inserted after we read the clock.
        let now = now.max(lm);

        let current_duration = self.current_expiry_duration(entry, now);
        let duration = expiry.expire_after_read(
            &info.key_hash().key,
            &entry.value,
            self.clock.to_std_instant(now),
            current_duration,
            self.clock.to_std_instant(lm),
        );

        if duration != current_duration {
            let expiration_time = duration.map(|d| now.saturating_add(d.min(MAX_EXPIRY)));
            info.set_expiration_time(expiration_time);
            true
        } else {
            false
        }
    }

    fn apply_expiry_on_update(&self, entry: &TrioArc<ValueEntry<K, V>>, now: Instant) {
        let Some(expiry) = self.expiration.expiry() else {
            return;
        };
        let info = entry.entry_info();
        let current_duration = self.current_expiry_duration(entry, now);
        let duration = expiry.expire_after_update(
            &info.key_hash().key,
            &entry.value,
            self.clock.to_std_instant(now),
            current_duration,
        );
        if duration != current_duration {
            let expiration_time = duration.map(|d| now.saturating_add(d.min(MAX_EXPIRY)));
            info.set_expiration_time(expiration_time);
        }
    }

    fn notify_removal(&self, key: Arc<K>, value: V, cause: RemovalCause) {
        if let Some(notifier) = &self.removal_notifier {
            notifier.notify(key, value, cause);
        }
    }

    /// Notifies the listener about a displaced value after an update,
    /// deciding between `Replaced` and `Expired` from the old timestamps.
    fn notify_upsert(
        &self,
        key: Arc<K>,
        old_entry: &TrioArc<ValueEntry<K, V>>,
        old_last_accessed: Option<Instant>,
        old_last_modified: Option<Instant>,
        now: Instant,
    ) {
        if self.removal_notifier.is_none() {
            return;
        }

        let mut cause = RemovalCause::Replaced;
        if let (Some(tti), Some(la)) = (self.expiration.time_to_idle(), old_last_accessed) {
            if la.saturating_add(tti) <= now {
                cause = RemovalCause::Expired;
            }
        }
        if let (Some(ttl), Some(lm)) = (self.expiration.time_to_live(), old_last_modified) {
            if lm.saturating_add(ttl) <= now {
                cause = RemovalCause::Expired;
            }
        }
        if let (Some(va), Some(lm)) = (self.valid_after.instant(), old_last_modified) {
            if lm < va {
                cause = RemovalCause::Explicit;
            }
        }
        self.notify_removal(key, old_entry.value.clone(), cause);
    }

    fn record_hits(&self, count: u32) {
        if let Some(counter) = &self.stats_counter {
            counter.record_hits(count);
        }
    }

    fn record_misses(&self, count: u32) {
        if let Some(counter) = &self.stats_counter {
            counter.record_misses(count);
        }
    }

    fn record_load_success(&self, nanos: u64) {
        if let Some(counter) = &self.stats_counter {
            counter.record_load_success(nanos);
        }
    }

    fn record_load_failure(&self, nanos: u64) {
        if let Some(counter) = &self.stats_counter {
            counter.record_load_failure(nanos);
        }
    }

    fn record_eviction(&self, weight: u32, cause: RemovalCause) {
        if let Some(counter) = &self.stats_counter {
            counter.record_eviction(weight, cause);
        }
    }

    /// The refresh completion protocol: replace the value only when the
    /// entry is unchanged since the claim, otherwise restore or discard.
    fn run_reload(
        inner: Arc<Self>,
        entry: TrioArc<ValueEntry<K, V>>,
        hash: u64,
        old_lm: Instant,
        sentinel: Instant,
    ) {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        let Some(loader) = inner.loader.as_ref().map(Arc::clone) else {
            return;
        };
        let key = Arc::clone(&entry.entry_info().key_hash().key);

        let load_start = inner.clock.fast_now();
        let result = catch_unwind(AssertUnwindSafe(|| loader.reload(&key, &entry.value)));
        let load_nanos = inner
            .clock
            .fast_now()
            .saturating_duration_since(load_start)
            .as_nanos() as u64;

        match result {
            Ok(Some(new_value)) => {
                inner.record_load_success(load_nanos);
                let op = {
                    let shard = inner.store.shard(hash);
                    let mut map = shard.write();

                    let unchanged = map.get(&key).map_or(false, |current| {
                        TrioArc::ptr_eq(current.entry_info(), entry.entry_info())
                            && entry.entry_info().last_modified() == Some(sentinel)
                    });
                    if !unchanged {
                        // The entry was written or removed while we were
                        // loading; discard the reload.
                        None
                    } else {
                        let now = inner.clock.now();
                        let info = entry.entry_info();
                        let old_weight = info.policy_weight();
                        let weight = inner.weigh(&key, &new_value);

                        info.set_last_modified(now);
                        info.set_last_accessed(now);
                        info.set_policy_weight(weight);
                        info.set_dirty(true);

                        let new_entry = TrioArc::new(ValueEntry::new_from(new_value, &entry));
                        inner.apply_expiry_on_update(&new_entry, now);
                        map.insert(Arc::clone(&key), TrioArc::clone(&new_entry));

                        Some(WriteOp::Upsert {
                            key_hash: KeyHash::new(Arc::clone(&key), hash),
                            value_entry: new_entry,
                            old_weight,
                            new_weight: weight,
                        })
                    }
                };
                if let Some(op) = op {
                    Self::append_write_op(&inner, op);
                }
            }
            Ok(None) => {
                // Nothing newer; put the original write time back so the
                // entry becomes refreshable again.
                inner.record_load_success(load_nanos);
                entry.entry_info().cas_last_modified(sentinel, old_lm);
            }
            Err(_payload) => {
                inner.record_load_failure(load_nanos);
                entry.entry_info().cas_last_modified(sentinel, old_lm);
                #[cfg(feature = "logging")]
                log::warn!(
                    "{}A refresh reload panicked; keeping the current value",
                    inner
                        .name
                        .as_deref()
                        .map(|n| format!("[{n}] "))
                        .unwrap_or_default()
                );
            }
        }
    }

    fn append_write_op(inner: &Arc<Self>, op: WriteOp<K, V>) {
        let mut op = op;
        let mut retries = 0;
        loop {
            match inner.write_buffer.enqueue(op) {
                Ok(()) => break,
                Err(rejected) => {
                    op = rejected;
                    retries += 1;
                    if retries >= WRITE_RETRY_LIMIT {
                        inner.housekeeper.run_now(&**inner);
                        retries = 0;
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
        inner.housekeeper.try_schedule(&**inner);
    }
}

impl<K, V, S> InnerSync for Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn run_pending_tasks(&self) {
        self.do_run_pending_tasks();
    }

    fn now(&self) -> Instant {
        self.clock.now()
    }
}

//
// The maintenance routine. Everything below runs under the eviction lock.
//
impl<K, V, S> Inner<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn do_run_pending_tasks(&self) {
        if self.is_disabled() {
            return;
        }

        let mut deqs = self.deques.lock();
        let mut timer_wheel = self.timer_wheel.lock();

        let mut counters = EvictionCounters {
            entry_count: self.entry_count.load(),
            weighted_size: self.weighted_size.load(),
            eden_weighted_size: self.eden_weighted_size.load(),
            protected_weighted_size: self.protected_weighted_size.load(),
        };

        for _ in 0..MAX_LOG_SYNC_REPEATS {
            self.apply_reads(&mut deqs, &mut timer_wheel, &mut counters);
            self.apply_writes(&mut deqs, &mut timer_wheel, &mut counters);

            if self.should_enable_frequency_sketch(&counters) {
                self.enable_frequency_sketch(&counters);
            }

            if self.write_buffer.len() < WRITE_LOG_FLUSH_POINT {
                break;
            }
        }

        if timer_wheel.is_enabled() {
            self.expire_with_timer_wheel(&mut deqs, &mut timer_wheel, &mut counters);
        }

        if self.expiration.time_to_live().is_some() || self.valid_after.is_set() {
            self.expire_from_write_order(&mut deqs, &mut timer_wheel, &mut counters);
        }
        if self.expiration.time_to_idle().is_some() || self.valid_after.is_set() {
            for region in [
                CacheRegion::Eden,
                CacheRegion::MainProbation,
                CacheRegion::MainProtected,
            ] {
                self.expire_from_access_order(region, &mut deqs, &mut timer_wheel, &mut counters);
            }
        }

        if self.evicts() {
            self.evict_from_eden(&mut deqs, &mut counters);
            self.evict_from_main(&mut deqs, &mut timer_wheel, &mut counters);
        }

        self.entry_count.store(counters.entry_count);
        self.weighted_size.store(counters.weighted_size);
        self.eden_weighted_size.store(counters.eden_weighted_size);
        self.protected_weighted_size
            .store(counters.protected_weighted_size);
    }

    //
    // Region sizing. These are targets, not hard caps.
    //

    fn eden_max_weight(&self, max: u64) -> u64 {
        max - (max as u128 * 99 / 100) as u64
    }

    fn protected_max_weight(&self, max: u64) -> u64 {
        let main = max - self.eden_max_weight(max);
        (main as u128 * 80 / 100) as u64
    }

    //
    // Draining the event buffers.
    //

    fn apply_reads(
        &self,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) {
        let mut freq = self.frequency_sketch.write();
        let now = self.clock.now();
        self.read_buffer.drain(|op| match op {
            ReadOp::Hit {
                value_entry,
                is_expiry_modified,
            } => {
                freq.increment(value_entry.entry_info().key_hash().hash);
                if is_expiry_modified {
                    self.update_timer_wheel(&value_entry, timer_wheel, now);
                }
                self.on_access(&value_entry, deqs, counters);
            }
            ReadOp::Miss(hash) => freq.increment(hash),
        });
    }

    /// Applies one recorded access to the W-TinyLFU orderings: refresh the
    /// entry's recency, promote a probation entry to protected, and demote
    /// protected overflow back to probation.
    fn on_access(
        &self,
        entry: &TrioArc<ValueEntry<K, V>>,
        deqs: &mut Deques<K>,
        counters: &mut EvictionCounters,
    ) {
        match Deques::ao_region(entry) {
            Some(CacheRegion::Eden) => deqs.move_to_back_ao(entry),
            Some(CacheRegion::MainProbation) => {
                deqs.move_to_region_tail(entry, CacheRegion::MainProtected);
                counters.protected_weighted_size = counters
                    .protected_weighted_size
                    .saturating_add(entry.policy_weight() as u64);
                self.rebalance_protected(deqs, counters);
            }
            Some(CacheRegion::MainProtected) => deqs.move_to_back_ao(entry),
            _ => (),
        }
    }

    /// Demotes the protected head into probation until the protected
    /// region is back under its target.
    fn rebalance_protected(&self, deqs: &mut Deques<K>, counters: &mut EvictionCounters) {
        let Some(max) = self.max_capacity.load() else {
            return;
        };
        let protected_max = self.protected_max_weight(max);
        while counters.protected_weighted_size > protected_max {
            match deqs.transfer_front_ao(CacheRegion::MainProtected, CacheRegion::MainProbation) {
                Some(info) => {
                    counters.protected_weighted_size = counters
                        .protected_weighted_size
                        .saturating_sub(info.policy_weight() as u64);
                }
                None => break,
            }
        }
    }

    fn apply_writes(
        &self,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) {
        if self.write_buffer.is_empty() {
            return;
        }
        let count = self.write_buffer.len();
        for _ in 0..count {
            match self.write_buffer.dequeue() {
                Some(WriteOp::Upsert {
                    key_hash,
                    value_entry,
                    old_weight,
                    new_weight,
                }) => self.handle_upsert(
                    key_hash,
                    value_entry,
                    old_weight,
                    new_weight,
                    deqs,
                    timer_wheel,
                    counters,
                ),
                Some(WriteOp::Remove(KvEntry { key: _key, entry })) => {
                    self.handle_remove(deqs, timer_wheel, entry, counters);
                }
                None => break,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_upsert(
        &self,
        kh: KeyHash<K>,
        entry: TrioArc<ValueEntry<K, V>>,
        old_weight: u32,
        new_weight: u32,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) {
        entry.entry_info().set_dirty(false);

        if entry.is_admitted() {
            // An update of a resident entry: adjust the accounting and
            // refresh its position in the orderings.
            counters.update_weight(old_weight, new_weight, Deques::ao_region(&entry));
            let now = self.clock.now();
            self.update_timer_wheel(&entry, timer_wheel, now);
            deqs.move_to_back_ao(&entry);
            deqs.move_to_back_wo(&entry);
            return;
        }

        if entry.entry_info().state() != EntryState::Alive {
            // Removed before this insert was drained; the matching remove
            // op takes care of the rest.
            return;
        }

        if let Some(max) = self.max_capacity.load() {
            if new_weight as u64 > max {
                // Too heavy to ever fit: evict it right away.
                let key = &kh.key;
                let removed = self.store.remove_if(kh.hash, key, |_k, current| {
                    TrioArc::ptr_eq(current.entry_info(), entry.entry_info())
                        && !current.is_dirty()
                });
                if let Some(removed) = removed {
                    self.seal_removed_entry(&removed, timer_wheel);
                    self.notify_removal(
                        Arc::clone(key),
                        removed.value.clone(),
                        RemovalCause::Size,
                    );
                    self.record_eviction(new_weight, RemovalCause::Size);
                    if let Some(writer) = &self.writer {
                        if let Err(_e) = writer.delete(key, &removed.value, RemovalCause::Size) {
                            #[cfg(feature = "logging")]
                            log::warn!("the cache writer failed to delete an oversized entry");
                        }
                    }
                }
                return;
            }
        }

        // A new entry is always admitted to eden; the size policy below
        // decides whether it graduates to the main area or is evicted.
        let now = self.clock.now();
        self.handle_admit(&entry, new_weight, deqs, timer_wheel, counters, now);
    }

    fn handle_admit(
        &self,
        entry: &TrioArc<ValueEntry<K, V>>,
        weight: u32,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
        now: Instant,
    ) {
        counters.add_entry(weight);
        self.update_timer_wheel(entry, timer_wheel, now);

        if self.has_access_order_queues() {
            deqs.push_back_ao(CacheRegion::Eden, entry.key_hash_date(), entry);
        }
        if self.has_write_order_queue() {
            deqs.push_back_wo(entry.key_hash_date(), entry);
        }
        entry.set_admitted(true);
    }

    /// Puts the timer wheel in sync with the entry's per-entry expiration:
    /// schedule, reschedule or deschedule as needed.
    fn update_timer_wheel(
        &self,
        entry: &TrioArc<ValueEntry<K, V>>,
        timer_wheel: &mut TimerWheel<K>,
        now: Instant,
    ) {
        if entry.entry_info().expiration_time().is_some() && !timer_wheel.is_enabled() {
            timer_wheel.enable(now);
        }
        if !timer_wheel.is_enabled() {
            return;
        }

        match (
            entry.entry_info().expiration_time().is_some(),
            entry.timer_node(),
        ) {
            (false, None) => (),
            (true, None) => {
                timer_wheel.schedule(
                    TrioArc::clone(entry.entry_info()),
                    TrioArc::clone(entry.deq_nodes()),
                );
            }
            (true, Some(node)) => {
                use crate::common::timer_wheel::ReschedulingResult;
                if let ReschedulingResult::Removed(node) = timer_wheel.reschedule(node) {
                    // The expiration was unset by another thread after we
                    // checked; the wheel already cleared the pointer.
                    drop(node);
                }
            }
            (false, Some(node)) => {
                timer_wheel.deschedule(node);
            }
        }
    }

    /// Detaches a store-removed entry from every policy structure and
    /// marks it dead.
    fn seal_removed_entry(
        &self,
        entry: &TrioArc<ValueEntry<K, V>>,
        timer_wheel: &mut TimerWheel<K>,
    ) {
        if let Some(node) = entry.take_timer_node() {
            if timer_wheel.is_enabled() {
                timer_wheel.deschedule(node);
            }
        }
        entry.entry_info().set_state(EntryState::Dead);
    }

    fn handle_remove(
        &self,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        entry: TrioArc<ValueEntry<K, V>>,
        counters: &mut EvictionCounters,
    ) {
        if let Some(node) = entry.take_timer_node() {
            if timer_wheel.is_enabled() {
                timer_wheel.deschedule(node);
            }
        }
        if entry.is_admitted() {
            entry.set_admitted(false);
            let region = Deques::ao_region(&entry);
            counters.remove_entry(entry.policy_weight(), region);
            deqs.unlink_ao(&entry);
            deqs.unlink_wo(&entry);
        } else {
            entry.unset_q_nodes();
        }
        entry.entry_info().set_state(EntryState::Dead);
    }

    //
    // Expiration.
    //

    fn expire_with_timer_wheel(
        &self,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) {
        let now = self.clock.now();

        // Collect first: the iterator holds the wheel mutably, and handling
        // an expired entry may need to reschedule into the wheel.
        let mut expired = Vec::new();
        for event in timer_wheel.advance(now) {
            if let TimerEvent::Expired(node) = event {
                let element = &node.element;
                expired.push((
                    TrioArc::clone(element.entry_info()),
                    TrioArc::clone(element.deq_nodes()),
                ));
            }
            // Rescheduled and descheduled events need no action here.
        }

        for (info, deq_nodes) in expired {
            let kh = info.key_hash();
            let (key, hash) = (&kh.key, kh.hash);

            if info.is_dirty() {
                // Updated concurrently; its write op recreates the timer.
                continue;
            }

            let removed = self.store.remove_if(hash, key, |_k, current| {
                TrioArc::ptr_eq(current.entry_info(), &info)
                    && current
                        .entry_info()
                        .expiration_time()
                        .map_or(false, |t| t <= now)
            });

            if let Some(entry) = removed {
                self.evicted_entry_cleanup(
                    Arc::clone(key),
                    &entry,
                    RemovalCause::Expired,
                    deqs,
                    timer_wheel,
                    counters,
                );
            } else if let Some(current) = self.store.get(hash, key) {
                // Resurrected: the deadline moved while the timer fired.
                // Put the timer back for the new deadline.
                if TrioArc::ptr_eq(current.entry_info(), &info)
                    && info.expiration_time().is_some()
                    && current.timer_node().is_none()
                {
                    timer_wheel.schedule(info, deq_nodes);
                }
            }
        }
    }

    fn expire_from_write_order(
        &self,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) {
        let now = self.clock.now();
        let ttl = self.expiration.time_to_live();
        let va = self.valid_after.instant();

        // Bound by the queue length so rotating over dirty entries cannot
        // revisit them within one run.
        let batch = EVICTION_BATCH_SIZE.min(deqs.write_order.len());
        for _ in 0..batch {
            let front = match deqs.write_order.peek_front() {
                Some(node) => {
                    let elem = &node.element;
                    (
                        TrioArc::clone(elem.entry_info()),
                        elem.is_dirty(),
                        elem.last_modified(),
                    )
                }
                None => break,
            };
            let (info, is_dirty, lm) = front;

            if is_dirty {
                deqs.write_order.move_front_to_back();
                continue;
            }

            let cause = match (ttl, va, lm) {
                (Some(ttl), _, Some(lm)) if lm.saturating_add(ttl) <= now => RemovalCause::Expired,
                (_, Some(va), Some(lm)) if lm < va => RemovalCause::Explicit,
                (_, _, Some(_)) => break, // the head is still fresh
                (_, _, None) => {
                    deqs.write_order.move_front_to_back();
                    continue;
                }
            };

            if !self.remove_expired(&info, cause, now, deqs, timer_wheel, counters) {
                deqs.write_order.move_front_to_back();
            }
        }
    }

    fn expire_from_access_order(
        &self,
        region: CacheRegion,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) {
        let now = self.clock.now();
        let tti = self.expiration.time_to_idle();
        let va = self.valid_after.instant();

        let batch = EVICTION_BATCH_SIZE.min(deqs.select_ao_mut(region).len());
        for _ in 0..batch {
            let front = match deqs.select_ao_mut(region).peek_front() {
                Some(node) => {
                    let elem = &node.element;
                    (
                        TrioArc::clone(elem.entry_info()),
                        elem.is_dirty(),
                        elem.last_accessed(),
                        elem.last_modified(),
                    )
                }
                None => break,
            };
            let (info, is_dirty, la, lm) = front;

            if is_dirty {
                deqs.select_ao_mut(region).move_front_to_back();
                continue;
            }

            let cause = match (tti, la) {
                (Some(tti), Some(la)) if la.saturating_add(tti) <= now => RemovalCause::Expired,
                _ => match (va, lm) {
                    (Some(va_ts), Some(lm)) if lm < va_ts => RemovalCause::Explicit,
                    // The queue head is the least recently used entry; a
                    // fresh head means the rest is fresh too. Invalidated
                    // entries deeper in the queue are dropped lazily.
                    _ => break,
                },
            };

            if !self.remove_expired(&info, cause, now, deqs, timer_wheel, counters) {
                deqs.select_ao_mut(region).move_front_to_back();
            }
        }
    }

    /// Removes an entry that a queue walk found expired, re-validating
    /// against the store's current view. Returns `false` when the entry
    /// was resurrected (updated or already gone).
    fn remove_expired(
        &self,
        info: &TrioArc<EntryInfo<K>>,
        cause: RemovalCause,
        now: Instant,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) -> bool {
        let kh = info.key_hash();
        let (key, hash) = (&kh.key, kh.hash);

        let removed = self.store.remove_if(hash, key, |_k, current| {
            TrioArc::ptr_eq(current.entry_info(), info)
                && !current.is_dirty()
                && match cause {
                    RemovalCause::Expired => self.is_expired_by_time(current, now),
                    RemovalCause::Explicit => self
                        .valid_after
                        .instant()
                        .zip(current.last_modified())
                        .map_or(false, |(va, lm)| lm < va),
                    _ => false,
                }
        });

        match removed {
            Some(entry) => {
                self.evicted_entry_cleanup(
                    Arc::clone(key),
                    &entry,
                    cause,
                    deqs,
                    timer_wheel,
                    counters,
                );
                true
            }
            None => false,
        }
    }

    fn is_expired_by_time(&self, entry: &TrioArc<ValueEntry<K, V>>, now: Instant) -> bool {
        let info = entry.entry_info();
        if let Some(t) = info.expiration_time() {
            if t <= now {
                return true;
            }
        }
        if let (Some(ttl), Some(lm)) = (self.expiration.time_to_live(), info.last_modified()) {
            if lm.saturating_add(ttl) <= now {
                return true;
            }
        }
        if let (Some(tti), Some(la)) = (self.expiration.time_to_idle(), info.last_accessed()) {
            if la.saturating_add(tti) <= now {
                return true;
            }
        }
        false
    }

    /// The common tail of every policy-driven removal: writer delete,
    /// unlinking, accounting, listener and stats.
    fn evicted_entry_cleanup(
        &self,
        key: Arc<K>,
        entry: &TrioArc<ValueEntry<K, V>>,
        cause: RemovalCause,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) {
        if let Some(writer) = &self.writer {
            if let Err(_e) = writer.delete(&key, &entry.value, cause) {
                #[cfg(feature = "logging")]
                log::warn!("the cache writer failed to delete an evicted entry");
            }
        }

        let weight = entry.policy_weight();
        self.handle_remove(deqs, timer_wheel, TrioArc::clone(entry), counters);
        self.notify_removal(key, entry.value.clone(), cause);
        self.record_eviction(weight, cause);
    }

    //
    // Size enforcement: the W-TinyLFU admission and eviction policy.
    //

    /// Demotes eden overflow into the probation queue. The demoted entries
    /// become the admission candidates for `evict_from_main`.
    fn evict_from_eden(&self, deqs: &mut Deques<K>, counters: &mut EvictionCounters) {
        let Some(max) = self.max_capacity.load() else {
            return;
        };
        let eden_max = self.eden_max_weight(max);
        while counters.eden_weighted_size > eden_max {
            match deqs.transfer_front_ao(CacheRegion::Eden, CacheRegion::MainProbation) {
                Some(info) => {
                    counters.eden_weighted_size = counters
                        .eden_weighted_size
                        .saturating_sub(info.policy_weight() as u64);
                }
                None => break,
            }
        }
    }

    /// While over capacity, plays the frequency duel between the probation
    /// head (the victim) and the probation tail (the candidate) and evicts
    /// the loser.
    fn evict_from_main(
        &self,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) {
        let Some(max) = self.max_capacity.load() else {
            return;
        };

        let now = self.clock.now();
        let mut prng = Xorshift64::new(self.admission_seed.load());
        let freq = self.frequency_sketch.read();

        // Runs until the cache is back under its bound. Consecutive failed
        // attempts mean the remaining nodes are stale or contended; give
        // up and let the next run retry after the buffers drain.
        let mut consecutive_failures = 0;
        loop {
            if counters.weighted_size <= max || consecutive_failures > 16 {
                break;
            }

            let victim = Self::find_evictable(&mut deqs.probation, true);
            let candidate = Self::find_evictable(&mut deqs.probation, false);

            let chosen = match (victim, candidate) {
                (None, None) => {
                    // Probation is empty; fall through to the protected
                    // head, then the eden head.
                    if let Some(info) = Self::find_evictable(&mut deqs.protected, true) {
                        info
                    } else if let Some(info) = Self::find_evictable(&mut deqs.eden, true) {
                        info
                    } else {
                        break;
                    }
                }
                (Some(victim), None) => victim,
                (None, Some(candidate)) => candidate,
                (Some(victim), Some(candidate)) => {
                    if TrioArc::ptr_eq(&victim, &candidate) {
                        victim
                    } else if candidate.policy_weight() as u64 > max {
                        // Can never fit, regardless of the duel.
                        candidate
                    } else {
                        let victim_freq = freq.frequency(victim.key_hash().hash);
                        let candidate_freq = freq.frequency(candidate.key_hash().hash);
                        let admit = if candidate_freq > victim_freq {
                            true
                        } else if candidate_freq <= ADMIT_HILL_CLIMB_THRESHOLD {
                            false
                        } else {
                            // A small random chance breaks ties so an
                            // attacker cannot pin the main area with
                            // crafted frequencies.
                            (prng.next() & 127) == 0
                        };
                        if admit {
                            victim
                        } else {
                            candidate
                        }
                    }
                }
            };

            if self.evict_for_size(&chosen, now, deqs, timer_wheel, counters) {
                consecutive_failures = 0;
            } else {
                // The entry escaped (updated or removed concurrently);
                // nudge its node so we do not pick it again immediately.
                self.nudge_node(&chosen, deqs);
                consecutive_failures += 1;
            }
        }

        self.admission_seed.store(prng.state);
    }

    /// The first entry from the head (or the tail) of the queue that is
    /// clean and has a nonzero weight.
    fn find_evictable(
        deque: &mut crate::common::deque::Deque<crate::common::entry::KeyHashDate<K>>,
        from_front: bool,
    ) -> Option<TrioArc<EntryInfo<K>>> {
        use crate::common::deque::DeqNode;

        let mut next = if from_front {
            deque.peek_front_ptr()
        } else {
            deque.peek_back_ptr()
        };

        while let Some(node) = next {
            let elem = &unsafe { node.as_ref() }.element;
            if !elem.is_dirty() && elem.entry_info().policy_weight() > 0 {
                return Some(TrioArc::clone(elem.entry_info()));
            }
            next = if from_front {
                DeqNode::next_node_ptr(node)
            } else {
                DeqNode::prev_node_ptr(node)
            };
        }
        None
    }

    /// Evicts the entry for the size policy, unless a concurrent update
    /// resurrected it. Zero-weight entries are never evicted for size.
    fn evict_for_size(
        &self,
        info: &TrioArc<EntryInfo<K>>,
        _now: Instant,
        deqs: &mut Deques<K>,
        timer_wheel: &mut TimerWheel<K>,
        counters: &mut EvictionCounters,
    ) -> bool {
        if info.policy_weight() == 0 {
            return false;
        }

        let kh = info.key_hash();
        let (key, hash) = (&kh.key, kh.hash);
        let removed = self.store.remove_if(hash, key, |_k, current| {
            TrioArc::ptr_eq(current.entry_info(), info) && !current.is_dirty()
        });

        match removed {
            Some(entry) => {
                self.evicted_entry_cleanup(
                    Arc::clone(key),
                    &entry,
                    RemovalCause::Size,
                    deqs,
                    timer_wheel,
                    counters,
                );
                true
            }
            None => false,
        }
    }

    /// Moves a skipped node to the back of its deque so repeated eviction
    /// attempts make progress.
    fn nudge_node(&self, info: &TrioArc<EntryInfo<K>>, deqs: &mut Deques<K>) {
        for region in [
            CacheRegion::MainProbation,
            CacheRegion::MainProtected,
            CacheRegion::Eden,
        ] {
            let deq = deqs.select_ao_mut(region);
            if let Some(front) = deq.peek_front() {
                if TrioArc::ptr_eq(front.element.entry_info(), info) {
                    deq.move_front_to_back();
                    return;
                }
            }
        }
    }

    //
    // The frequency sketch is enabled once the cache is half full, sized
    // for the configured capacity.
    //

    fn should_enable_frequency_sketch(&self, counters: &EvictionCounters) -> bool {
        match self.max_capacity.load() {
            None | Some(0) => false,
            Some(max) => {
                !self.frequency_sketch_enabled.load(Ordering::Acquire)
                    && counters.weighted_size >= max / 2
            }
        }
    }

    fn enable_frequency_sketch(&self, counters: &EvictionCounters) {
        if let Some(max) = self.max_capacity.load() {
            let cap = if self.weigher.is_none() {
                max
            } else {
                (counters.entry_count as f64 * (counters.weighted_size as f64 / max as f64)) as u64
            };
            let mut sketch = self.frequency_sketch.write();
            sketch.ensure_capacity(common::sketch_capacity(cap));
            debug_assert!(sketch.is_initialized());
            self.frequency_sketch_enabled
                .store(true, Ordering::Release);
        }
    }
}
