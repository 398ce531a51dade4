use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    collections::HashMap,
    fmt,
    hash::{BuildHasher, Hash},
    sync::Arc,
};

use crate::{
    base_cache::BaseCache,
    builder::CacheBuilder,
    error::WriterError,
    policy::Policy,
    stats::CacheStats,
};

/// A thread-safe, bounded, in-process cache.
///
/// `Cache` bounds its contents by entry count or by total weight, expires
/// entries by write age, access age or a per-entry duration, and admits
/// entries with the Window-TinyLFU policy, which keeps frequently used
/// entries resident even under one-hit-wonder floods.
///
/// Cloning is cheap: every clone shares the same internal storage, so a
/// cache can be handed to any number of threads by cloning it.
///
/// Reads and writes apply their policy effects lazily: an operation records
/// an event into an internal buffer, and a maintenance routine applies the
/// batched events. Policy-driven effects such as eviction therefore become
/// visible after a short delay, or immediately after
/// [`run_pending_tasks`](Self::run_pending_tasks).
///
/// # Example
///
/// ```rust
/// use lungo::Cache;
///
/// let cache = Cache::new(10_000);
///
/// cache.insert(1, "one").unwrap();
/// assert_eq!(cache.get(&1), Some("one"));
///
/// cache.invalidate(&1).unwrap();
/// assert_eq!(cache.get(&1), None);
/// ```
pub struct Cache<K, V, S = RandomState> {
    base: BaseCache<K, V, S>,
}

impl<K, V, S> Clone for Cache<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
        }
    }
}

impl<K, V, S> fmt::Debug for Cache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name())
            .field("entry_count", &self.entry_count())
            .field("weighted_size", &self.weighted_size())
            .finish()
    }
}

impl<K, V> Cache<K, V, RandomState>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Constructs a cache bounded to `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        CacheBuilder::new().max_capacity(max_capacity).build()
    }

    /// Returns a [`CacheBuilder`] for configuring a cache.
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::new()
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn with_base(base: BaseCache<K, V, S>) -> Self {
        Self { base }
    }

    pub fn name(&self) -> Option<&str> {
        self.base.name()
    }

    /// A snapshot of this cache's configured policy.
    pub fn policy(&self) -> Policy {
        self.base.policy()
    }

    /// The estimated number of entries. The estimate lags behind
    /// concurrent activity until the next maintenance run.
    pub fn entry_count(&self) -> u64 {
        self.base.entry_count()
    }

    /// The estimated total weight of the entries. Equal to
    /// [`entry_count`](Self::entry_count) when no weigher is configured.
    pub fn weighted_size(&self) -> u64 {
        self.base.weighted_size()
    }

    /// A snapshot of the accumulated statistics. All zeros unless stats
    /// recording was enabled at build time.
    pub fn stats(&self) -> CacheStats {
        self.base.stats()
    }

    /// Returns `true` when the key maps to a live entry, without recording
    /// an access.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.base.contains_key_with_hash(key, self.base.hash(key))
    }

    /// Returns the value for `key` if it is present and not expired,
    /// recording the access. Never loads.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.base.get_with_hash(key, self.base.hash(key))
    }

    /// Returns the value for `key`, computing and caching it with `init`
    /// when absent.
    ///
    /// Concurrent calls for the same key run `init` at most once; the
    /// other callers receive the computed value. `init` runs under an
    /// internal lock covering a portion of the key space and must not call
    /// back into this cache.
    pub fn get_with(&self, key: K, init: impl FnOnce() -> V) -> V {
        let hash = self.base.hash(&key);
        self.base.get_or_insert_with(Arc::new(key), hash, init)
    }

    /// Looks up a batch of keys. Keys that are absent are loaded through
    /// the configured [`CacheLoader`][crate::CacheLoader]'s bulk method
    /// and inserted; without a loader only the present entries are
    /// returned.
    pub fn get_all(&self, keys: impl IntoIterator<Item = K>) -> HashMap<Arc<K>, V> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();

        for key in keys {
            let hash = self.base.hash(&key);
            match self.base.get_with_hash(&key, hash) {
                Some(v) => {
                    found.insert(Arc::new(key), v);
                }
                None => missing.push(key),
            }
        }

        if missing.is_empty() {
            return found;
        }
        let Some(loader) = self.base.inner_loader() else {
            return found;
        };

        for (key, value) in loader.load_all(missing) {
            let hash = self.base.hash(&key);
            let key = Arc::new(key);
            let value = self
                .base
                .get_or_insert_with(Arc::clone(&key), hash, || value);
            found.insert(key, value);
        }
        found
    }

    /// Inserts `value` for `key`, replacing any previous value.
    ///
    /// The error is a failure reported by the configured
    /// [`CacheWriter`][crate::CacheWriter]; without one, this never fails.
    pub fn insert(&self, key: K, value: V) -> Result<(), WriterError> {
        let hash = self.base.hash(&key);
        self.base.insert_with_hash(Arc::new(key), hash, value)
    }

    /// Inserts every pair, stopping at the first writer failure.
    pub fn insert_all(
        &self,
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), WriterError> {
        for (key, value) in entries {
            self.insert(key, value)?;
        }
        Ok(())
    }

    /// Removes the entry and returns its value, unless the entry was
    /// already expired.
    pub fn remove<Q>(&self, key: &Q) -> Result<Option<V>, WriterError>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.base.remove_with_hash(key, self.base.hash(key))
    }

    /// Discards the entry for `key`, notifying the writer and the removal
    /// listener.
    pub fn invalidate<Q>(&self, key: &Q) -> Result<(), WriterError>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove(key).map(|_| ())
    }

    /// Discards the entries for the given keys, stopping at the first
    /// writer failure.
    pub fn invalidate_many<'a, Q>(
        &self,
        keys: impl IntoIterator<Item = &'a Q>,
    ) -> Result<(), WriterError>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized + 'a,
    {
        for key in keys {
            self.invalidate(key)?;
        }
        Ok(())
    }

    /// Discards every entry written before now.
    ///
    /// Reads observe the invalidation immediately; the storage is
    /// reclaimed lazily by the following maintenance runs. The removal
    /// listener receives an `Explicit` cause for each reclaimed entry; the
    /// cache writer's `delete` is invoked as the entries are reclaimed.
    pub fn invalidate_all(&self) {
        self.base.invalidate_all();
    }

    /// Asynchronously reloads the value for `key` through the configured
    /// [`CacheLoader`][crate::CacheLoader]. Returns `true` when a reload
    /// was started.
    ///
    /// The reload runs on the cache's executor. When it completes, the new
    /// value replaces the old one only if the entry was not written or
    /// removed in the meantime; the replacement emits no removal
    /// notification. A failed reload leaves the entry untouched.
    pub fn refresh<Q>(&self, key: &Q) -> bool
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.base.refresh_with_hash(key, self.base.hash(key))
    }

    /// Performs any pending maintenance now: applies buffered reads and
    /// writes, expires entries and enforces the size bound. After this
    /// returns, the weighted size does not exceed the maximum.
    pub fn run_pending_tasks(&self) {
        self.base.run_pending_tasks();
    }

    //
    // The policy tuning and inspection surface.
    //

    /// Changes the maximum capacity. Takes effect at the next maintenance
    /// run; ignored on an unbounded cache.
    pub fn set_max_capacity(&self, max_capacity: u64) {
        self.base.set_max_capacity(max_capacity);
    }

    /// The policy weight of the entry for `key`.
    pub fn weight_of<Q>(&self, key: &Q) -> Option<u32>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.base.weight_of(key, self.base.hash(key))
    }

    /// Up to `limit` entries ordered by estimated access frequency, most
    /// popular first.
    pub fn hottest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        self.base.hottest(limit)
    }

    /// Up to `limit` entries ordered by estimated access frequency, least
    /// popular first.
    pub fn coldest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        self.base.coldest(limit)
    }

    /// Up to `limit` entries ordered by write time, most recent first.
    pub fn youngest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        self.base.youngest(limit)
    }

    /// Up to `limit` entries ordered by write time, oldest first.
    pub fn oldest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        self.base.oldest(limit)
    }

    /// Up to `limit` entries carrying a per-entry expiration, ordered by
    /// deadline, soonest first.
    pub fn expiring_soonest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        self.base.expiring_soonest(limit)
    }

    /// Up to `limit` entries carrying a per-entry expiration, ordered by
    /// deadline, latest first.
    pub fn expiring_latest(&self, limit: usize) -> Vec<(Arc<K>, V)> {
        self.base.expiring_latest(limit)
    }
}

#[cfg(test)]
impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    pub(crate) fn reconfigure_for_testing(&self) {
        self.base.reconfigure_for_testing();
    }
}

#[cfg(test)]
mod tests {
    use super::Cache;
    use crate::{
        common::executor::Executor, error::CallbackError, loader::CacheLoader,
        notification::RemovalCause, policy::Expiry, writer::CacheWriter,
    };

    use std::{
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::{Duration, Instant as StdInstant},
    };

    /// A caller controlled nanosecond ticker for expiration tests.
    fn manual_ticker() -> (Arc<AtomicU64>, impl Fn() -> u64 + Send + Sync + 'static) {
        let time = Arc::new(AtomicU64::new(0));
        let time2 = Arc::clone(&time);
        (time, move || time2.load(Ordering::SeqCst))
    }

    fn advance(time: &AtomicU64, duration: Duration) {
        time.fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Collects removal notifications synchronously.
    type Notifications<K, V> = Arc<Mutex<Vec<(K, V, RemovalCause)>>>;

    fn notification_collector<K, V>() -> (
        Notifications<K, V>,
        impl Fn(Arc<K>, V, RemovalCause) + Send + Sync + 'static,
    )
    where
        K: Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let log: Notifications<K, V> = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        (log, move |k: Arc<K>, v: V, cause| {
            log2.lock().unwrap().push(((*k).clone(), v, cause));
        })
    }

    #[test]
    fn basic_single_thread() {
        let cache = Cache::new(100);
        cache.reconfigure_for_testing();

        cache.insert("a", "alice").unwrap();
        cache.insert("b", "bob").unwrap();
        assert_eq!(cache.get(&"a"), Some("alice"));
        assert_eq!(cache.get(&"b"), Some("bob"));
        assert!(cache.contains_key(&"a"));
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 2);

        cache.insert("a", "amanda").unwrap();
        assert_eq!(cache.get(&"a"), Some("amanda"));
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 2);

        assert_eq!(cache.remove(&"a").unwrap(), Some("amanda"));
        assert_eq!(cache.get(&"a"), None);
        assert!(!cache.contains_key(&"a"));
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 1);

        cache.invalidate(&"b").unwrap();
        assert_eq!(cache.get(&"b"), None);
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn evicts_down_to_max_capacity() {
        let cache = Cache::new(2);
        cache.reconfigure_for_testing();

        cache.insert("a", 1).unwrap();
        cache.insert("b", 2).unwrap();
        cache.insert("c", 3).unwrap();
        cache.run_pending_tasks();

        assert_eq!(cache.entry_count(), 2);
        let present = ["a", "b", "c"]
            .iter()
            .filter(|k| cache.contains_key(*k))
            .count();
        assert_eq!(present, 2);
    }

    #[test]
    fn records_hits_and_misses() {
        let cache: Cache<&str, &str> = Cache::builder()
            .max_capacity(100)
            .record_stats()
            .build();
        cache.reconfigure_for_testing();

        cache.insert("k", "v").unwrap();
        assert_eq!(cache.get(&"k"), Some("v"));
        assert_eq!(cache.get(&"x"), None);

        let stats = cache.stats();
        assert_eq!(stats.hit_count(), 1);
        assert_eq!(stats.miss_count(), 1);
        assert_eq!(stats.request_count(), 2);
    }

    #[test]
    fn frequent_entry_survives_a_flood() {
        let cache = Cache::new(100);
        cache.reconfigure_for_testing();

        cache.insert("hot", "value").unwrap();
        cache.run_pending_tasks();
        for _ in 0..20 {
            assert_eq!(cache.get(&"hot"), Some("value"));
        }
        cache.run_pending_tasks();

        // A flood of one-hit wonders. None of them builds up enough
        // frequency to displace the hot entry.
        for i in 0..10_000 {
            let key: &'static str = Box::leak(format!("flood-{i}").into_boxed_str());
            cache.insert(key, "x").unwrap();
        }
        cache.run_pending_tasks();

        assert_eq!(cache.get(&"hot"), Some("value"));
        assert!(cache.entry_count() <= 100);
    }

    #[test]
    fn size_aware_eviction() {
        let weigher = |_k: &&str, v: &&str| v.len() as u32;
        let cache = Cache::builder().max_weight(20).weigher(weigher).build();
        cache.reconfigure_for_testing();

        cache.insert("a", "12345").unwrap(); // weight 5
        cache.insert("b", "123456789012345").unwrap(); // weight 15
        cache.run_pending_tasks();
        assert_eq!(cache.weighted_size(), 20);
        assert_eq!(cache.weight_of(&"a"), Some(5));

        // Adding more weight forces an eviction back under the bound.
        cache.insert("c", "1234567890").unwrap(); // weight 10
        cache.run_pending_tasks();
        assert!(cache.weighted_size() <= 20);
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let (notifications, listener) = notification_collector();
        let weigher = |_k: &&str, v: &&str| v.len() as u32;
        let cache = Cache::builder()
            .max_weight(10)
            .weigher(weigher)
            .eviction_listener(listener)
            .executor(Executor::SameThread)
            .build();
        cache.reconfigure_for_testing();

        cache.insert("big", "12345678901234567890").unwrap(); // weight 20
        cache.run_pending_tasks();

        assert_eq!(cache.get(&"big"), None);
        assert_eq!(cache.entry_count(), 0);
        let log = notifications.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].2, RemovalCause::Size);
    }

    #[test]
    fn expires_after_write() {
        let (time, ticker) = manual_ticker();
        let (notifications, listener) = notification_collector();
        let cache = Cache::builder()
            .max_capacity(100)
            .time_to_live(Duration::from_secs(60))
            .eviction_listener(listener)
            .executor(Executor::SameThread)
            .ticker(ticker)
            .build();
        cache.reconfigure_for_testing();

        cache.insert("k", "v").unwrap();
        cache.run_pending_tasks();

        advance(&time, Duration::from_secs(59));
        assert_eq!(cache.get(&"k"), Some("v"));

        advance(&time, Duration::from_secs(2));
        assert_eq!(cache.get(&"k"), None);
        cache.run_pending_tasks();

        assert_eq!(cache.entry_count(), 0);
        let log = notifications.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], ("k", "v", RemovalCause::Expired));
    }

    #[test]
    fn expires_after_access() {
        let (time, ticker) = manual_ticker();
        let cache = Cache::builder()
            .max_capacity(100)
            .time_to_idle(Duration::from_secs(10))
            .ticker(ticker)
            .build();
        cache.reconfigure_for_testing();

        cache.insert("k", "v").unwrap();
        cache.run_pending_tasks();

        advance(&time, Duration::from_secs(5));
        assert_eq!(cache.get(&"k"), Some("v")); // extends the idle window

        advance(&time, Duration::from_secs(9));
        assert_eq!(cache.get(&"k"), Some("v"));

        advance(&time, Duration::from_secs(16));
        assert_eq!(cache.get(&"k"), None);
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn expires_with_per_entry_durations() {
        struct ShortLived;

        impl Expiry<&'static str, &'static str> for ShortLived {
            fn expire_after_create(
                &self,
                _key: &&'static str,
                _value: &&'static str,
                _created_at: StdInstant,
            ) -> Option<Duration> {
                Some(Duration::from_secs(5))
            }
        }

        let (time, ticker) = manual_ticker();
        let (notifications, listener) = notification_collector();
        let cache = Cache::builder()
            .max_capacity(100)
            .expire_after(ShortLived)
            .eviction_listener(listener)
            .executor(Executor::SameThread)
            .ticker(ticker)
            .build();
        cache.reconfigure_for_testing();

        cache.insert("k", "v").unwrap();
        cache.run_pending_tasks(); // schedules the timer

        advance(&time, Duration::from_secs(4));
        assert_eq!(cache.get(&"k"), Some("v"));

        advance(&time, Duration::from_secs(3));
        assert_eq!(cache.get(&"k"), None);
        cache.run_pending_tasks();

        assert_eq!(cache.entry_count(), 0);
        let log = notifications.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].2, RemovalCause::Expired);
    }

    /// A loader whose reload yields a configured value, or echoes the old
    /// value back when none is configured.
    struct EchoLoader {
        reload_value: Mutex<Option<String>>,
        reload_count: AtomicUsize,
    }

    impl EchoLoader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reload_value: Mutex::new(None),
                reload_count: AtomicUsize::new(0),
            })
        }

        fn set_reload_value(&self, value: &str) {
            *self.reload_value.lock().unwrap() = Some(value.to_string());
        }
    }

    impl CacheLoader<String, String> for Arc<EchoLoader> {
        fn load(&self, _key: &String) -> Option<String> {
            None
        }

        fn reload(&self, _key: &String, old_value: &String) -> Option<String> {
            self.reload_count.fetch_add(1, Ordering::SeqCst);
            Some(
                self.reload_value
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or_else(|| old_value.clone()),
            )
        }
    }

    #[test]
    fn refresh_after_write_replaces_silently() {
        let (time, ticker) = manual_ticker();
        let (notifications, listener) = notification_collector::<String, String>();
        let loader = EchoLoader::new();
        let cache: Cache<String, String> = Cache::builder()
            .max_capacity(100)
            .refresh_after_write(Duration::from_secs(10))
            .loader(Arc::clone(&loader))
            .eviction_listener(listener)
            .executor(Executor::SameThread)
            .ticker(ticker)
            .build();
        cache.reconfigure_for_testing();

        let key = "k".to_string();
        cache.insert(key.clone(), "v1".to_string()).unwrap();
        cache.run_pending_tasks();

        // Not stale yet; no reload.
        advance(&time, Duration::from_secs(5));
        assert_eq!(cache.get(&key), Some("v1".to_string()));
        assert_eq!(loader.reload_count.load(Ordering::SeqCst), 0);

        // Stale: the read triggers an identity reload inline.
        advance(&time, Duration::from_secs(6));
        assert_eq!(cache.get(&key), Some("v1".to_string()));
        assert_eq!(loader.reload_count.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&key), Some("v1".to_string()));

        // The refresh produced no removal notification.
        assert!(notifications.lock().unwrap().is_empty());
    }

    #[test]
    fn explicit_refresh_loads_a_new_value() {
        let (time, ticker) = manual_ticker();
        let loader = EchoLoader::new();
        let cache: Cache<String, String> = Cache::builder()
            .max_capacity(100)
            .loader(Arc::clone(&loader))
            .executor(Executor::SameThread)
            .ticker(ticker)
            .build();
        cache.reconfigure_for_testing();

        let key = "k".to_string();
        cache.insert(key.clone(), "v1".to_string()).unwrap();
        cache.run_pending_tasks();

        advance(&time, Duration::from_secs(1));
        loader.set_reload_value("v2");
        assert!(cache.refresh(&key));
        assert_eq!(cache.get(&key), Some("v2".to_string()));

        assert!(!cache.refresh(&"missing".to_string()));
    }

    #[test]
    fn invalidate_is_idempotent() {
        let (notifications, listener) = notification_collector();
        let cache = Cache::builder()
            .max_capacity(100)
            .eviction_listener(listener)
            .executor(Executor::SameThread)
            .build();
        cache.reconfigure_for_testing();

        cache.insert("a", 1).unwrap();
        cache.invalidate(&"a").unwrap();
        cache.invalidate(&"a").unwrap();
        cache.run_pending_tasks();

        let log = notifications.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], ("a", 1, RemovalCause::Explicit));
    }

    #[test]
    fn invalidate_all_discards_everything() {
        let (time, ticker) = manual_ticker();
        let cache = Cache::builder()
            .max_capacity(100)
            .ticker(ticker)
            .build();
        cache.reconfigure_for_testing();

        for i in 0..10 {
            cache.insert(i, i * 10).unwrap();
        }
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 10);

        advance(&time, Duration::from_nanos(1));
        cache.invalidate_all();
        for i in 0..10 {
            assert_eq!(cache.get(&i), None);
        }
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn get_with_computes_at_most_once() {
        let cache: Cache<&str, String> = Cache::new(100);
        cache.reconfigure_for_testing();
        let calls = AtomicUsize::new(0);

        let v1 = cache.get_with("k", || {
            calls.fetch_add(1, Ordering::SeqCst);
            "computed".to_string()
        });
        let v2 = cache.get_with("k", || {
            calls.fetch_add(1, Ordering::SeqCst);
            "recomputed".to_string()
        });

        assert_eq!(v1, "computed");
        assert_eq!(v2, "computed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_with_concurrent_callers_share_one_computation() {
        let cache: Cache<&str, String> = Cache::new(100);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            handles.push(std::thread::spawn(move || {
                cache.get_with("k", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "value".to_string()
                })
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_all_uses_the_bulk_loader() {
        struct TensLoader;

        impl CacheLoader<u32, u32> for TensLoader {
            fn load(&self, key: &u32) -> Option<u32> {
                Some(key * 10)
            }
        }

        let cache: Cache<u32, u32> = Cache::builder()
            .max_capacity(100)
            .loader(TensLoader)
            .build();
        cache.reconfigure_for_testing();

        cache.insert(1, 11).unwrap();
        let all = cache.get_all([1, 2, 3]);

        assert_eq!(all.len(), 3);
        assert_eq!(all.get(&Arc::new(1)), Some(&11)); // cached value wins
        assert_eq!(all.get(&Arc::new(2)), Some(&20));
        assert_eq!(all.get(&Arc::new(3)), Some(&30));
        assert_eq!(cache.get(&2), Some(20));
    }

    #[test]
    fn get_all_without_loader_returns_present_entries() {
        let cache: Cache<u32, u32> = Cache::new(100);
        cache.reconfigure_for_testing();

        cache.insert(1, 10).unwrap();
        let all = cache.get_all([1, 2]);
        assert_eq!(all.len(), 1);
        assert_eq!(all.get(&Arc::new(1)), Some(&10));
    }

    /// Records writer calls; `write` fails for a designated poison key.
    struct TestWriter {
        writes: Mutex<Vec<&'static str>>,
        deletes: Mutex<Vec<(&'static str, RemovalCause)>>,
        poison_key: Option<&'static str>,
    }

    impl CacheWriter<&'static str, u32> for Arc<TestWriter> {
        fn write(&self, key: &&'static str, _value: &u32) -> Result<(), CallbackError> {
            if self.poison_key == Some(*key) {
                return Err("downstream store unavailable".into());
            }
            self.writes.lock().unwrap().push(key);
            Ok(())
        }

        fn delete(
            &self,
            key: &&'static str,
            _value: &u32,
            cause: RemovalCause,
        ) -> Result<(), CallbackError> {
            self.deletes.lock().unwrap().push((key, cause));
            Ok(())
        }
    }

    #[test]
    fn writer_sees_writes_and_deletes() {
        let writer = Arc::new(TestWriter {
            writes: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            poison_key: None,
        });
        let cache: Cache<&'static str, u32> = Cache::builder()
            .max_capacity(100)
            .cache_writer(Arc::clone(&writer))
            .build();
        cache.reconfigure_for_testing();

        cache.insert("a", 1).unwrap();
        cache.insert("a", 2).unwrap();
        cache.invalidate(&"a").unwrap();
        cache.run_pending_tasks();

        assert_eq!(*writer.writes.lock().unwrap(), vec!["a", "a"]);
        assert_eq!(
            *writer.deletes.lock().unwrap(),
            vec![("a", RemovalCause::Explicit)]
        );
    }

    #[test]
    fn writer_failure_surfaces_to_the_caller() {
        let writer = Arc::new(TestWriter {
            writes: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            poison_key: Some("bad"),
        });
        let cache: Cache<&'static str, u32> = Cache::builder()
            .max_capacity(100)
            .cache_writer(Arc::clone(&writer))
            .build();
        cache.reconfigure_for_testing();

        let err = cache.insert("bad", 1).unwrap_err();
        assert_eq!(err.operation, "write");
        assert_eq!(cache.get(&"bad"), None);

        cache.insert("good", 1).unwrap();
        assert_eq!(cache.get(&"good"), Some(1));
    }

    #[test]
    fn zero_capacity_cache_stores_nothing() {
        let cache = Cache::new(0);
        cache.insert("a", 1).unwrap();
        assert_eq!(cache.get(&"a"), None);
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = Cache::new(100);
        cache.reconfigure_for_testing();
        for i in 0..50u32 {
            cache.insert(i, i.to_string()).unwrap();
            assert_eq!(cache.get(&i), Some(i.to_string()));
        }
    }

    #[test]
    fn frequency_ordered_snapshots() {
        let cache = Cache::new(100);
        cache.reconfigure_for_testing();

        cache.insert("rare", 1).unwrap();
        cache.insert("popular", 2).unwrap();
        cache.run_pending_tasks();

        for _ in 0..10 {
            cache.get(&"popular");
        }
        cache.run_pending_tasks();

        let hottest = cache.hottest(1);
        assert_eq!(*hottest[0].0, "popular");
        let coldest = cache.coldest(1);
        assert_eq!(*coldest[0].0, "rare");
    }

    #[test]
    fn write_time_ordered_snapshots() {
        let (time, ticker) = manual_ticker();
        let cache = Cache::builder()
            .max_capacity(100)
            .ticker(ticker)
            .build();
        cache.reconfigure_for_testing();

        cache.insert("first", 1).unwrap();
        advance(&time, Duration::from_secs(2));
        cache.insert("second", 2).unwrap();
        advance(&time, Duration::from_secs(2));
        cache.insert("third", 3).unwrap();
        cache.run_pending_tasks();

        assert_eq!(*cache.oldest(1)[0].0, "first");
        assert_eq!(*cache.youngest(1)[0].0, "third");
        assert_eq!(cache.oldest(10).len(), 3);
    }

    #[test]
    fn expiration_ordered_snapshots() {
        struct PerKey;

        impl Expiry<&'static str, u64> for PerKey {
            fn expire_after_create(
                &self,
                _key: &&'static str,
                value: &u64,
                _created_at: StdInstant,
            ) -> Option<Duration> {
                Some(Duration::from_secs(*value))
            }
        }

        let cache = Cache::builder()
            .max_capacity(100)
            .expire_after(PerKey)
            .build();
        cache.reconfigure_for_testing();

        cache.insert("later", 1_000).unwrap();
        cache.insert("soon", 10).unwrap();
        cache.run_pending_tasks();

        assert_eq!(*cache.expiring_soonest(1)[0].0, "soon");
        assert_eq!(*cache.expiring_latest(1)[0].0, "later");
    }

    #[test]
    fn set_max_capacity_takes_effect() {
        let cache = Cache::new(100);
        cache.reconfigure_for_testing();

        for i in 0..50 {
            cache.insert(i, i).unwrap();
        }
        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 50);

        cache.set_max_capacity(10);
        cache.run_pending_tasks();
        assert!(cache.entry_count() <= 10);
    }

    #[test]
    fn shared_across_threads() {
        let cache = Cache::new(10_000);
        let mut handles = Vec::new();
        for t in 0..8u32 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let key = t * 1_000 + i;
                    cache.insert(key, key * 2).unwrap();
                    assert_eq!(cache.get(&key), Some(key * 2));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        cache.run_pending_tasks();
        assert_eq!(cache.entry_count(), 4_000);
    }
}
