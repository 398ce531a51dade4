use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    sync::Arc,
    time::Duration,
};

use crate::{
    base_cache::{BaseCache, StatsCounterArc},
    cache::Cache,
    common::{executor::Executor, time::clock::Ticker, time::Clock},
    error::BuildError,
    loader::CacheLoader,
    notification::{EvictionListener, RemovalCause},
    policy::{ExpirationPolicy, Expiry},
    stats::{CacheStats, DefaultStatsCounter, StatsCounter},
    writer::CacheWriter,
};

const THOUSAND_YEARS: Duration = Duration::from_secs(1000 * 365 * 24 * 3600);

/// Builds a [`Cache`] with the requested configuration.
///
/// # Examples
///
/// ```rust
/// use lungo::Cache;
/// use std::time::Duration;
///
/// let cache = Cache::builder()
///     // Max 10,000 entries
///     .max_capacity(10_000)
///     // Time to live (TTL): 30 minutes
///     .time_to_live(Duration::from_secs(30 * 60))
///     // Time to idle (TTI): 5 minutes
///     .time_to_idle(Duration::from_secs(5 * 60))
///     // Create the cache.
///     .build();
///
/// // This entry will expire after 5 minutes (TTI) if there is no get().
/// cache.insert(0, "zero").unwrap();
///
/// // This get() will extend the entry life for another 5 minutes.
/// cache.get(&0);
/// ```
///
/// `build` panics on a contradictory configuration; `try_build` returns a
/// [`BuildError`] instead.
pub struct CacheBuilder<K, V> {
    name: Option<String>,
    max_capacity: Option<u64>,
    is_weight_bounded: bool,
    initial_capacity: Option<usize>,
    weigher: Option<crate::common::entry::Weigher<K, V>>,
    writer: Option<Arc<dyn CacheWriter<K, V>>>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    eviction_listener: Option<EvictionListener<K, V>>,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    expiry: Option<Arc<dyn Expiry<K, V> + Send + Sync + 'static>>,
    refresh_after_write: Option<Duration>,
    stats_counter: Option<StatsCounterArc>,
    ticker: Option<Ticker>,
    executor: Executor,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        Self {
            name: None,
            max_capacity: None,
            is_weight_bounded: false,
            initial_capacity: None,
            weigher: None,
            writer: None,
            loader: None,
            eviction_listener: None,
            time_to_live: None,
            time_to_idle: None,
            expiry: None,
            refresh_after_write: None,
            stats_counter: None,
            ticker: None,
            executor: Executor::default(),
        }
    }
}

impl<K, V> CacheBuilder<K, V> {
    /// Constructs a builder for an unbounded cache. Call
    /// [`max_capacity`](Self::max_capacity) or
    /// [`max_weight`](Self::max_weight) to bound it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a name for the cache, used in log output.
    pub fn name(self, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }

    /// Bounds the cache to `max_capacity` entries, each with weight one.
    ///
    /// Cannot be combined with a [`weigher`](Self::weigher); use
    /// [`max_weight`](Self::max_weight) for weight-based bounding.
    pub fn max_capacity(self, max_capacity: u64) -> Self {
        Self {
            max_capacity: Some(max_capacity),
            is_weight_bounded: false,
            ..self
        }
    }

    /// Bounds the cache by the total weight of its entries. Requires a
    /// [`weigher`](Self::weigher).
    pub fn max_weight(self, max_weight: u64) -> Self {
        Self {
            max_capacity: Some(max_weight),
            is_weight_bounded: true,
            ..self
        }
    }

    /// A sizing hint for the internal storage.
    pub fn initial_capacity(self, capacity: usize) -> Self {
        Self {
            initial_capacity: Some(capacity),
            ..self
        }
    }

    /// Sets the function producing each entry's weight. The weight is
    /// computed on insert and update, never on read.
    pub fn weigher(self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        Self {
            weigher: Some(Arc::new(weigher)),
            ..self
        }
    }

    /// Sets the write-through [`CacheWriter`], invoked synchronously inside
    /// mutating operations.
    pub fn cache_writer(self, writer: impl CacheWriter<K, V> + 'static) -> Self {
        Self {
            writer: Some(Arc::new(writer)),
            ..self
        }
    }

    /// Sets the [`CacheLoader`] backing `get_all` and refreshes.
    pub fn loader(self, loader: impl CacheLoader<K, V> + 'static) -> Self {
        Self {
            loader: Some(Arc::new(loader)),
            ..self
        }
    }

    /// Sets a listener invoked with every removed entry and the cause of
    /// its removal.
    ///
    /// Delivery depends on the [`executor`](Self::executor): with
    /// [`Executor::SameThread`] the listener runs inline inside cache
    /// operations (and must not call back into the cache); otherwise
    /// notifications are queued and delivered in batches on the executor.
    pub fn eviction_listener(
        self,
        listener: impl Fn(Arc<K>, V, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        Self {
            eviction_listener: Some(Arc::new(listener)),
            ..self
        }
    }

    /// Expires entries after `duration` has elapsed since insert or update.
    pub fn time_to_live(self, duration: Duration) -> Self {
        Self {
            time_to_live: Some(duration),
            ..self
        }
    }

    /// Expires entries after `duration` has elapsed since the last read or
    /// write.
    pub fn time_to_idle(self, duration: Duration) -> Self {
        Self {
            time_to_idle: Some(duration),
            ..self
        }
    }

    /// Sets per-entry variable expiration through an [`Expiry`]
    /// implementation.
    pub fn expire_after(self, expiry: impl Expiry<K, V> + Send + Sync + 'static) -> Self {
        Self {
            expiry: Some(Arc::new(expiry)),
            ..self
        }
    }

    /// Reloads an entry through the [`loader`](Self::loader) when a read
    /// finds it written longer than `duration` ago. The stale value keeps
    /// being served until the reload completes.
    pub fn refresh_after_write(self, duration: Duration) -> Self {
        Self {
            refresh_after_write: Some(duration),
            ..self
        }
    }

    /// Enables hit/miss/load/eviction counters, readable through
    /// [`Cache::stats`].
    pub fn record_stats(self) -> Self {
        Self {
            stats_counter: Some(Arc::new(DefaultStatsCounter::striped())),
            ..self
        }
    }

    /// Uses a caller supplied [`StatsCounter`] instead of the default one.
    pub fn stats_counter(
        self,
        counter: Arc<dyn StatsCounter<Stats = CacheStats> + Send + Sync + 'static>,
    ) -> Self {
        Self {
            stats_counter: Some(counter),
            ..self
        }
    }

    /// Overrides the time source with a monotonic nanosecond ticker.
    /// Mainly useful for testing expiration deterministically.
    pub fn ticker(self, ticker: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            ticker: Some(Arc::new(ticker)),
            ..self
        }
    }

    /// Sets where refresh reloads and queued removal notifications run.
    pub fn executor(self, executor: Executor) -> Self {
        Self { executor, ..self }
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Builds a `Cache<K, V>`.
    ///
    /// # Panics
    ///
    /// Panics on a contradictory configuration; see [`BuildError`] for the
    /// conditions. Use [`try_build`](Self::try_build) to handle them as
    /// values.
    pub fn build(self) -> Cache<K, V, RandomState> {
        self.try_build().unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_build(self) -> Result<Cache<K, V, RandomState>, BuildError> {
        self.try_build_with_hasher(RandomState::default())
    }

    /// Builds a `Cache<K, V, S>` using the given `hasher` for the key
    /// index and the frequency sketch.
    ///
    /// # Panics
    ///
    /// Panics on a contradictory configuration, like
    /// [`build`](Self::build).
    pub fn build_with_hasher<S>(self, hasher: S) -> Cache<K, V, S>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        self.try_build_with_hasher(hasher)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_build_with_hasher<S>(self, hasher: S) -> Result<Cache<K, V, S>, BuildError>
    where
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        self.validate()?;

        let clock = self
            .ticker
            .map(Clock::with_ticker)
            .unwrap_or_default();
        let expiration = ExpirationPolicy::new(self.time_to_live, self.time_to_idle, self.expiry);

        let base = BaseCache::new(
            self.name,
            self.max_capacity,
            self.initial_capacity,
            hasher,
            self.weigher,
            self.writer,
            self.loader,
            self.eviction_listener,
            expiration,
            self.refresh_after_write,
            self.stats_counter,
            self.executor,
            clock,
        );
        Ok(Cache::with_base(base))
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.is_weight_bounded && self.weigher.is_none() {
            return Err(BuildError::MissingWeigher);
        }
        if !self.is_weight_bounded && self.max_capacity.is_some() && self.weigher.is_some() {
            return Err(BuildError::WeigherWithMaxCapacity);
        }
        if self.refresh_after_write.is_some() && self.loader.is_none() {
            return Err(BuildError::RefreshWithoutLoader);
        }
        for (name, duration) in [
            ("time_to_live", self.time_to_live),
            ("time_to_idle", self.time_to_idle),
            ("refresh_after_write", self.refresh_after_write),
        ] {
            if let Some(duration) = duration {
                if duration > THOUSAND_YEARS {
                    return Err(BuildError::DurationTooLong { name, duration });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CacheBuilder;
    use crate::{cache::Cache, error::BuildError};

    use std::time::Duration;

    #[test]
    fn build_cache() {
        let cache: Cache<char, &str> = CacheBuilder::new().max_capacity(100).build();
        assert_eq!(cache.policy().max_capacity(), Some(100));
        assert_eq!(cache.policy().time_to_live(), None);
        assert_eq!(cache.policy().time_to_idle(), None);

        cache.insert('a', "Alice").unwrap();
        assert_eq!(cache.get(&'a'), Some("Alice"));

        let cache: Cache<char, &str> = CacheBuilder::new()
            .max_capacity(100)
            .time_to_live(Duration::from_secs(45 * 60))
            .time_to_idle(Duration::from_secs(15 * 60))
            .build();

        assert_eq!(cache.policy().max_capacity(), Some(100));
        assert_eq!(
            cache.policy().time_to_live(),
            Some(Duration::from_secs(45 * 60))
        );
        assert_eq!(
            cache.policy().time_to_idle(),
            Some(Duration::from_secs(15 * 60))
        );

        cache.insert('a', "Alice").unwrap();
        assert_eq!(cache.get(&'a'), Some("Alice"));
    }

    #[test]
    fn build_unbounded_cache() {
        let cache: Cache<char, &str> = CacheBuilder::new().build();
        assert_eq!(cache.policy().max_capacity(), None);

        cache.insert('b', "Bob").unwrap();
        assert_eq!(cache.get(&'b'), Some("Bob"));
    }

    #[test]
    fn weight_bound_requires_weigher() {
        let result: Result<Cache<char, &str>, _> =
            CacheBuilder::new().max_weight(100).try_build();
        assert!(matches!(result, Err(BuildError::MissingWeigher)));
    }

    #[test]
    fn weigher_conflicts_with_entry_count_bound() {
        let result: Result<Cache<char, &str>, _> = CacheBuilder::new()
            .max_capacity(100)
            .weigher(|_k, v: &&str| v.len() as u32)
            .try_build();
        assert!(matches!(result, Err(BuildError::WeigherWithMaxCapacity)));
    }

    #[test]
    fn refresh_requires_loader() {
        let result: Result<Cache<char, &str>, _> = CacheBuilder::new()
            .max_capacity(100)
            .refresh_after_write(Duration::from_secs(60))
            .try_build();
        assert!(matches!(result, Err(BuildError::RefreshWithoutLoader)));
    }

    #[test]
    #[should_panic(expected = "is longer than 1000 years")]
    fn build_cache_too_long_ttl() {
        let thousand_years_secs: u64 = 1000 * 365 * 24 * 3600;
        let builder: CacheBuilder<char, String> = CacheBuilder::new().max_capacity(100);
        let duration = Duration::from_secs(thousand_years_secs);
        builder
            .time_to_live(duration + Duration::from_secs(1))
            .build();
    }

    #[test]
    #[should_panic(expected = "is longer than 1000 years")]
    fn build_cache_too_long_tti() {
        let thousand_years_secs: u64 = 1000 * 365 * 24 * 3600;
        let builder: CacheBuilder<char, String> = CacheBuilder::new().max_capacity(100);
        let duration = Duration::from_secs(thousand_years_secs);
        builder
            .time_to_idle(duration + Duration::from_secs(1))
            .build();
    }
}
