use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// A snapshot of a cache's configured policy.
#[derive(Clone, Debug)]
pub struct Policy {
    max_capacity: Option<u64>,
    num_shards: usize,
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    refresh_after_write: Option<Duration>,
}

impl Policy {
    pub(crate) fn new(
        max_capacity: Option<u64>,
        num_shards: usize,
        time_to_live: Option<Duration>,
        time_to_idle: Option<Duration>,
        refresh_after_write: Option<Duration>,
    ) -> Self {
        Self {
            max_capacity,
            num_shards,
            time_to_live,
            time_to_idle,
            refresh_after_write,
        }
    }

    /// Returns the maximum capacity, in entries or in total weight
    /// depending on how the cache was built. `None` means unbounded.
    pub fn max_capacity(&self) -> Option<u64> {
        self.max_capacity
    }

    /// Returns the number of internal shards of the node store.
    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    pub fn time_to_idle(&self) -> Option<Duration> {
        self.time_to_idle
    }

    pub fn refresh_after_write(&self) -> Option<Duration> {
        self.refresh_after_write
    }
}

/// Calculates when cache entries expire. A single expiration time is
/// retained on each entry, so the lifetime of an entry may be extended or
/// reduced by subsequent evaluations.
///
/// Each method returns the duration until the entry should expire,
/// `None` meaning "no expiration". The defaults leave the current
/// expiration unchanged (`expire_after_create` defaults to no expiration).
pub trait Expiry<K, V> {
    /// Called after the entry's insertion. Returning `Some(duration)` sets
    /// the expiration time to `created_at + duration`; `None` leaves the
    /// entry without a per-entry expiration.
    #[allow(unused_variables)]
    fn expire_after_create(&self, key: &K, value: &V, created_at: Instant) -> Option<Duration> {
        None
    }

    /// Called after the entry was read. `duration_until_expiry` is the
    /// remaining lifetime under the currently effective policies; returning
    /// it unchanged (the default) keeps the current expiration.
    #[allow(unused_variables)]
    fn expire_after_read(
        &self,
        key: &K,
        value: &V,
        read_at: Instant,
        duration_until_expiry: Option<Duration>,
        last_modified_at: Instant,
    ) -> Option<Duration> {
        duration_until_expiry
    }

    /// Called after the entry's value was replaced. Returning
    /// `duration_until_expiry` unchanged (the default) keeps the current
    /// expiration.
    #[allow(unused_variables)]
    fn expire_after_update(
        &self,
        key: &K,
        value: &V,
        updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        duration_until_expiry
    }
}

/// The expiration configuration of a cache.
pub(crate) struct ExpirationPolicy<K, V> {
    time_to_live: Option<Duration>,
    time_to_idle: Option<Duration>,
    expiry: Option<Arc<dyn Expiry<K, V> + Send + Sync + 'static>>,
}

impl<K, V> Default for ExpirationPolicy<K, V> {
    fn default() -> Self {
        Self {
            time_to_live: None,
            time_to_idle: None,
            expiry: None,
        }
    }
}

impl<K, V> Clone for ExpirationPolicy<K, V> {
    fn clone(&self) -> Self {
        Self {
            time_to_live: self.time_to_live,
            time_to_idle: self.time_to_idle,
            expiry: self.expiry.as_ref().map(Arc::clone),
        }
    }
}

impl<K, V> ExpirationPolicy<K, V> {
    pub(crate) fn new(
        time_to_live: Option<Duration>,
        time_to_idle: Option<Duration>,
        expiry: Option<Arc<dyn Expiry<K, V> + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            time_to_live,
            time_to_idle,
            expiry,
        }
    }

    pub(crate) fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    pub(crate) fn time_to_idle(&self) -> Option<Duration> {
        self.time_to_idle
    }

    pub(crate) fn expiry(&self) -> Option<&Arc<dyn Expiry<K, V> + Send + Sync + 'static>> {
        self.expiry.as_ref()
    }
}
