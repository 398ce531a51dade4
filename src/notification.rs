use std::sync::Arc;

pub(crate) mod notifier;

/// A listener invoked whenever an entry is removed from the cache, with the
/// cause of the removal.
pub(crate) type EvictionListener<K, V> =
    Arc<dyn Fn(Arc<K>, V, RemovalCause) + Send + Sync + 'static>;

/// The reason an entry left the cache, conveyed to the removal listener and
/// the cache writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalCause {
    /// The entry's expiration timestamp has passed.
    Expired,
    /// The entry was manually removed by the user.
    Explicit,
    /// The entry itself was not removed, but its value was replaced by the
    /// user.
    Replaced,
    /// The entry was evicted due to size constraints.
    Size,
}

impl RemovalCause {
    /// Returns `true` when the removal was decided by the cache rather
    /// than requested by the user.
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Expired | Self::Size)
    }
}
