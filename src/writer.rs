use crate::{error::CallbackError, notification::RemovalCause};

/// A write-through hook invoked synchronously inside mutating operations,
/// under the written key's lock.
///
/// `write` runs for explicit inserts and updates; `delete` runs for
/// explicit removals and for evictions decided by the policy. Errors from
/// explicit operations are surfaced to the caller as
/// [`WriterError`][crate::WriterError]; errors during eviction are logged
/// and the eviction proceeds.
///
/// The implementation must not call back into the cache for the same key,
/// and should be fast: it runs while other writers to the same shard wait.
pub trait CacheWriter<K, V>: Send + Sync {
    /// Called when an entry is inserted or its value is replaced.
    fn write(&self, key: &K, value: &V) -> Result<(), CallbackError>;

    /// Called when an entry is removed, with the cause of the removal.
    fn delete(&self, key: &K, value: &V, cause: RemovalCause) -> Result<(), CallbackError>;
}
