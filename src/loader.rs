/// Populates and refreshes cache entries.
///
/// The cache never loads on its own: `load` backs
/// [`get_all`][crate::Cache::get_all] for keys that are absent, and
/// `reload` backs [`refresh`][crate::Cache::refresh] and the
/// `refresh_after_write` policy. Reloads run on the cache's executor and
/// never hold any cache lock.
pub trait CacheLoader<K, V>: Send + Sync {
    /// Computes the value for `key`, or `None` when there is none.
    fn load(&self, key: &K) -> Option<V>;

    /// Computes a replacement value during a refresh. Returning `None`
    /// keeps the currently cached value.
    ///
    /// The default delegates to [`load`][CacheLoader::load].
    fn reload(&self, key: &K, old_value: &V) -> Option<V> {
        let _ = old_value;
        self.load(key)
    }

    /// Computes values for a batch of keys. The default performs
    /// sequential individual loads; implementations with a cheaper bulk
    /// source should override it.
    fn load_all(&self, keys: Vec<K>) -> Vec<(K, V)> {
        keys.into_iter()
            .filter_map(|key| self.load(&key).map(|value| (key, value)))
            .collect()
    }
}
