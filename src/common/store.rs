//! The sharded node store.
//!
//! A fixed power-of-two number of `RwLock`-guarded hash maps, with the
//! shard selected by the key's hash. The shard write lock doubles as the
//! per-key monitor: every mutating operation on a key (insert, update,
//! removal, and the write-through callback around it) runs under it, so
//! operations on a single key are linearizable while different shards
//! proceed in parallel.

use std::{
    borrow::Borrow,
    collections::HashMap,
    hash::{BuildHasher, Hash, Hasher},
    sync::Arc,
};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

pub(crate) type Shard<K, T, S> = RwLock<HashMap<Arc<K>, T, S>>;

/// The outcome of [`StripedHashMap::get_or_insert_with`].
pub(crate) enum GetOrInsert<T> {
    /// A live mapping was found; nothing was inserted.
    Present(T),
    /// `init` ran and its result was installed, displacing a mapping that
    /// failed the liveness check.
    Inserted { entry: T, displaced: Option<T> },
}

pub(crate) struct StripedHashMap<K, T, S> {
    shards: Box<[CachePadded<Shard<K, T, S>>]>,
    shard_mask: usize,
    build_hasher: S,
}

impl<K, T, S> StripedHashMap<K, T, S>
where
    K: Hash + Eq,
    T: Clone,
    S: BuildHasher + Clone,
{
    /// `num_shards` is rounded up to a power of two.
    pub(crate) fn with_num_shards_capacity_and_hasher(
        num_shards: usize,
        initial_capacity: usize,
        build_hasher: S,
    ) -> Self {
        let num_shards = num_shards.max(1).next_power_of_two();
        let per_shard_capacity = initial_capacity / num_shards;
        let shards = (0..num_shards)
            .map(|_| {
                CachePadded::new(RwLock::new(HashMap::with_capacity_and_hasher(
                    per_shard_capacity,
                    build_hasher.clone(),
                )))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            shard_mask: num_shards - 1,
            build_hasher,
        }
    }

    pub(crate) fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns the shard for the hash. Callers that mutate entries take the
    /// write lock and perform the whole read-modify-write under it.
    pub(crate) fn shard(&self, hash: u64) -> &Shard<K, T, S> {
        &self.shards[(hash as usize) & self.shard_mask]
    }

    pub(crate) fn get<Q>(&self, hash: u64, key: &Q) -> Option<T>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(hash).read().get(key).cloned()
    }

    pub(crate) fn get_key_value_and<Q, F, R>(&self, hash: u64, key: &Q, with_entry: F) -> Option<R>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&Arc<K>, &T) -> R,
    {
        self.shard(hash)
            .read()
            .get_key_value(key)
            .map(|(k, v)| with_entry(k, v))
    }

    pub(crate) fn get_key_value_and_then<Q, F, R>(
        &self,
        hash: u64,
        key: &Q,
        with_entry: F,
    ) -> Option<R>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&Arc<K>, &T) -> Option<R>,
    {
        self.shard(hash)
            .read()
            .get_key_value(key)
            .and_then(|(k, v)| with_entry(k, v))
    }

    /// The atomic insert-or-update primitive. Exactly one of the two
    /// closures runs, under the key's shard write lock; its result becomes
    /// the new mapping. A closure returning `Err` aborts the operation and
    /// leaves the map untouched.
    ///
    /// Returns the installed value and the displaced one, if any.
    #[allow(clippy::type_complexity)]
    pub(crate) fn insert_with_or_modify<E>(
        &self,
        key: Arc<K>,
        hash: u64,
        on_insert: impl FnOnce() -> Result<T, E>,
        on_modify: impl FnOnce(&Arc<K>, &T) -> Result<T, E>,
    ) -> Result<(T, Option<T>), E> {
        let mut shard = self.shard(hash).write();
        match shard.get(&key).cloned() {
            Some(old) => {
                let new = on_modify(&key, &old)?;
                shard.insert(key, new.clone());
                Ok((new, Some(old)))
            }
            None => {
                let new = on_insert()?;
                shard.insert(key, new.clone());
                Ok((new, None))
            }
        }
    }

    /// The atomic compute-if-absent primitive. When no mapping passes
    /// `is_alive`, runs `init` (at most once per key per concurrent
    /// attempt) and installs its result, displacing a dead mapping if one
    /// was present. All under the key's shard write lock.
    pub(crate) fn get_or_insert_with(
        &self,
        key: Arc<K>,
        hash: u64,
        is_alive: impl FnOnce(&Arc<K>, &T) -> bool,
        init: impl FnOnce() -> T,
    ) -> GetOrInsert<T> {
        let mut shard = self.shard(hash).write();
        if let Some(existing) = shard.get(&key) {
            if is_alive(&key, existing) {
                return GetOrInsert::Present(existing.clone());
            }
        }
        let displaced = shard.remove(&key);
        let entry = init();
        shard.insert(key, entry.clone());
        GetOrInsert::Inserted { entry, displaced }
    }

    /// Removes the entry if `condition` approves the current mapping.
    pub(crate) fn remove_if<Q, F>(&self, hash: u64, key: &Q, condition: F) -> Option<T>
    where
        Arc<K>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&Arc<K>, &T) -> bool,
    {
        let mut shard = self.shard(hash).write();
        let matches = shard
            .get_key_value(key)
            .map(|(k, v)| condition(k, v))
            .unwrap_or(false);
        if matches {
            shard.remove(key)
        } else {
            None
        }
    }

    /// Visits every entry. Takes the shard read locks one at a time, so
    /// the view is not a point-in-time snapshot across shards.
    pub(crate) fn for_each_entry(&self, mut f: impl FnMut(&Arc<K>, &T)) {
        for shard in self.shards.iter() {
            let map = shard.read();
            for (k, v) in map.iter() {
                f(k, v);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::RandomState;

    fn new_map() -> StripedHashMap<String, u32, RandomState> {
        StripedHashMap::with_num_shards_capacity_and_hasher(8, 64, RandomState::default())
    }

    #[test]
    fn insert_get_remove() {
        let map = new_map();
        let key = Arc::new("alpha".to_string());
        let hash = map.hash(&*key);

        map.shard(hash).write().insert(Arc::clone(&key), 1);
        assert_eq!(map.get(hash, "alpha"), Some(1));
        assert_eq!(map.len(), 1);

        let removed = map.remove_if(hash, "alpha", |_, v| *v == 2);
        assert_eq!(removed, None);
        let removed = map.remove_if(hash, "alpha", |_, v| *v == 1);
        assert_eq!(removed, Some(1));
        assert_eq!(map.get(hash, "alpha"), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn insert_with_or_modify_runs_one_closure() {
        let map = new_map();
        let key = Arc::new("gamma".to_string());
        let hash = map.hash(&*key);

        let result: Result<_, ()> = map.insert_with_or_modify(
            Arc::clone(&key),
            hash,
            || Ok(1),
            |_k, _old| unreachable!("no existing mapping"),
        );
        assert_eq!(result, Ok((1, None)));

        let result: Result<_, ()> = map.insert_with_or_modify(
            Arc::clone(&key),
            hash,
            || unreachable!("the mapping exists"),
            |_k, old| Ok(old + 1),
        );
        assert_eq!(result, Ok((2, Some(1))));
        assert_eq!(map.get(hash, "gamma"), Some(2));
    }

    #[test]
    fn insert_with_or_modify_aborts_on_error() {
        let map = new_map();
        let key = Arc::new("delta".to_string());
        let hash = map.hash(&*key);

        let result = map.insert_with_or_modify(
            Arc::clone(&key),
            hash,
            || Err("downstream failed"),
            |_k, _old| unreachable!(),
        );
        assert_eq!(result, Err("downstream failed"));
        assert_eq!(map.get(hash, "delta"), None);
    }

    #[test]
    fn get_or_insert_with_respects_liveness() {
        let map = new_map();
        let key = Arc::new("epsilon".to_string());
        let hash = map.hash(&*key);

        match map.get_or_insert_with(Arc::clone(&key), hash, |_k, _v| true, || 1) {
            super::GetOrInsert::Inserted {
                entry,
                displaced: None,
            } => assert_eq!(entry, 1),
            _ => panic!("expected an insert"),
        }

        // A live mapping short-circuits; init must not run.
        match map.get_or_insert_with(Arc::clone(&key), hash, |_k, _v| true, || unreachable!()) {
            super::GetOrInsert::Present(v) => assert_eq!(v, 1),
            _ => panic!("expected the present mapping"),
        }

        // A dead mapping is displaced by the fresh value.
        match map.get_or_insert_with(Arc::clone(&key), hash, |_k, _v| false, || 2) {
            super::GetOrInsert::Inserted {
                entry,
                displaced: Some(old),
            } => {
                assert_eq!(entry, 2);
                assert_eq!(old, 1);
            }
            _ => panic!("expected a displacing insert"),
        }
        assert_eq!(map.get(hash, "epsilon"), Some(2));
    }

    #[test]
    fn lookup_by_borrowed_form() {
        let map = new_map();
        let key = Arc::new("beta".to_string());
        let hash = map.hash("beta");

        map.shard(hash).write().insert(key, 7);
        let found = map.get_key_value_and(hash, "beta", |k, v| (k.to_string(), *v));
        assert_eq!(found, Some(("beta".to_string(), 7)));
    }

    #[test]
    fn for_each_entry_visits_all_shards() {
        let map = new_map();
        for i in 0..100u32 {
            let key = Arc::new(format!("k{i}"));
            let hash = map.hash(&*key);
            map.shard(hash).write().insert(key, i);
        }

        let mut total = 0u32;
        let mut count = 0;
        map.for_each_entry(|_, v| {
            total += *v;
            count += 1;
        });
        assert_eq!(count, 100);
        assert_eq!(total, (0..100).sum::<u32>());
    }
}
