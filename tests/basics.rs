use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use lungo::{Cache, CacheLoader, Executor, RemovalCause};

#[test]
fn bounded_cache_keeps_at_most_max_capacity_entries() {
    let cache = Cache::new(2);

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
fn stats_count_hits_and_misses() {
    let cache: Cache<&str, &str> = Cache::builder()
        .max_capacity(100)
        .record_stats()
        .build();

    cache.insert("k", "v").unwrap();
    assert_eq!(cache.get(&"k"), Some("v"));
    assert_eq!(cache.get(&"x"), None);

    let stats = cache.stats();
    assert_eq!(stats.hit_count(), 1);
    assert_eq!(stats.miss_count(), 1);
}

#[test]
fn put_then_get_returns_the_value() {
    let cache = Cache::new(10_000);
    for i in 0..1_000u32 {
        cache.insert(i, i.to_string()).unwrap();
        assert_eq!(cache.get(&i), Some(i.to_string()));
    }
}

#[test]
fn invalidate_notifies_at_most_once() {
    let notifications = Arc::new(Mutex::new(Vec::new()));
    let notifications2 = Arc::clone(&notifications);
    let cache: Cache<&str, u32> = Cache::builder()
        .max_capacity(100)
        .eviction_listener(move |key, value, cause| {
            notifications2.lock().unwrap().push((*key, value, cause));
        })
        .executor(Executor::SameThread)
        .build();

    cache.insert("a", 1).unwrap();
    cache.invalidate(&"a").unwrap();
    cache.invalidate(&"a").unwrap();
    cache.run_pending_tasks();

    let log = notifications.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0], ("a", 1, RemovalCause::Explicit));
}

#[test]
fn insert_all_and_invalidate_many() {
    let cache: Cache<u32, u32> = Cache::new(100);

    cache.insert_all((0..10).map(|i| (i, i * 2))).unwrap();
    for i in 0..10 {
        assert_eq!(cache.get(&i), Some(i * 2));
    }

    let doomed: Vec<u32> = (0..5).collect();
    cache.invalidate_many(doomed.iter()).unwrap();
    for i in 0..5 {
        assert_eq!(cache.get(&i), None);
    }
    for i in 5..10 {
        assert_eq!(cache.get(&i), Some(i * 2));
    }
}

struct SquareLoader {
    loads: AtomicUsize,
}

struct SquareLoaderHandle(Arc<SquareLoader>);

impl CacheLoader<u32, u64> for SquareLoaderHandle {
    fn load(&self, key: &u32) -> Option<u64> {
        self.0.loads.fetch_add(1, Ordering::SeqCst);
        Some(u64::from(*key) * u64::from(*key))
    }
}

#[test]
fn get_all_loads_missing_keys() {
    let loader = Arc::new(SquareLoader {
        loads: AtomicUsize::new(0),
    });
    let cache: Cache<u32, u64> = Cache::builder()
        .max_capacity(100)
        .loader(SquareLoaderHandle(Arc::clone(&loader)))
        .build();

    cache.insert(2, 999).unwrap();
    let all = cache.get_all([1, 2, 3]);

    assert_eq!(all.len(), 3);
    assert_eq!(all.get(&Arc::new(1)), Some(&1));
    assert_eq!(all.get(&Arc::new(2)), Some(&999)); // the cached value wins
    assert_eq!(all.get(&Arc::new(3)), Some(&9));
    assert_eq!(loader.loads.load(Ordering::SeqCst), 2);

    // The loaded values are now cached.
    assert_eq!(cache.get(&3), Some(9));
}

#[test]
fn policy_reports_the_configuration() {
    use std::time::Duration;

    let cache: Cache<u32, u32> = Cache::builder()
        .max_capacity(500)
        .time_to_live(Duration::from_secs(60))
        .time_to_idle(Duration::from_secs(30))
        .name("example")
        .build();

    assert_eq!(cache.name(), Some("example"));
    let policy = cache.policy();
    assert_eq!(policy.max_capacity(), Some(500));
    assert_eq!(policy.time_to_live(), Some(Duration::from_secs(60)));
    assert_eq!(policy.time_to_idle(), Some(Duration::from_secs(30)));
}

#[test]
fn unbounded_cache_never_evicts() {
    let cache: Cache<u32, u32> = Cache::builder().build();
    for i in 0..10_000 {
        cache.insert(i, i).unwrap();
    }
    cache.run_pending_tasks();
    assert_eq!(cache.entry_count(), 10_000);
    assert_eq!(cache.get(&0), Some(0));
    assert_eq!(cache.get(&9_999), Some(9_999));
}
