use std::{
    fmt,
    ptr::NonNull,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tagptr::TagNonNull;
use triomphe::Arc as TrioArc;

use super::{
    atomic_time::AtomicInstant,
    deque::DeqNode,
    time::Instant,
    timer_wheel::TimerNode,
};

pub(crate) type Weigher<K, V> = Arc<dyn Fn(&K, &V) -> u32 + Send + Sync + 'static>;

/// The lifecycle of an entry.
///
/// An entry is `Alive` while it is in the hash table. It becomes `Retired`
/// when removed from the table while still linked into policy structures
/// pending a drain, and `Dead` once unlinked from everything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum EntryState {
    Alive = 0,
    Retired = 1,
    Dead = 2,
}

impl From<u8> for EntryState {
    fn from(n: u8) -> Self {
        match n {
            0 => Self::Alive,
            1 => Self::Retired,
            2 => Self::Dead,
            _ => unreachable!(),
        }
    }
}

pub(crate) struct KeyHash<K> {
    pub(crate) key: Arc<K>,
    pub(crate) hash: u64,
}

impl<K> KeyHash<K> {
    pub(crate) fn new(key: Arc<K>, hash: u64) -> Self {
        Self { key, hash }
    }
}

impl<K> Clone for KeyHash<K> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            hash: self.hash,
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for KeyHash<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHash")
            .field("key", &self.key)
            .field("hash", &self.hash)
            .finish()
    }
}

/// The shared, atomically updated part of a cache entry. Replacing a value
/// reuses the same `EntryInfo`, so the policy structures and an in-flight
/// refresh keep observing the entry across updates.
pub(crate) struct EntryInfo<K> {
    key_hash: KeyHash<K>,
    state: AtomicU8,
    /// `true` once the entry has been linked into the policy deques.
    is_admitted: AtomicBool,
    /// `true` while an insert or update has not yet been applied to the
    /// policy structures.
    is_dirty: AtomicBool,
    last_accessed: AtomicInstant,
    last_modified: AtomicInstant,
    /// The absolute deadline for per-entry variable expiration, when set.
    expiration_time: AtomicInstant,
    policy_weight: AtomicU32,
}

impl<K> EntryInfo<K> {
    pub(crate) fn new(key_hash: KeyHash<K>, timestamp: Instant, policy_weight: u32) -> Self {
        Self {
            key_hash,
            state: AtomicU8::new(EntryState::Alive as u8),
            is_admitted: AtomicBool::default(),
            is_dirty: AtomicBool::new(true),
            last_accessed: AtomicInstant::new(timestamp),
            last_modified: AtomicInstant::new(timestamp),
            expiration_time: AtomicInstant::default(),
            policy_weight: AtomicU32::new(policy_weight),
        }
    }

    pub(crate) fn key_hash(&self) -> &KeyHash<K> {
        &self.key_hash
    }

    pub(crate) fn state(&self) -> EntryState {
        self.state.load(Ordering::Acquire).into()
    }

    pub(crate) fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_admitted(&self) -> bool {
        self.is_admitted.load(Ordering::Acquire)
    }

    pub(crate) fn set_admitted(&self, value: bool) {
        self.is_admitted.store(value, Ordering::Release);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, value: bool) {
        self.is_dirty.store(value, Ordering::Release);
    }

    pub(crate) fn last_accessed(&self) -> Option<Instant> {
        self.last_accessed.instant()
    }

    pub(crate) fn set_last_accessed(&self, timestamp: Instant) {
        self.last_accessed.set_instant(timestamp);
    }

    pub(crate) fn last_modified(&self) -> Option<Instant> {
        self.last_modified.instant()
    }

    pub(crate) fn set_last_modified(&self, timestamp: Instant) {
        self.last_modified.set_instant(timestamp);
    }

    /// CAS on the write time; the refresh protocol uses this to claim an
    /// entry and to restore it on failure.
    pub(crate) fn cas_last_modified(&self, current: Instant, new: Instant) -> bool {
        self.last_modified.compare_exchange(current, new)
    }

    pub(crate) fn expiration_time(&self) -> Option<Instant> {
        self.expiration_time.instant()
    }

    pub(crate) fn set_expiration_time(&self, time: Option<Instant>) {
        match time {
            Some(t) => self.expiration_time.set_instant(t),
            None => self.expiration_time.clear(),
        }
    }

    pub(crate) fn policy_weight(&self) -> u32 {
        self.policy_weight.load(Ordering::Acquire)
    }

    pub(crate) fn set_policy_weight(&self, weight: u32) {
        self.policy_weight.store(weight, Ordering::Release);
    }
}

/// An access-order deque node; the 2-bit tag encodes the `CacheRegion`.
pub(crate) type KeyDeqNodeAo<K> = TagNonNull<DeqNode<KeyHashDate<K>>, 2>;

/// A write-order deque node.
pub(crate) type KeyDeqNodeWo<K> = NonNull<DeqNode<KeyHashDate<K>>>;

/// A timer wheel node.
pub(crate) type DeqNodeTimer<K> = NonNull<DeqNode<TimerNode<K>>>;

/// The pointers from an entry back into the intrusive policy structures.
/// Shared between the entry and its deque/timer nodes so either side can
/// locate the other in O(1).
pub(crate) struct DeqNodes<K> {
    access_order_q_node: Option<KeyDeqNodeAo<K>>,
    write_order_q_node: Option<KeyDeqNodeWo<K>>,
    timer_node: Option<DeqNodeTimer<K>>,
}

// The `NonNull` members make this type `!Send` by default, but the pointers
// are only dereferenced under the eviction lock.
unsafe impl<K: Send> Send for DeqNodes<K> {}

impl<K> Default for DeqNodes<K> {
    fn default() -> Self {
        Self {
            access_order_q_node: None,
            write_order_q_node: None,
            timer_node: None,
        }
    }
}

impl<K> DeqNodes<K> {
    pub(crate) fn set_access_order_q_node(&mut self, node: Option<KeyDeqNodeAo<K>>) {
        self.access_order_q_node = node;
    }

    pub(crate) fn set_write_order_q_node(&mut self, node: Option<KeyDeqNodeWo<K>>) {
        self.write_order_q_node = node;
    }

    pub(crate) fn set_timer_node(&mut self, timer_node: Option<DeqNodeTimer<K>>) {
        self.timer_node = timer_node;
    }
}

/// The element stored in the access-order and write-order deques.
pub(crate) struct KeyHashDate<K> {
    entry_info: TrioArc<EntryInfo<K>>,
    nodes: TrioArc<Mutex<DeqNodes<K>>>,
}

impl<K> KeyHashDate<K> {
    pub(crate) fn new(
        entry_info: &TrioArc<EntryInfo<K>>,
        nodes: &TrioArc<Mutex<DeqNodes<K>>>,
    ) -> Self {
        Self {
            entry_info: TrioArc::clone(entry_info),
            nodes: TrioArc::clone(nodes),
        }
    }

    pub(crate) fn key(&self) -> &Arc<K> {
        &self.entry_info.key_hash().key
    }

    pub(crate) fn hash(&self) -> u64 {
        self.entry_info.key_hash().hash
    }

    pub(crate) fn entry_info(&self) -> &TrioArc<EntryInfo<K>> {
        &self.entry_info
    }

    pub(crate) fn deq_nodes(&self) -> &TrioArc<Mutex<DeqNodes<K>>> {
        &self.nodes
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.entry_info.is_dirty()
    }

    pub(crate) fn last_accessed(&self) -> Option<Instant> {
        self.entry_info.last_accessed()
    }

    pub(crate) fn last_modified(&self) -> Option<Instant> {
        self.entry_info.last_modified()
    }
}

/// A cache entry: the value plus the shared entry metadata and the pointers
/// into the policy structures.
pub(crate) struct ValueEntry<K, V> {
    pub(crate) value: V,
    info: TrioArc<EntryInfo<K>>,
    nodes: TrioArc<Mutex<DeqNodes<K>>>,
}

impl<K, V> ValueEntry<K, V> {
    pub(crate) fn new(value: V, entry_info: TrioArc<EntryInfo<K>>) -> Self {
        Self {
            value,
            info: entry_info,
            nodes: TrioArc::new(Mutex::new(DeqNodes::default())),
        }
    }

    /// Creates an entry replacing the value of `other`, sharing its
    /// `EntryInfo` and deque node registry.
    pub(crate) fn new_from(value: V, other: &Self) -> Self {
        Self {
            value,
            info: TrioArc::clone(&other.info),
            nodes: TrioArc::clone(&other.nodes),
        }
    }

    pub(crate) fn entry_info(&self) -> &TrioArc<EntryInfo<K>> {
        &self.info
    }

    pub(crate) fn deq_nodes(&self) -> &TrioArc<Mutex<DeqNodes<K>>> {
        &self.nodes
    }

    pub(crate) fn key_hash_date(&self) -> KeyHashDate<K> {
        KeyHashDate::new(&self.info, &self.nodes)
    }

    pub(crate) fn is_admitted(&self) -> bool {
        self.info.is_admitted()
    }

    pub(crate) fn set_admitted(&self, value: bool) {
        self.info.set_admitted(value);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.info.is_dirty()
    }

    pub(crate) fn policy_weight(&self) -> u32 {
        self.info.policy_weight()
    }

    pub(crate) fn last_accessed(&self) -> Option<Instant> {
        self.info.last_accessed()
    }

    pub(crate) fn last_modified(&self) -> Option<Instant> {
        self.info.last_modified()
    }

    pub(crate) fn access_order_q_node(&self) -> Option<KeyDeqNodeAo<K>> {
        self.nodes.lock().access_order_q_node
    }

    pub(crate) fn set_access_order_q_node(&self, node: Option<KeyDeqNodeAo<K>>) {
        self.nodes.lock().access_order_q_node = node;
    }

    pub(crate) fn take_access_order_q_node(&self) -> Option<KeyDeqNodeAo<K>> {
        self.nodes.lock().access_order_q_node.take()
    }

    pub(crate) fn write_order_q_node(&self) -> Option<KeyDeqNodeWo<K>> {
        self.nodes.lock().write_order_q_node
    }

    pub(crate) fn set_write_order_q_node(&self, node: Option<KeyDeqNodeWo<K>>) {
        self.nodes.lock().write_order_q_node = node;
    }

    pub(crate) fn take_write_order_q_node(&self) -> Option<KeyDeqNodeWo<K>> {
        self.nodes.lock().write_order_q_node.take()
    }

    pub(crate) fn timer_node(&self) -> Option<DeqNodeTimer<K>> {
        self.nodes.lock().timer_node
    }

    pub(crate) fn set_timer_node(&self, node: Option<DeqNodeTimer<K>>) {
        self.nodes.lock().timer_node = node;
    }

    pub(crate) fn take_timer_node(&self) -> Option<DeqNodeTimer<K>> {
        self.nodes.lock().timer_node.take()
    }

    pub(crate) fn unset_q_nodes(&self) {
        let mut nodes = self.nodes.lock();
        nodes.access_order_q_node = None;
        nodes.write_order_q_node = None;
    }
}

pub(crate) struct KvEntry<K, V> {
    pub(crate) key: Arc<K>,
    pub(crate) entry: TrioArc<ValueEntry<K, V>>,
}

impl<K, V> KvEntry<K, V> {
    pub(crate) fn new(key: Arc<K>, entry: TrioArc<ValueEntry<K, V>>) -> Self {
        Self { key, entry }
    }
}

impl<K, V> Clone for KvEntry<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            entry: TrioArc::clone(&self.entry),
        }
    }
}

/// A recorded read, drained by the maintenance routine.
pub(crate) enum ReadOp<K, V> {
    Hit {
        value_entry: TrioArc<ValueEntry<K, V>>,
        /// `true` when the per-entry expiration was changed by the read, so
        /// the timer wheel needs a reschedule.
        is_expiry_modified: bool,
    },
    /// The hash of the missing key, recorded for the frequency sketch.
    Miss(u64),
}

/// A recorded insert, update or removal, drained by the maintenance routine.
pub(crate) enum WriteOp<K, V> {
    Upsert {
        key_hash: KeyHash<K>,
        value_entry: TrioArc<ValueEntry<K, V>>,
        old_weight: u32,
        new_weight: u32,
    },
    Remove(KvEntry<K, V>),
}

impl<K, V> fmt::Debug for WriteOp<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert { .. } => f.debug_struct("Upsert").finish(),
            Self::Remove { .. } => f.debug_tuple("Remove").finish(),
        }
    }
}
