use tagptr::TagNonNull;
use triomphe::Arc as TrioArc;

use super::{
    deque::{CacheRegion, DeqNode, Deque},
    entry::{EntryInfo, KeyHashDate, ValueEntry},
};

/// The intrusive orderings owned by the maintenance routine: the three
/// access-order deques of the W-TinyLFU policy and the write-order deque.
/// Only ever touched under the eviction lock.
pub(crate) struct Deques<K> {
    pub(crate) eden: Deque<KeyHashDate<K>>,
    pub(crate) probation: Deque<KeyHashDate<K>>,
    pub(crate) protected: Deque<KeyHashDate<K>>,
    pub(crate) write_order: Deque<KeyHashDate<K>>,
}

// The deques hold `NonNull` pointers; they are moved across threads only
// while inside the eviction lock's mutex.
unsafe impl<K: Send + Sync> Send for Deques<K> {}

impl<K> Default for Deques<K> {
    fn default() -> Self {
        Self {
            eden: Deque::new(CacheRegion::Eden),
            probation: Deque::new(CacheRegion::MainProbation),
            protected: Deque::new(CacheRegion::MainProtected),
            write_order: Deque::new(CacheRegion::Other),
        }
    }
}

impl<K> Deques<K> {
    pub(crate) fn select_ao_mut(&mut self, region: CacheRegion) -> &mut Deque<KeyHashDate<K>> {
        match region {
            CacheRegion::Eden => &mut self.eden,
            CacheRegion::MainProbation => &mut self.probation,
            CacheRegion::MainProtected => &mut self.protected,
            CacheRegion::Other => unreachable!(),
        }
    }

    /// Links the entry at the tail of the given access-order deque and
    /// stores the tagged node pointer in the entry.
    pub(crate) fn push_back_ao<V>(
        &mut self,
        region: CacheRegion,
        khd: KeyHashDate<K>,
        entry: &TrioArc<ValueEntry<K, V>>,
    ) {
        let node = Box::new(DeqNode::new(khd));
        let node = self.select_ao_mut(region).push_back(node);
        let tagged_node = TagNonNull::compose(node, region as usize);
        entry.set_access_order_q_node(Some(tagged_node));
    }

    pub(crate) fn push_back_wo<V>(
        &mut self,
        khd: KeyHashDate<K>,
        entry: &TrioArc<ValueEntry<K, V>>,
    ) {
        let node = Box::new(DeqNode::new(khd));
        let node = self.write_order.push_back(node);
        entry.set_write_order_q_node(Some(node));
    }

    /// Returns the region of the access-order deque the entry is currently
    /// linked into.
    pub(crate) fn ao_region<V>(entry: &TrioArc<ValueEntry<K, V>>) -> Option<CacheRegion> {
        entry
            .access_order_q_node()
            .map(|tagged| tagged.decompose_tag().into())
    }

    pub(crate) fn move_to_back_ao<V>(&mut self, entry: &TrioArc<ValueEntry<K, V>>) {
        if let Some(tagged_node) = entry.access_order_q_node() {
            let (node, tag) = tagged_node.decompose();
            let deq = self.select_ao_mut(tag.into());
            if deq.contains(unsafe { node.as_ref() }) {
                unsafe { deq.move_to_back(node) };
            }
        }
    }

    /// Moves the entry's access-order node to the tail of `to`, retagging
    /// the pointer. Used for eden→probation demotion and the
    /// probation↔protected promotions.
    pub(crate) fn move_to_region_tail<V>(
        &mut self,
        entry: &TrioArc<ValueEntry<K, V>>,
        to: CacheRegion,
    ) {
        if let Some(tagged_node) = entry.access_order_q_node() {
            let (node, tag) = tagged_node.decompose();
            let from = self.select_ao_mut(tag.into());
            if !from.contains(unsafe { node.as_ref() }) {
                return;
            }
            unsafe { from.unlink(node) };
            let node = unsafe { Box::from_raw(node.as_ptr()) };
            let node = self.select_ao_mut(to).push_back(node);
            entry.set_access_order_q_node(Some(TagNonNull::compose(node, to as usize)));
        }
    }

    /// Moves the front node of `from` to the tail of `to` and returns the
    /// moved entry's info for weight accounting.
    pub(crate) fn transfer_front_ao(
        &mut self,
        from: CacheRegion,
        to: CacheRegion,
    ) -> Option<TrioArc<EntryInfo<K>>> {
        debug_assert_eq!(
            self.select_ao_mut(to).region(),
            to,
            "transfer into the {} deque",
            to.name()
        );
        let node = self.select_ao_mut(from).peek_front_ptr()?;
        unsafe { self.select_ao_mut(from).unlink(node) };
        let node = unsafe { Box::from_raw(node.as_ptr()) };
        let info = TrioArc::clone(node.element.entry_info());
        let nodes = TrioArc::clone(node.element.deq_nodes());
        let node = self.select_ao_mut(to).push_back(node);
        nodes
            .lock()
            .set_access_order_q_node(Some(TagNonNull::compose(node, to as usize)));
        Some(info)
    }

    pub(crate) fn move_to_back_wo<V>(&mut self, entry: &TrioArc<ValueEntry<K, V>>) {
        if let Some(node) = entry.write_order_q_node() {
            if self.write_order.contains(unsafe { node.as_ref() }) {
                unsafe { self.write_order.move_to_back(node) };
            }
        }
    }

    pub(crate) fn unlink_ao<V>(&mut self, entry: &TrioArc<ValueEntry<K, V>>) {
        if let Some(tagged_node) = entry.take_access_order_q_node() {
            let (node, tag) = tagged_node.decompose();
            let deq = self.select_ao_mut(tag.into());
            if deq.contains(unsafe { node.as_ref() }) {
                unsafe { deq.unlink_and_drop(node) };
            }
        }
    }

    pub(crate) fn unlink_wo<V>(&mut self, entry: &TrioArc<ValueEntry<K, V>>) {
        if let Some(node) = entry.take_write_order_q_node() {
            if self.write_order.contains(unsafe { node.as_ref() }) {
                unsafe { self.write_order.unlink_and_drop(node) };
            }
        }
    }
}
