use std::{marker::PhantomData, ptr::NonNull};

/// The region of the cache that owns an access-order node. Encoded into the
/// low bits of the node pointer held by the entry, so that the maintenance
/// routine knows which deque a node belongs to without a lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CacheRegion {
    /// The recency window admitting every new entry.
    Eden = 0,
    /// The frequency-filtered part of the main area.
    MainProbation = 1,
    /// The hot part of the main area, holding entries that were re-accessed
    /// while on probation.
    MainProtected = 2,
    /// The write-order queue and the timer wheel.
    Other = 3,
}

impl From<usize> for CacheRegion {
    fn from(n: usize) -> Self {
        match n {
            0 => Self::Eden,
            1 => Self::MainProbation,
            2 => Self::MainProtected,
            3 => Self::Other,
            _ => panic!("invalid cache region tag: {n}"),
        }
    }
}

impl CacheRegion {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Eden => "eden",
            Self::MainProbation => "probation",
            Self::MainProtected => "protected",
            Self::Other => "other",
        }
    }
}

// The access-order queues store a `tagptr::TagNonNull<DeqNode<T>, 2>` pointer
// to these nodes. The minimum alignment of 4 reserves the 2 tag bits.
// https://doc.rust-lang.org/reference/type-layout.html#the-alignment-modifiers
#[repr(align(4))]
#[derive(PartialEq, Eq)]
pub(crate) struct DeqNode<T> {
    next: Option<NonNull<DeqNode<T>>>,
    prev: Option<NonNull<DeqNode<T>>>,
    pub(crate) element: T,
}

impl<T> std::fmt::Debug for DeqNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeqNode")
            .field("next", &self.next)
            .field("prev", &self.prev)
            .finish()
    }
}

impl<T> DeqNode<T> {
    pub(crate) fn new(element: T) -> Self {
        Self {
            next: None,
            prev: None,
            element,
        }
    }

    pub(crate) fn next_node_ptr(this: NonNull<Self>) -> Option<NonNull<DeqNode<T>>> {
        unsafe { this.as_ref() }.next
    }

    pub(crate) fn prev_node_ptr(this: NonNull<Self>) -> Option<NonNull<DeqNode<T>>> {
        unsafe { this.as_ref() }.prev
    }
}

/// An intrusive doubly linked deque over heap-allocated nodes.
///
/// Nodes are owned by the deque while linked, but other structures keep raw
/// `NonNull` pointers into them, so every method is written to never create
/// a `&mut` reference that overlaps `element`. The deque is only ever
/// accessed under the cache's eviction lock, so the operations themselves
/// are sequential.
pub(crate) struct Deque<T> {
    region: CacheRegion,
    len: usize,
    head: Option<NonNull<DeqNode<T>>>,
    tail: Option<NonNull<DeqNode<T>>>,
    marker: PhantomData<Box<DeqNode<T>>>,
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

impl<T> Deque<T> {
    pub(crate) fn new(region: CacheRegion) -> Self {
        Self {
            region,
            len: 0,
            head: None,
            tail: None,
            marker: PhantomData,
        }
    }

    pub(crate) fn region(&self) -> CacheRegion {
        self.region
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when `node` is linked into this deque. A node with no
    /// `prev` link is only a member if it is the head.
    pub(crate) fn contains(&self, node: &DeqNode<T>) -> bool {
        node.prev.is_some() || self.is_head(node)
    }

    pub(crate) fn peek_front(&self) -> Option<&DeqNode<T>> {
        self.head.as_ref().map(|node| unsafe { node.as_ref() })
    }

    pub(crate) fn peek_front_ptr(&self) -> Option<NonNull<DeqNode<T>>> {
        self.head
    }

    #[cfg(test)]
    pub(crate) fn peek_back(&self) -> Option<&DeqNode<T>> {
        self.tail.as_ref().map(|node| unsafe { node.as_ref() })
    }

    pub(crate) fn peek_back_ptr(&self) -> Option<NonNull<DeqNode<T>>> {
        self.tail
    }

    /// Removes and returns the node at the front.
    pub(crate) fn pop_front(&mut self) -> Option<Box<DeqNode<T>>> {
        self.head.map(|node| unsafe {
            let mut node = Box::from_raw(node.as_ptr());
            self.head = node.next;

            match self.head {
                None => self.tail = None,
                // Not creating a new mutable (unique!) reference overlapping
                // `element`.
                Some(head) => (*head.as_ptr()).prev = None,
            }

            self.len -= 1;
            node.prev = None;
            node.next = None;
            node
        })
    }

    /// Appends the node and returns a pointer to it.
    pub(crate) fn push_back(&mut self, mut node: Box<DeqNode<T>>) -> NonNull<DeqNode<T>> {
        unsafe {
            node.next = None;
            node.prev = self.tail;
            let node = NonNull::new(Box::into_raw(node)).expect("Got a null ptr");

            match self.tail {
                None => self.head = Some(node),
                Some(tail) => (*tail.as_ptr()).next = Some(node),
            }

            self.tail = Some(node);
            self.len += 1;
            node
        }
    }

    /// Moves a linked node to the tail.
    ///
    /// # Safety
    ///
    /// `node` must be linked into this deque.
    pub(crate) unsafe fn move_to_back(&mut self, mut node: NonNull<DeqNode<T>>) {
        if self.is_tail(node.as_ref()) {
            return;
        }

        let node = node.as_mut(); // this one is ours now, we can create an &mut.

        match node.prev {
            Some(prev) => (*prev.as_ptr()).next = node.next,
            // This node is the head.
            None => self.head = node.next,
        };

        // Not the tail, so `next` is set.
        if let Some(next) = node.next.take() {
            (*next.as_ptr()).prev = node.prev;

            let mut node = NonNull::from(node);
            match self.tail {
                Some(tail) => {
                    node.as_mut().prev = Some(tail);
                    (*tail.as_ptr()).next = Some(node);
                }
                None => unreachable!(),
            }
            self.tail = Some(node);
        }
    }

    pub(crate) fn move_front_to_back(&mut self) {
        if let Some(node) = self.head {
            unsafe { self.move_to_back(node) };
        }
    }

    /// Unlinks the node without dropping it. The caller takes ownership of
    /// the allocation; use `unlink_and_drop` or `Box::from_raw` afterwards,
    /// otherwise the node leaks.
    ///
    /// # Safety
    ///
    /// `node` must be linked into this deque.
    pub(crate) unsafe fn unlink(&mut self, mut node: NonNull<DeqNode<T>>) {
        let node = node.as_mut(); // this one is ours now, we can create an &mut.

        match node.prev {
            Some(prev) => (*prev.as_ptr()).next = node.next,
            None => self.head = node.next,
        };

        match node.next {
            Some(next) => (*next.as_ptr()).prev = node.prev,
            None => self.tail = node.prev,
        };

        node.prev = None;
        node.next = None;
        self.len -= 1;
    }

    /// Unlinks the node and frees it.
    ///
    /// # Safety
    ///
    /// `node` must be linked into this deque.
    pub(crate) unsafe fn unlink_and_drop(&mut self, node: NonNull<DeqNode<T>>) {
        self.unlink(node);
        drop(Box::from_raw(node.as_ptr()));
    }

    fn is_head(&self, node: &DeqNode<T>) -> bool {
        self.head
            .map(|head| std::ptr::eq(unsafe { head.as_ref() }, node))
            .unwrap_or(false)
    }

    fn is_tail(&self, node: &DeqNode<T>) -> bool {
        self.tail
            .map(|tail| std::ptr::eq(unsafe { tail.as_ref() }, node))
            .unwrap_or(false)
    }
}
