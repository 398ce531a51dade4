use std::sync::atomic::{AtomicU64, Ordering};

use super::time::Instant;

/// An optional `Instant` that can be read, written and compare-exchanged
/// atomically. `u64::MAX` encodes "unset".
#[derive(Debug)]
pub(crate) struct AtomicInstant {
    instant: AtomicU64,
}

const UNSET: u64 = u64::MAX;

impl Default for AtomicInstant {
    fn default() -> Self {
        Self {
            instant: AtomicU64::new(UNSET),
        }
    }
}

impl AtomicInstant {
    pub(crate) fn new(timestamp: Instant) -> Self {
        let ai = Self::default();
        ai.set_instant(timestamp);
        ai
    }

    pub(crate) fn clear(&self) {
        self.instant.store(UNSET, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.instant.load(Ordering::Acquire) != UNSET
    }

    pub(crate) fn instant(&self) -> Option<Instant> {
        let ts = self.instant.load(Ordering::Acquire);
        if ts == UNSET {
            None
        } else {
            Some(Instant::from_nanos(ts))
        }
    }

    pub(crate) fn set_instant(&self, instant: Instant) {
        self.instant.store(instant.as_nanos(), Ordering::Release);
    }

    /// Atomically replaces `current` with `new`. Returns `true` when the
    /// stored value was `current`.
    pub(crate) fn compare_exchange(&self, current: Instant, new: Instant) -> bool {
        self.instant
            .compare_exchange(
                current.as_nanos(),
                new.as_nanos(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
