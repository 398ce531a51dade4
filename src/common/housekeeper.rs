//! Coordination of the maintenance routine.
//!
//! The drain status decides when maintenance runs relative to concurrent
//! readers and writers. A reader whose buffer offer reported `Full`, and
//! every writer, asks for a run; the status machine makes sure only one
//! thread runs it at a time, and that work arriving while a run is in
//! flight triggers exactly one follow-up run.

use std::{
    sync::atomic::{AtomicBool, AtomicU8, Ordering},
    time::Duration,
};

use crossbeam_utils::CachePadded;

use super::{
    atomic_time::AtomicInstant,
    time::Instant,
};

/// How long a cache may go without a maintenance run before a read
/// schedules one regardless of buffer occupancy.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum DrainStatus {
    /// No maintenance is running or required.
    Idle = 0,
    /// Work is pending; the next scheduling attempt will run.
    Required = 1,
    /// A run is in flight and will transition to `Idle` when done.
    ProcessingToIdle = 2,
    /// A run is in flight and new work arrived, so it must run again.
    ProcessingToRequired = 3,
}

impl From<u8> for DrainStatus {
    fn from(n: u8) -> Self {
        match n {
            0 => Self::Idle,
            1 => Self::Required,
            2 => Self::ProcessingToIdle,
            3 => Self::ProcessingToRequired,
            _ => unreachable!(),
        }
    }
}

/// The part of the cache the housekeeper drives.
pub(crate) trait InnerSync {
    /// Drains the buffers and applies the policy under the eviction lock.
    fn run_pending_tasks(&self);

    fn now(&self) -> Instant;
}

pub(crate) struct Housekeeper {
    drain_status: CachePadded<AtomicU8>,
    run_after: AtomicInstant,
    /// Cleared by tests that drive maintenance explicitly.
    auto_run_enabled: AtomicBool,
}

impl Default for Housekeeper {
    fn default() -> Self {
        Self {
            drain_status: CachePadded::new(AtomicU8::new(DrainStatus::Idle as u8)),
            run_after: AtomicInstant::default(),
            auto_run_enabled: AtomicBool::new(true),
        }
    }
}

impl Housekeeper {
    fn status(&self) -> DrainStatus {
        self.drain_status.load(Ordering::Acquire).into()
    }

    fn cas_status(&self, current: DrainStatus, new: DrainStatus) -> bool {
        self.drain_status
            .compare_exchange(
                current as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns `true` when the timed backstop is due. Reads use this so a
    /// quiet cache still applies its buffered events.
    pub(crate) fn is_run_due(&self, now: Instant) -> bool {
        match self.run_after.instant() {
            Some(after) => after <= now,
            None => true,
        }
    }

    /// Requests a maintenance run. Runs it inline on this thread when the
    /// status machine grants it; otherwise records that another run is
    /// required and returns.
    pub(crate) fn try_schedule(&self, inner: &impl InnerSync) {
        if !self.auto_run_enabled.load(Ordering::Acquire) {
            return;
        }
        self.schedule(inner);
    }

    /// Runs maintenance, waiting for an in-flight run to finish first.
    /// Used by the explicit clean-up entry point.
    pub(crate) fn run_now(&self, inner: &impl InnerSync) {
        loop {
            match self.status() {
                DrainStatus::Idle | DrainStatus::Required => {
                    if self.try_acquire_and_run(inner) {
                        return;
                    }
                }
                DrainStatus::ProcessingToIdle | DrainStatus::ProcessingToRequired => {
                    std::thread::yield_now();
                }
            }
        }
    }

    fn schedule(&self, inner: &impl InnerSync) {
        loop {
            match self.status() {
                DrainStatus::Idle | DrainStatus::Required => {
                    if self.try_acquire_and_run(inner) {
                        return;
                    }
                }
                DrainStatus::ProcessingToIdle => {
                    // A run is in flight; ask it to go around once more.
                    if self.cas_status(
                        DrainStatus::ProcessingToIdle,
                        DrainStatus::ProcessingToRequired,
                    ) {
                        return;
                    }
                }
                DrainStatus::ProcessingToRequired => return,
            }
        }
    }

    /// Attempts to become the maintenance thread. Returns `false` when the
    /// status moved under us and the caller should re-examine it.
    fn try_acquire_and_run(&self, inner: &impl InnerSync) -> bool {
        let current = self.status();
        debug_assert!(matches!(
            current,
            DrainStatus::Idle | DrainStatus::Required
        ));
        if !self.cas_status(current, DrainStatus::ProcessingToIdle) {
            return false;
        }

        loop {
            inner.run_pending_tasks();
            let after = inner
                .now()
                .checked_add(MAINTENANCE_INTERVAL)
                .expect("timestamp overflow");
            self.run_after.set_instant(after);

            if self.cas_status(DrainStatus::ProcessingToIdle, DrainStatus::Idle) {
                return true;
            }
            // New work arrived while we were processing; run once more.
            debug_assert_eq!(self.status(), DrainStatus::ProcessingToRequired);
            self.drain_status
                .store(DrainStatus::ProcessingToIdle as u8, Ordering::Release);
        }
    }

    #[cfg(test)]
    pub(crate) fn disable_auto_run(&self) {
        self.auto_run_enabled.store(false, Ordering::Release);
    }
}
