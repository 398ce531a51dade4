use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use super::{EvictionListener, RemovalCause};
use crate::common::executor::Executor;

const CHANNEL_CAPACITY: usize = 1_024;
const MAX_NOTIFICATIONS_PER_TASK: usize = 5_000;

/// Delivers removal notifications to the user supplied listener.
///
/// With a same-thread executor the listener runs inline at the point the
/// removal is decided; otherwise notifications are queued and delivered in
/// batches on the executor, so the maintenance routine never blocks on user
/// code.
///
/// A listener that panics is disabled for the rest of the cache's life; the
/// panic is logged and never propagated into cache operations.
pub(crate) enum RemovalNotifier<K, V> {
    Blocking(BlockingRemovalNotifier<K, V>),
    Queued(QueuedRemovalNotifier<K, V>),
}

impl<K, V> RemovalNotifier<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(
        listener: EvictionListener<K, V>,
        executor: Executor,
        cache_name: Option<String>,
    ) -> Self {
        if executor.is_same_thread() {
            Self::Blocking(BlockingRemovalNotifier::new(listener, cache_name))
        } else {
            Self::Queued(QueuedRemovalNotifier::new(listener, executor, cache_name))
        }
    }

    pub(crate) fn notify(&self, key: Arc<K>, value: V, cause: RemovalCause) {
        match self {
            Self::Blocking(notifier) => notifier.notify(key, value, cause),
            Self::Queued(notifier) => notifier.enqueue(key, value, cause),
        }
    }
}

pub(crate) struct BlockingRemovalNotifier<K, V> {
    listener: EvictionListener<K, V>,
    is_enabled: AtomicBool,
    cache_name: Option<String>,
}

impl<K, V> BlockingRemovalNotifier<K, V> {
    fn new(listener: EvictionListener<K, V>, cache_name: Option<String>) -> Self {
        Self {
            listener,
            is_enabled: AtomicBool::new(true),
            cache_name,
        }
    }

    fn notify(&self, key: Arc<K>, value: V, cause: RemovalCause) {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        if !self.is_enabled.load(Ordering::Acquire) {
            return;
        }

        let listener_clo = || (self.listener)(key, value, cause);

        // Safety: the listener is never invoked again once it panicked, so
        // observing its broken state is not possible.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(listener_clo)) {
            self.is_enabled.store(false, Ordering::Release);
            log_listener_panic(&*payload, self.cache_name.as_deref());
        }
    }
}

struct RemovedEntry<K, V> {
    key: Arc<K>,
    value: V,
    cause: RemovalCause,
}

pub(crate) struct QueuedRemovalNotifier<K, V> {
    snd: Sender<RemovedEntry<K, V>>,
    state: Arc<NotifierState<K, V>>,
    executor: Executor,
}

impl<K, V> QueuedRemovalNotifier<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn new(listener: EvictionListener<K, V>, executor: Executor, cache_name: Option<String>) -> Self {
        let (snd, rcv) = crossbeam_channel::bounded(CHANNEL_CAPACITY);
        let state = Arc::new(NotifierState {
            task_lock: Mutex::new(()),
            rcv,
            listener,
            cache_name,
            is_enabled: AtomicBool::new(true),
            is_running: AtomicBool::new(false),
        });
        Self {
            snd,
            state,
            executor,
        }
    }

    fn enqueue(&self, key: Arc<K>, value: V, cause: RemovalCause) {
        if !self.state.is_enabled() {
            return;
        }

        let mut entry = RemovedEntry { key, value, cause };
        loop {
            match self.snd.try_send(entry) {
                Ok(()) => break,
                Err(TrySendError::Full(e)) => {
                    entry = e;
                    // Deliver a batch ourselves to make room.
                    self.submit_task();
                    std::thread::yield_now();
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        self.submit_task();
    }

    fn submit_task(&self) {
        let state = &self.state;
        if state.is_running() || !state.is_enabled() {
            return;
        }
        state.set_running(true);

        let state = Arc::clone(state);
        self.executor.run(Box::new(move || {
            state.deliver_batch();
            state.set_running(false);
        }));
    }
}

struct NotifierState<K, V> {
    task_lock: Mutex<()>,
    rcv: Receiver<RemovedEntry<K, V>>,
    listener: EvictionListener<K, V>,
    cache_name: Option<String>,
    is_enabled: AtomicBool,
    is_running: AtomicBool,
}

impl<K, V> NotifierState<K, V> {
    fn is_enabled(&self) -> bool {
        self.is_enabled.load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    fn set_running(&self, value: bool) {
        self.is_running.store(value, Ordering::Release);
    }

    fn deliver_batch(&self) {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        // Only one delivery task runs at a time.
        let _task_lock = self.task_lock.lock();

        let mut count = 0;
        while let Ok(entry) = self.rcv.try_recv() {
            let RemovedEntry { key, value, cause } = entry;
            let listener_clo = || (self.listener)(key, value, cause);

            // Safety: the listener is never invoked again once it panicked.
            if let Err(payload) = catch_unwind(AssertUnwindSafe(listener_clo)) {
                self.is_enabled.store(false, Ordering::Release);
                log_listener_panic(&*payload, self.cache_name.as_deref());
                return;
            }

            count += 1;
            if count > MAX_NOTIFICATIONS_PER_TASK {
                break;
            }
        }
    }
}

#[allow(unused_variables)]
fn log_listener_panic(payload: &(dyn std::any::Any + Send + 'static), cache_name: Option<&str>) {
    #[cfg(feature = "logging")]
    {
        let message: Option<std::borrow::Cow<'_, str>> =
            (payload.downcast_ref::<&str>().map(|s| (*s).into()))
                .or_else(|| payload.downcast_ref::<String>().map(Into::into));

        let cn = cache_name
            .map(|name| format!("[{name}] "))
            .unwrap_or_default();

        if let Some(m) = message {
            log::error!("{cn}Disabled the eviction listener because it panicked at '{m}'");
        } else {
            log::error!("{cn}Disabled the eviction listener because it panicked");
        }
    }
}
