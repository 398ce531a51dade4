use std::{fmt, sync::Arc};

use once_cell::sync::Lazy;
use scheduled_thread_pool::ScheduledThreadPool;

/// A task handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

static SHARED_POOL: Lazy<Arc<ScheduledThreadPool>> = Lazy::new(|| {
    // Some platforms may report zero CPUs; use at least one worker.
    let num_threads = crate::common::available_parallelism();
    Arc::new(ScheduledThreadPool::with_name("lungo-worker-{}", num_threads))
});

/// Where the cache runs its asynchronous work: refresh reloads and queued
/// removal notifications.
///
/// The default is a process-wide thread pool shared by all caches. Tests
/// typically inject [`Executor::SameThread`] so that every task runs to
/// completion before the triggering call returns.
#[derive(Clone, Default)]
pub enum Executor {
    /// Runs each task inline on the thread that submitted it.
    SameThread,
    /// Runs tasks on the shared thread pool.
    #[default]
    ThreadPool,
    /// Hands each task to a caller supplied runner.
    Custom(Arc<dyn Fn(Task) + Send + Sync + 'static>),
}

impl Executor {
    pub(crate) fn run(&self, task: Task) {
        match self {
            Self::SameThread => task(),
            Self::ThreadPool => {
                SHARED_POOL.execute(move || task());
            }
            Self::Custom(runner) => runner(task),
        }
    }

    pub(crate) fn is_same_thread(&self) -> bool {
        matches!(self, Self::SameThread)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameThread => f.write_str("SameThread"),
            Self::ThreadPool => f.write_str("ThreadPool"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn same_thread_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        Executor::SameThread.run(Box::new(move || ran2.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn custom_receives_the_task() {
        let ran = Arc::new(AtomicBool::new(false));
        let executor = Executor::Custom(Arc::new(|task| task()));
        let ran2 = Arc::clone(&ran);
        executor.run(Box::new(move || ran2.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }
}
