use std::{
    sync::Arc,
    time::{Duration, Instant as StdInstant},
};

#[cfg(test)]
use parking_lot::RwLock;

use super::Instant;

/// A caller supplied time source, returning nanoseconds from an arbitrary
/// but fixed origin.
pub(crate) type Ticker = Arc<dyn Fn() -> u64 + Send + Sync + 'static>;

/// The cache's source of time.
///
/// `now` returns an [`Instant`], which counts nanoseconds since the clock
/// was created. Keeping timestamps relative to the clock keeps them in a
/// `u64` and makes a mocked or caller supplied source interchangeable with
/// the standard one.
#[derive(Clone)]
pub(crate) struct Clock {
    ty: ClockType,
    /// The wall clock time when this `Clock` was created. Used to convert an
    /// `Instant` into a `std::time::Instant` for user visible callbacks.
    origin_std: StdInstant,
}

#[derive(Clone)]
enum ClockType {
    /// Uses `std::time::Instant` as the source of time.
    Standard { origin: StdInstant },
    #[cfg(feature = "quanta")]
    /// Uses `std::time::Instant` for `now` and `quanta::Instant` for
    /// `fast_now`.
    Hybrid {
        origin: StdInstant,
        quanta_origin: quanta::Instant,
    },
    /// Uses a caller supplied nanosecond ticker. The first observed tick is
    /// the origin.
    Ticker { ticker: Ticker, origin_tick: u64 },
    #[cfg(test)]
    /// Uses a mocked source of time.
    Mocked { mock: Arc<Mock> },
}

impl Default for Clock {
    fn default() -> Self {
        #[cfg(feature = "quanta")]
        let ty = ClockType::Hybrid {
            origin: StdInstant::now(),
            quanta_origin: quanta::Instant::now(),
        };
        #[cfg(not(feature = "quanta"))]
        let ty = ClockType::Standard {
            origin: StdInstant::now(),
        };

        Self {
            ty,
            origin_std: StdInstant::now(),
        }
    }
}

impl Clock {
    pub(crate) fn with_ticker(ticker: Ticker) -> Clock {
        let origin_tick = ticker();
        Clock {
            ty: ClockType::Ticker {
                ticker,
                origin_tick,
            },
            origin_std: StdInstant::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn mock() -> (Clock, Arc<Mock>) {
        let mock = Arc::new(Mock::default());
        let clock = Clock {
            ty: ClockType::Mocked {
                mock: Arc::clone(&mock),
            },
            origin_std: StdInstant::now(),
        };
        (clock, mock)
    }

    /// Returns the current time as nanoseconds since this clock was created.
    pub(crate) fn now(&self) -> Instant {
        match &self.ty {
            ClockType::Standard { origin } => {
                Instant::from_duration_since_clock_start(origin.elapsed())
            }
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { origin, .. } => {
                Instant::from_duration_since_clock_start(origin.elapsed())
            }
            ClockType::Ticker {
                ticker,
                origin_tick,
            } => Instant::from_nanos(ticker().saturating_sub(*origin_tick)),
            #[cfg(test)]
            ClockType::Mocked { mock } => Instant::from_duration_since_clock_start(mock.elapsed()),
        }
    }

    /// Returns the current time, possibly from a faster but less precise
    /// source. Suitable for measuring the latency of user supplied loaders.
    pub(crate) fn fast_now(&self) -> Instant {
        match &self.ty {
            #[cfg(feature = "quanta")]
            ClockType::Hybrid { quanta_origin, .. } => {
                Instant::from_duration_since_clock_start(quanta_origin.elapsed())
            }
            _ => self.now(),
        }
    }

    /// Converts an `Instant` produced by this clock into a
    /// `std::time::Instant` for user visible callbacks.
    pub(crate) fn to_std_instant(&self, instant: Instant) -> StdInstant {
        self.origin_std + Duration::from_nanos(instant.as_nanos())
    }
}

#[cfg(test)]
pub(crate) struct Mock {
    now: RwLock<Duration>,
}

#[cfg(test)]
impl Default for Mock {
    fn default() -> Self {
        Self {
            now: RwLock::new(Duration::ZERO),
        }
    }
}

#[cfg(test)]
impl Mock {
    pub(crate) fn increment(&self, amount: Duration) {
        *self.now.write() += amount;
    }

    pub(crate) fn elapsed(&self) -> Duration {
        *self.now.read()
    }
}
