use std::time::Duration;

/// The boxed error type user supplied callbacks may return.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A contradiction in the builder configuration, reported by
/// [`CacheBuilder::try_build`][crate::CacheBuilder::try_build].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum BuildError {
    /// `max_weight` was set without a `weigher` to produce the weights.
    #[error("`max_weight` requires a `weigher` to be configured")]
    MissingWeigher,

    /// `max_capacity` bounds the cache by entry count; combining it with a
    /// `weigher` is ambiguous. Use `max_weight` instead.
    #[error("`weigher` cannot be combined with `max_capacity`; use `max_weight`")]
    WeigherWithMaxCapacity,

    /// `refresh_after_write` needs a `loader` to produce the new values.
    #[error("`refresh_after_write` requires a `loader` to be configured")]
    RefreshWithoutLoader,

    /// An expiration or refresh duration does not fit the internal
    /// nanosecond arithmetic.
    #[error("`{name}` is longer than 1000 years: {duration:?}")]
    DurationTooLong {
        name: &'static str,
        duration: Duration,
    },
}

/// A failure returned by a [`CacheWriter`][crate::CacheWriter] callback,
/// surfaced to the caller of the mutating operation.
///
/// State mutations that happened before the callback failed are not rolled
/// back.
#[derive(thiserror::Error, Debug)]
#[error("the cache writer failed during `{operation}`")]
pub struct WriterError {
    pub operation: &'static str,
    #[source]
    pub source: CallbackError,
}

impl WriterError {
    pub(crate) fn write(source: CallbackError) -> Self {
        Self {
            operation: "write",
            source,
        }
    }

    pub(crate) fn delete(source: CallbackError) -> Self {
        Self {
            operation: "delete",
            source,
        }
    }
}
