//! Cache statistics.
//!
//! Enable collection with
//! [`CacheBuilder::record_stats`][crate::CacheBuilder::record_stats], or
//! supply your own [`StatsCounter`] through
//! [`CacheBuilder::stats_counter`][crate::CacheBuilder::stats_counter].
//! [`Cache::stats`][crate::Cache::stats] returns a [`CacheStats`]
//! snapshot.

mod cache_stats;
mod stats_counter;

pub use cache_stats::CacheStats;
pub use stats_counter::{
    DefaultStatsCounter, DisabledStatsCounter, StatsCounter, StripedStatsCounter,
};
