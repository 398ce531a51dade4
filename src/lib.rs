#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! `lungo` is a concurrent, bounded, in-process cache for Rust.
//!
//! The cache keeps its hit ratio close to an optimal policy under bursty
//! workloads by combining a small recency window with a frequency-filtered
//! main area (the Window-TinyLFU policy), while keeping reads and writes on
//! lock-free paths:
//!
//! - Reads and writes are recorded into lossy/lossless buffers and applied in
//!   batches by a maintenance routine, so the hot paths never serialize on the
//!   policy structures.
//! - Admission and eviction are driven by a 4-bit CountMin sketch with
//!   periodic aging.
//! - Expiration supports a time-to-live, a time-to-idle, and per-entry
//!   variable durations backed by a hierarchical timer wheel, all in
//!   amortized constant time.
//!
//! # Example
//!
//! ```rust
//! use lungo::Cache;
//!
//! let cache = Cache::new(10_000);
//! cache.insert("key", "value").unwrap();
//! assert_eq!(cache.get(&"key"), Some("value"));
//! cache.invalidate(&"key").unwrap();
//! assert_eq!(cache.get(&"key"), None);
//! ```
//!
//! See [`CacheBuilder`][builder::CacheBuilder] for the configuration knobs:
//! size bounds (by entry count or by weight), expiration policies,
//! asynchronous refresh, removal listeners, a write-through cache writer and
//! statistics.

pub(crate) mod base_cache;
pub mod builder;
pub mod cache;
pub(crate) mod common;
pub mod error;
pub mod loader;
pub mod notification;
pub mod policy;
pub mod stats;
pub mod writer;

pub use crate::{
    builder::CacheBuilder,
    cache::Cache,
    common::executor::{Executor, Task},
    error::{BuildError, WriterError},
    loader::CacheLoader,
    notification::RemovalCause,
    policy::{Expiry, Policy},
    stats::CacheStats,
    writer::CacheWriter,
};
