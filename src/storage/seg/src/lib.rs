// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A concurrent, segment-structured in-memory key-value storage engine.
//!
//! Items are appended into large fixed-size segments. Segments holding items
//! with similar time-to-live are chained together per TTL bucket so that they
//! age together and can be expired eagerly. A lock-striped hash table with
//! packed 64-bit slots indexes items by key, and keeps an approximate access
//! frequency per item. When free segments run out, space is reclaimed either
//! by evicting a whole segment picked by a victim selection policy, or by
//! merging several mature segments into one while dropping cold items.
//!
//! Goals:
//! * many concurrent readers and writers without a global lock on the hot path
//! * eager expiration of items
//! * low metadata overhead
//!
//! Non-goals:
//! * variable segment sizes
//! * exact LRU/LFU ordering
//! * multi-key transactions
//!
//! ```
//! use seg::{Policy, Seg};
//!
//! let cache = Seg::builder()
//!     .heap_size(4 * 1024 * 1024)
//!     .segment_size(64 * 1024)
//!     .hash_power(16)
//!     .eviction(Policy::Random)
//!     .build()
//!     .expect("failed to create cache");
//!
//! cache.set(b"coffee", b"strong", None, 3600).expect("set failed");
//! let item = cache.get(b"coffee").expect("not found");
//! assert_eq!(item.value(), b"strong");
//! ```

// macro includes
#[macro_use]
extern crate log;

// NOTE: this represents the versioning of the internal data layout and must be
// incremented when breaking changes are made to the datastructures
const VERSION: u64 = 1;

// submodules
mod builder;
mod clock;
mod error;
mod eviction;
mod hashtable;
mod item;
mod merge;
mod metrics;
mod rand;
mod seg;
mod segments;
mod ttl_buckets;
mod util;

// tests
#[cfg(test)]
mod tests;

// publicly exported items from submodules
pub use crate::seg::Seg;
pub use builder::Builder;
pub use clock::{Clock, CoarseClock, ManualClock};
pub use error::SegError;
pub use eviction::{Policy, VictimSelector};
pub use item::{Item, ReservedItem};
pub use merge::MergeReport;
pub use segments::SegmentInfo;

// items from submodules which are imported for convenience to the crate level
pub(crate) use crate::rand::*;
pub(crate) use hashtable::*;
pub(crate) use item::*;
pub(crate) use metrics::*;
pub(crate) use segments::*;
pub(crate) use ttl_buckets::*;
pub(crate) use util::*;
