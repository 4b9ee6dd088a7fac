// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A builder for configuring a new [`Seg`] instance.

use crate::*;

use crate::clock::{Clock, CoarseClock};
use crate::eviction::{Eviction, Policy, N_MAX_SEG_MERGE};
use crate::merge::Merge;

use config::SegConfig;
use datatier::{Datapool, Memory, MmapFile};

use std::path::{Path, PathBuf};
use std::sync::Arc;

// merge parameters used when the policy is not `Merge`, for explicit
// compaction through `Seg::merge_once`
const DEFAULT_MERGE: usize = 4;

/// A builder that is used to construct a new [`Seg`] instance.
pub struct Builder {
    hash_power: u8,
    overflow_factor: f64,
    segment_size: i32,
    heap_size: usize,
    eviction: Policy,
    datapool_path: Option<PathBuf>,
    prefault: bool,
    reserved_segments: usize,
    clock: Option<Arc<dyn Clock>>,
}

// Defines the default parameters
impl Default for Builder {
    fn default() -> Self {
        Self {
            hash_power: 16,
            overflow_factor: 0.0,
            segment_size: 1024 * 1024,
            heap_size: 64 * 1024 * 1024,
            eviction: Policy::Random,
            datapool_path: None,
            prefault: false,
            reserved_segments: 0,
            clock: None,
        }
    }
}

impl Builder {
    /// Start from the values in a configuration file.
    pub fn from_config<T: SegConfig>(config: &T) -> Self {
        let config = config.seg();

        let eviction = match config.eviction() {
            config::Eviction::None => Policy::None,
            config::Eviction::Random => Policy::Random,
            config::Eviction::Fifo => Policy::Fifo,
            config::Eviction::Cte => Policy::Cte,
            config::Eviction::Util => Policy::Util,
            config::Eviction::Merge => Policy::Merge {
                max: config.merge_max(),
                merge: config.merge_target(),
            },
        };

        let mut builder = Self::default()
            .heap_size(config.heap_size())
            .segment_size(config.segment_size())
            .hash_power(config.hash_power())
            .overflow_factor(config.overflow_factor())
            .eviction(eviction)
            .prefault(config.datapool_prefault())
            .reserved_segments(config.reserved_segments());

        if let Some(path) = config.datapool_path() {
            builder = builder.datapool_path(Some(path));
        }

        builder
    }

    /// Specify the hash power, which limits the size of the hashtable to 2^N
    /// entries. 1/8th of these are used for metadata storage, meaning that the
    /// total number of items which can be held in the cache is limited to
    /// `7 * 2^(N - 3)` items. If the overflow factor is greater than zero,
    /// additional buckets are allocated for chaining.
    ///
    /// For example, with `hash_power` of 16, 2^16 = 65536 hashtable entries
    /// are allocated, 57344 of which can hold items.
    ///
    /// ```
    /// use seg::Seg;
    ///
    /// // create a cache with a small hashtable that has room for ~114k items
    /// // without using any overflow buckets.
    /// let cache = Seg::builder().hash_power(17).build();
    /// ```
    pub fn hash_power(mut self, hash_power: u8) -> Self {
        self.hash_power = hash_power;
        self
    }

    /// Specify an overflow factor which is used to scale the hashtable and
    /// provide additional capacity for chaining item buckets. A factor of 1.0
    /// doubles the number of buckets. Once the overflow buckets are used up,
    /// inserts into a full bucket fail.
    ///
    /// ```
    /// use seg::Seg;
    ///
    /// // allow up to twice as many items to be indexed
    /// let cache = Seg::builder().hash_power(17).overflow_factor(1.0).build();
    /// ```
    pub fn overflow_factor(mut self, percent: f64) -> Self {
        self.overflow_factor = percent;
        self
    }

    /// Specify the segment size in bytes. Items are appended into segments,
    /// so this is also the largest item size. Must be a multiple of 8 and
    /// no larger than 8MB.
    ///
    /// ```
    /// use seg::Seg;
    ///
    /// // each segment will be 1MB
    /// let cache = Seg::builder().segment_size(1024 * 1024).build();
    /// ```
    pub fn segment_size(mut self, bytes: i32) -> Self {
        self.segment_size = bytes;
        self
    }

    /// Specify the total heap size in bytes. The heap is divided into
    /// segments, and any remainder smaller than one segment is left unused.
    ///
    /// ```
    /// use seg::Seg;
    ///
    /// const MB: usize = 1024 * 1024;
    ///
    /// // 4MB heap with 1MB segments gives four segments
    /// let cache = Seg::builder()
    ///     .segment_size(MB as i32)
    ///     .heap_size(4 * MB)
    ///     .build()
    ///     .expect("failed to create cache");
    /// assert_eq!(cache.segment_count(), 4);
    /// ```
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.heap_size = bytes;
        self
    }

    /// Specify how segments are reclaimed once none are free. See [`Policy`].
    ///
    /// ```
    /// use seg::{Policy, Seg};
    ///
    /// let cache = Seg::builder()
    ///     .eviction(Policy::Merge { max: 8, merge: 4 })
    ///     .build();
    /// ```
    pub fn eviction(mut self, policy: Policy) -> Self {
        self.eviction = policy;
        self
    }

    /// Back the heap with a file at the given path instead of anonymous
    /// memory. The file must not already exist.
    pub fn datapool_path<T: AsRef<Path>>(mut self, path: Option<T>) -> Self {
        self.datapool_path = path.map(|p| p.as_ref().to_owned());
        self
    }

    /// Fault in every page of the heap while building.
    pub fn prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }

    /// Number of free segments held back from ordinary writers. Compaction
    /// always keeps at least one, so it can obtain a destination segment.
    pub fn reserved_segments(mut self, count: usize) -> Self {
        self.reserved_segments = count;
        self
    }

    /// Use the provided clock as the time source.
    ///
    /// ```
    /// use seg::{ManualClock, Seg};
    /// use std::sync::Arc;
    ///
    /// let clock = Arc::new(ManualClock::new(0));
    /// let cache = Seg::builder()
    ///     .heap_size(1024 * 1024)
    ///     .segment_size(64 * 1024)
    ///     .clock(clock.clone())
    ///     .build()
    ///     .expect("failed to create cache");
    ///
    /// cache.set(b"k", b"v", None, 10).expect("set failed");
    /// clock.advance(20);
    /// assert!(cache.get(b"k").is_none());
    /// ```
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Consumes the builder and returns a fully-allocated `Seg` instance.
    pub fn build(self) -> Result<Seg, SegError> {
        if self.segment_size <= 0 {
            return Err(SegError::Config("segment size must be positive"));
        }
        let segment_size = self.segment_size as usize;

        let eviction = Eviction::new(self.eviction)?;

        let (merge, reserved) = match eviction.merge() {
            Some((max, merge)) => (Merge::new(max, merge), self.reserved_segments.max(1)),
            None => (
                Merge::new(N_MAX_SEG_MERGE, DEFAULT_MERGE),
                self.reserved_segments,
            ),
        };

        let hashtable = HashTable::new(self.hash_power, self.overflow_factor)?;

        // only whole segments are mapped
        let heap_size = (self.heap_size / segment_size) * segment_size;
        if heap_size == 0 {
            return Err(SegError::Config("heap is smaller than one segment"));
        }

        let datapool: Box<dyn Datapool> = match self.datapool_path {
            Some(path) => Box::new(MmapFile::create(path, heap_size, VERSION)?),
            None => Box::new(Memory::create(heap_size, self.prefault)?),
        };

        let segments = Segments::new(datapool, segment_size, reserved)?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(CoarseClock::new()));

        Ok(Seg::new(hashtable, segments, eviction, merge, clock))
    }
}
