// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

use crate::clock::Clock;
use crate::eviction::Eviction;
use crate::merge::{Merge, MergeReport};

use core::cmp::Ordering as Compare;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::collections::HashSet;
use std::sync::Arc;

// upper bound on victim selections per segment request
const MAX_EVICT_ATTEMPTS: usize = 8;

// upper bound on merge rounds per segment request
const MAX_MERGE_ATTEMPTS: usize = 8;

// upper bound on tail segment changes while reserving one item
const MAX_RESERVE_ATTEMPTS: usize = 16;

// flush watermark before the first flush
const NEVER_FLUSHED: u64 = u64::MAX;

/// Why a segment is being reclaimed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reclaim {
    Expire,
    Evict,
}

/// `Seg` is the main datastructure. It is a pre-allocated key-value store
/// with eager expiration and segment-level eviction, safe for concurrent use
/// from many threads through a shared reference.
///
/// [`Item`] and [`ReservedItem`] handles pin the segment they point into. A
/// thread must not hold a handle while calling [`Seg::reserve`],
/// [`Seg::set`], [`Seg::expire`] or [`Seg::merge_once`]: reclaiming the
/// pinned segment would wait on the handle forever.
pub struct Seg {
    pub(crate) hashtable: HashTable,
    pub(crate) segments: Segments,
    pub(crate) ttl_buckets: TtlBuckets,
    eviction: Eviction,
    merge: Merge,
    clock: Arc<dyn Clock>,
    // last version handed out to a reservation, wraps around
    pub(crate) version: AtomicU32,
    // time of the last flush in the upper 32 bits, and the last version
    // handed out before it in the lower 32 bits
    flush_at: AtomicU64,
}

impl Seg {
    pub(crate) fn new(
        hashtable: HashTable,
        segments: Segments,
        eviction: Eviction,
        merge: Merge,
        clock: Arc<dyn Clock>,
    ) -> Self {
        SEGMENT_CURRENT.set(segments.count() as i64);
        SEGMENT_FREE.set(segments.free_count() as i64);

        Self {
            hashtable,
            segments,
            ttl_buckets: TtlBuckets::new(),
            eviction,
            merge,
            clock,
            version: AtomicU32::new(0),
            flush_at: AtomicU64::new(NEVER_FLUSHED),
        }
    }

    /// Returns a new [`Builder`] which is used to configure and construct a
    /// `Seg` instance.
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now()
    }

    /// Returns true if the item was created at or before the last flush.
    /// Items from an earlier second are compared by time. Within the second
    /// of the flush, versions are compared in serial number order so that
    /// the wrapping version counter never hides newer items.
    pub(crate) fn is_flushed(&self, item: &RawItem) -> bool {
        let flush_at = self.flush_at.load(Ordering::Acquire);
        if flush_at == NEVER_FLUSHED {
            return false;
        }
        let time = (flush_at >> 32) as u32;
        let version = flush_at as u32;

        match item.create_at().cmp(&time) {
            Compare::Less => true,
            Compare::Greater => false,
            Compare::Equal => item.cas().wrapping_sub(version) as i32 <= 0,
        }
    }

    /// An item is visible if its segment has not outlived its TTL and the item
    /// was written after the last flush.
    fn is_visible(&self, seg_id: u32, item: &RawItem, now: u32) -> bool {
        !self.segments.header(seg_id).is_expired(now) && !self.is_flushed(item)
    }

    /// Get the item with the provided key.
    pub fn get(&self, key: &[u8]) -> Option<Item<'_>> {
        let now = self.now();
        let (raw, guard) = self.hashtable.get(key, now, &self.segments)?;
        if !self.is_visible(guard.header().id(), &raw, now) {
            return None;
        }
        Some(Item::new(raw, guard))
    }

    /// Reserve space for an item in the tail segment of the TTL bucket for
    /// `ttl`. The returned handle holds a zeroed value of `value_len` bytes
    /// and optional metadata of `optional_len` bytes, to be filled in before
    /// calling [`Seg::insert`] or [`Seg::cas`].
    pub fn reserve(
        &self,
        key: &[u8],
        value_len: usize,
        optional_len: usize,
        ttl: u32,
    ) -> Result<ReservedItem<'_>, SegError> {
        if key.is_empty() || key.len() > u8::MAX as usize {
            return Err(SegError::KeyLength);
        }

        let size = match checked_item_size(key.len(), value_len, optional_len) {
            Some(size) if size <= self.segments.segment_size() as usize => size,
            size => {
                ITEM_ALLOCATE_EX.increment();
                return Err(SegError::ItemOversized {
                    size: size.unwrap_or(usize::MAX),
                });
            }
        };

        let bucket = self.ttl_buckets.for_ttl(ttl);

        let outcome = retry(MAX_RESERVE_ATTEMPTS, |_| {
            let now = self.now();
            let tail = bucket.last();

            if let Some(reserved) = tail.and_then(|id| {
                self.try_append(bucket, id, key, size, value_len, optional_len, now)
            }) {
                return Attempt::Done(Ok(reserved));
            }

            // the tail is full, expired, or missing
            let id = match self.get_new_seg() {
                Some(id) => id,
                None => return Attempt::Done(Err(SegError::NoFreeSegments)),
            };
            self.segments.init(id, bucket.ttl(), now);

            let mut arena = self.segments.lock();
            if bucket.last() == tail {
                self.ttl_buckets.link_tail(&self.segments, bucket, id, &arena);
                self.segments.header(id).set_evictable(true);
                trace!("segment {} is the new tail of ttl bucket {}", id, bucket.ttl());
            } else {
                // another writer already replaced the tail
                self.segments.push_free(&mut arena, id);
            }
            Attempt::Retry
        });

        match outcome {
            Outcome::Success(result) => result,
            Outcome::Contended | Outcome::Exhausted => Err(SegError::NoFreeSegments),
        }
        .map_err(|e| {
            ITEM_ALLOCATE_EX.increment();
            e
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn try_append<'a>(
        &'a self,
        bucket: &TtlBucket,
        id: u32,
        key: &[u8],
        size: usize,
        value_len: usize,
        optional_len: usize,
        now: u32,
    ) -> Option<ReservedItem<'a>> {
        let guard = self.segments.write_ref(id)?;
        let header = guard.header();

        // the segment may have been reclaimed and reused since it was read
        // as the tail
        if bucket.last() != Some(id) || header.is_expired(now) {
            return None;
        }

        let offset = header.reserve_space(size as u32, self.segments.segment_size())?;
        let cas = self.version.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let raw = self.segments.item(id, offset);
        raw.define(
            key,
            value_len,
            optional_len,
            now,
            header.create_at().saturating_add(header.ttl()),
            cas,
        );
        header.add_item(size);
        ITEM_ALLOCATE.increment();

        Some(ReservedItem::new(raw, id, offset, guard))
    }

    /// Link a reserved item into the hash table, replacing any prior value for
    /// its key.
    pub fn insert(&self, mut item: ReservedItem<'_>) -> Result<(), SegError> {
        self.hashtable
            .insert(item.key(), item.seg_id(), item.offset(), &self.segments)?;
        item.set_linked();
        Ok(())
    }

    /// Link a reserved item only if the current item for its key has version
    /// `expected`. Returns `NotFound` if the key has no visible item and
    /// `Exists` if the version differs. The reserved item is dropped on
    /// failure.
    pub fn cas(&self, mut item: ReservedItem<'_>, expected: u32) -> Result<(), SegError> {
        let now = self.now();
        self.hashtable.compare_and_insert(
            item.key(),
            item.seg_id(),
            item.offset(),
            expected,
            &self.segments,
            |seg_id, current| self.is_visible(seg_id, current, now),
        )?;
        item.set_linked();
        Ok(())
    }

    /// Store a key and value, with optional metadata, replacing any prior
    /// value for the key.
    pub fn set(
        &self,
        key: &[u8],
        value: &[u8],
        optional: Option<&[u8]>,
        ttl: u32,
    ) -> Result<(), SegError> {
        let optional = optional.unwrap_or(&[]);
        let mut reserved = self.reserve(key, value.len(), optional.len(), ttl)?;
        reserved.value_mut().copy_from_slice(value);
        reserved.optional_mut().copy_from_slice(optional);
        self.insert(reserved)
    }

    /// Remove the item with the given key, returns a bool indicating if it was
    /// removed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let removed = self.hashtable.delete(key, &self.segments);
        if removed {
            ITEM_DELETE.increment();
        }
        removed
    }

    /// Logically invalidate every item stored so far. Space is reclaimed
    /// later by expiration, eviction or merging.
    pub fn flush_all(&self) {
        let now = self.now();
        let version = self.version.load(Ordering::Acquire);
        let flush_at = ((now as u64) << 32) | version as u64;

        // a concurrent flush with a later watermark wins
        let _ = self
            .flush_at
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == NEVER_FLUSHED || flush_at > current {
                    Some(flush_at)
                } else {
                    None
                }
            });
        info!("flushed all items up to time {} version {}", now, version);
    }

    /// Loops through the TTL buckets to handle eager expiration, returns the
    /// number of segments expired.
    pub fn expire(&self) -> usize {
        let now = self.now();
        let mut expired = 0;

        for bucket in self.ttl_buckets.iter() {
            // segments within a bucket expire in order, so only heads need
            // to be checked
            while let Some(id) = bucket.first() {
                if !self.segments.header(id).is_expired(now) {
                    break;
                }
                if !self.reclaim(id, Reclaim::Expire) {
                    break;
                }
                let mut arena = self.segments.lock();
                self.segments.push_free(&mut arena, id);
                expired += 1;
            }
        }

        if expired > 0 {
            debug!("expired {} segments", expired);
        }
        expired
    }

    /// Run one compaction round, regardless of how many free segments are
    /// available. Returns `None` if nothing could be merged.
    pub fn merge_once(&self) -> Option<MergeReport> {
        self.merge.run(self)
    }

    /// Gets a count of live items, summed across all segments.
    pub fn items(&self) -> usize {
        self.segments
            .headers()
            .iter()
            .map(|h| h.n_item().max(0) as usize)
            .sum()
    }

    /// Occupied hash table slots and buckets in use, including chained
    /// overflow buckets.
    pub fn hash_stats(&self) -> (usize, usize) {
        let stats = self.hashtable.stats();
        (stats.items, stats.buckets)
    }

    /// Number of segments in the free pool.
    pub fn free_segments(&self) -> usize {
        self.segments.free_count() as usize
    }

    /// Total number of segments in the arena.
    pub fn segment_count(&self) -> usize {
        self.segments.count()
    }

    /// A snapshot of one segment's header.
    pub fn segment_info(&self, id: u32) -> Option<SegmentInfo> {
        self.segments.headers().get(id as usize).map(|h| h.info())
    }

    /// Checks that every TTL chain is consistently doubly linked and that
    /// every segment is in exactly one of the free pool or one chain.
    /// *NOTE*: this operation locks the arena and walks every segment.
    pub fn check_integrity(&self) -> bool {
        let arena = self.segments.lock();

        let linked = match self.ttl_buckets.verify(&self.segments, &arena) {
            Some(linked) => linked,
            None => return false,
        };
        let free = self.segments.free_list(&arena);

        let mut seen = HashSet::with_capacity(self.segments.count());
        for id in linked.iter().chain(free.iter()) {
            if !seen.insert(*id) {
                error!("segment {} is linked more than once", id);
                return false;
            }
        }

        // segments which are being reclaimed or used as merge destinations
        // are briefly in neither
        let detached = self.segments.count() - seen.len();
        if detached > 0 {
            debug!("{} segments are detached", detached);
        }

        let segment_size = self.segments.segment_size();
        for header in self.segments.headers() {
            if header.write_offset() > segment_size || header.occupied() > segment_size as i64 {
                error!("segment {} overflows: {:?}", header.id(), header.info());
                return false;
            }
        }

        free.len() == self.segments.free_count() as usize
    }

    /// The per-bucket version counter for the hash bucket of a key. It changes
    /// with every insert and delete in the bucket.
    pub fn bucket_cas(&self, key: &[u8]) -> u32 {
        self.hashtable.bucket_cas(key)
    }

    /// Flush the datapool to its backing storage, if any.
    pub fn flush_datapool(&self) -> Result<(), SegError> {
        self.segments.flush()?;
        Ok(())
    }

    /// Get a segment for writes, from the free pool or by reclaiming space.
    /// The segment is detached from any chain when returned.
    pub(crate) fn get_new_seg(&self) -> Option<u32> {
        SEGMENT_REQUEST.increment();

        let id = if self.eviction.merge().is_some() {
            match retry(MAX_MERGE_ATTEMPTS, |_| {
                if let Some(id) = self.take_free(false) {
                    return Attempt::Done(id);
                }
                if self.merge.make_room(self) {
                    Attempt::Retry
                } else {
                    Attempt::GiveUp
                }
            }) {
                Outcome::Success(id) => Some(id),
                Outcome::Contended | Outcome::Exhausted => None,
            }
        } else {
            self.take_free(true).or_else(|| self.evict())
        };

        match id {
            Some(id) => {
                SEGMENT_REQUEST_SUCCESS.increment();
                trace!("allocated segment {}", id);
            }
            None => {
                SEGMENT_REQUEST_FAILURE.increment();
                warn!("unable to get a new segment");
            }
        }
        id
    }

    pub(crate) fn take_free(&self, use_reserved: bool) -> Option<u32> {
        let mut arena = self.segments.lock();
        self.segments.take_free(&mut arena, use_reserved)
    }

    /// Pick victims with the configured policy until one is reclaimed.
    fn evict(&self) -> Option<u32> {
        let outcome = retry(MAX_EVICT_ATTEMPTS, |_| match self.eviction.select(&self.segments) {
            Some(id) => {
                if self.reclaim(id, Reclaim::Evict) {
                    Attempt::Done(id)
                } else {
                    Attempt::Retry
                }
            }
            None => Attempt::GiveUp,
        });

        match outcome {
            Outcome::Success(id) => {
                debug!("evicted segment {} with {:?}", id, self.eviction.policy());
                Some(id)
            }
            Outcome::Exhausted => {
                warn!("unable to evict: no segment can be evicted");
                None
            }
            Outcome::Contended => {
                error!("unable to evict after {} attempts", MAX_EVICT_ATTEMPTS);
                None
            }
        }
    }

    /// Remove every item in a segment from the hash table and detach it from
    /// its TTL bucket. Returns false if another thread owns the segment. On
    /// success the caller owns the segment and must either reuse it or return
    /// it to the free pool.
    pub(crate) fn reclaim(&self, id: u32, reason: Reclaim) -> bool {
        let header = self.segments.header(id);

        if !header.try_claim() {
            if reason == Reclaim::Expire {
                debug!("segment {} is already being reclaimed", id);
            }
            SEGMENT_EVICT_EX.increment();
            return false;
        }

        // the segment was picked without a lock, it may have become the tail
        // of a chain since
        if reason == Reclaim::Evict && header.next().is_none() {
            header.set_evictable(true);
            SEGMENT_EVICT_EX.increment();
            return false;
        }

        // block new readers and writers
        header.set_accessible(false);

        {
            let arena = self.segments.lock();
            self.ttl_buckets.unlink(&self.segments, id, &arena);
        }

        self.scrub(id);

        // entries are removed before waiting so that a slow reader does not
        // hold up the scan. a writer which inserted during the scan is caught
        // by a single rescan.
        self.segments.wait_refcount(id);
        if header.n_item() > 0 {
            SEGMENT_EVICT_RETRY.increment();
            self.scrub(id);
        }

        if header.n_item() != 0 {
            warn!(
                "reclaimed segment {} but {} items left, {} hash table entries",
                id,
                header.n_item(),
                self.hashtable.entries_in_segment(id)
            );
        }

        match reason {
            Reclaim::Expire => SEGMENT_EXPIRE.increment(),
            Reclaim::Evict => SEGMENT_EVICT.increment(),
        };
        debug!("reclaimed segment {} ({:?})", id, reason);
        true
    }

    /// Remove the hash table entries for every live item in a segment.
    pub(crate) fn scrub(&self, id: u32) {
        for (offset, item) in self.segments.items(id) {
            if item.is_deleted() {
                continue;
            }
            if self.hashtable.evict(item.key(), id, offset, &self.segments) {
                ITEM_EVICT.increment();
            }
        }
    }
}
