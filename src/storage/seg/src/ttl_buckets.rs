// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! TTL buckets group segments whose items expire around the same time. The
//! TTL space is split into four ranges, each holding 256 buckets, with the
//! width of a bucket growing by 16x from one range to the next:
//!
//! ```text
//! range   ttl (seconds)          bucket width   buckets
//! 1       [0, 2048)              8s             0..=255
//! 2       [2048, 32768)          128s           256..=511
//! 3       [32768, 524288)        2048s          512..=767
//! 4       [524288, 8388608)      32768s         768..=1023
//! ```
//!
//! Each bucket owns a doubly linked chain of segments, oldest first. New
//! items are appended to the tail segment.
//!
//! Chain links of every bucket are edited only under the single arena lock.
//! The bucket's own mutex is *not* taken for chain edits: `link_tail`,
//! `unlink` and `replace` rely on the arena lock alone. The bucket mutex only
//! serializes compaction within the bucket and protects the merge cursor.

use crate::*;

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use parking_lot::{Mutex, MutexGuard};

const N_BUCKET_PER_STEP_N_BIT: usize = 8;
const N_BUCKET_PER_STEP: usize = 1 << N_BUCKET_PER_STEP_N_BIT;

const TTL_BUCKET_INTERVAL_N_BIT_1: usize = 3;
const TTL_BUCKET_INTERVAL_N_BIT_2: usize = 7;
const TTL_BUCKET_INTERVAL_N_BIT_3: usize = 11;
const TTL_BUCKET_INTERVAL_N_BIT_4: usize = 15;

const TTL_BUCKET_INTERVAL_1: usize = 1 << TTL_BUCKET_INTERVAL_N_BIT_1;
const TTL_BUCKET_INTERVAL_2: usize = 1 << TTL_BUCKET_INTERVAL_N_BIT_2;
const TTL_BUCKET_INTERVAL_3: usize = 1 << TTL_BUCKET_INTERVAL_N_BIT_3;
const TTL_BUCKET_INTERVAL_4: usize = 1 << TTL_BUCKET_INTERVAL_N_BIT_4;

const TTL_BOUNDARY_1: u32 = 1 << (TTL_BUCKET_INTERVAL_N_BIT_1 + N_BUCKET_PER_STEP_N_BIT);
const TTL_BOUNDARY_2: u32 = 1 << (TTL_BUCKET_INTERVAL_N_BIT_2 + N_BUCKET_PER_STEP_N_BIT);
const TTL_BOUNDARY_3: u32 = 1 << (TTL_BUCKET_INTERVAL_N_BIT_3 + N_BUCKET_PER_STEP_N_BIT);
const TTL_BOUNDARY_4: u32 = 1 << (TTL_BUCKET_INTERVAL_N_BIT_4 + N_BUCKET_PER_STEP_N_BIT);

pub(crate) const MAX_N_TTL_BUCKET: usize = N_BUCKET_PER_STEP * 4;
pub(crate) const MAX_TTL_BUCKET_IDX: usize = MAX_N_TTL_BUCKET - 1;

/// Largest TTL that is bucketed by value. Zero and anything larger land in
/// the last bucket.
pub(crate) const MAX_TTL: u32 = TTL_BOUNDARY_4 - 1;

pub(crate) struct TtlBucket {
    ttl: u32,
    first: AtomicI32,
    last: AtomicI32,
    nseg: AtomicU32,
    next_to_merge: AtomicI32,
    lock: Mutex<()>,
}

impl TtlBucket {
    fn new(ttl: u32) -> Self {
        Self {
            ttl,
            first: AtomicI32::new(NO_SEG),
            last: AtomicI32::new(NO_SEG),
            nseg: AtomicU32::new(0),
            next_to_merge: AtomicI32::new(NO_SEG),
            lock: Mutex::new(()),
        }
    }

    /// The TTL assigned to segments in this bucket.
    pub(crate) fn ttl(&self) -> u32 {
        self.ttl
    }

    pub(crate) fn first(&self) -> Option<u32> {
        to_id(self.first.load(Ordering::Acquire))
    }

    pub(crate) fn last(&self) -> Option<u32> {
        to_id(self.last.load(Ordering::Acquire))
    }

    pub(crate) fn nseg(&self) -> u32 {
        self.nseg.load(Ordering::Acquire)
    }

    pub(crate) fn next_to_merge(&self) -> Option<u32> {
        to_id(self.next_to_merge.load(Ordering::Acquire))
    }

    pub(crate) fn set_next_to_merge(&self, id: Option<u32>) {
        self.next_to_merge.store(from_id(id), Ordering::Release)
    }

    /// Non-blocking acquire of the bucket's compaction lock.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.try_lock()
    }
}

fn to_id(raw: i32) -> Option<u32> {
    if raw < 0 {
        None
    } else {
        Some(raw as u32)
    }
}

fn from_id(id: Option<u32>) -> i32 {
    id.map(|v| v as i32).unwrap_or(NO_SEG)
}

pub(crate) struct TtlBuckets {
    buckets: Box<[TtlBucket]>,
}

impl TtlBuckets {
    pub(crate) fn new() -> Self {
        let intervals = [
            TTL_BUCKET_INTERVAL_1,
            TTL_BUCKET_INTERVAL_2,
            TTL_BUCKET_INTERVAL_3,
            TTL_BUCKET_INTERVAL_4,
        ];

        let mut buckets = Vec::with_capacity(MAX_N_TTL_BUCKET);
        for interval in intervals {
            for j in 0..N_BUCKET_PER_STEP {
                buckets.push(TtlBucket::new((interval * j + 1) as u32));
            }
        }

        Self {
            buckets: buckets.into_boxed_slice(),
        }
    }

    /// Map a TTL, in seconds, to the index of its bucket.
    pub(crate) fn index(ttl: u32) -> usize {
        if ttl == 0 || ttl > MAX_TTL {
            MAX_TTL_BUCKET_IDX
        } else if ttl < TTL_BOUNDARY_1 {
            (ttl >> TTL_BUCKET_INTERVAL_N_BIT_1) as usize
        } else if ttl < TTL_BOUNDARY_2 {
            N_BUCKET_PER_STEP + (ttl >> TTL_BUCKET_INTERVAL_N_BIT_2) as usize
        } else if ttl < TTL_BOUNDARY_3 {
            N_BUCKET_PER_STEP * 2 + (ttl >> TTL_BUCKET_INTERVAL_N_BIT_3) as usize
        } else {
            N_BUCKET_PER_STEP * 3 + (ttl >> TTL_BUCKET_INTERVAL_N_BIT_4) as usize
        }
    }

    pub(crate) fn get(&self, index: usize) -> &TtlBucket {
        &self.buckets[index]
    }

    pub(crate) fn for_ttl(&self, ttl: u32) -> &TtlBucket {
        &self.buckets[Self::index(ttl)]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TtlBucket> {
        self.buckets.iter()
    }

    /// Append a segment at the tail of a bucket's chain.
    pub(crate) fn link_tail(
        &self,
        segments: &Segments,
        bucket: &TtlBucket,
        id: u32,
        _arena: &ArenaGuard<'_>,
    ) {
        let header = segments.header(id);
        header.set_next(None);
        match bucket.last() {
            Some(last) => {
                segments.header(last).set_next(Some(id));
                header.set_prev(Some(last));
            }
            None => {
                header.set_prev(None);
                bucket.first.store(id as i32, Ordering::Release);
            }
        }
        bucket.last.store(id as i32, Ordering::Release);
        bucket.nseg.fetch_add(1, Ordering::AcqRel);
        trace!("linked segment {} at tail of ttl bucket {}", id, bucket.ttl);
    }

    /// Detach a segment from the chain of the bucket it belongs to.
    pub(crate) fn unlink(&self, segments: &Segments, id: u32, _arena: &ArenaGuard<'_>) {
        let header = segments.header(id);
        let bucket = self.for_ttl(header.ttl());
        let prev = header.prev();
        let next = header.next();

        match prev {
            Some(prev) => segments.header(prev).set_next(next),
            None => {
                if bucket.first() != Some(id) {
                    error!("segment {} has no prev but is not the chain head", id);
                    debug_assert!(false, "chain head mismatch");
                }
                bucket.first.store(from_id(next), Ordering::Release);
            }
        }

        match next {
            Some(next) => segments.header(next).set_prev(prev),
            None => {
                if bucket.last() != Some(id) {
                    error!("segment {} has no next but is not the chain tail", id);
                    debug_assert!(false, "chain tail mismatch");
                }
                bucket.last.store(from_id(prev), Ordering::Release);
            }
        }

        if bucket.next_to_merge() == Some(id) {
            bucket.set_next_to_merge(next);
        }

        header.set_prev(None);
        header.set_next(None);
        bucket.nseg.fetch_sub(1, Ordering::AcqRel);
        trace!("unlinked segment {} from ttl bucket {}", id, bucket.ttl);
    }

    /// Put `new` into the chain in the position held by `old`, which is left
    /// detached.
    pub(crate) fn replace(&self, segments: &Segments, new: u32, old: u32, _arena: &ArenaGuard<'_>) {
        let old_header = segments.header(old);
        let new_header = segments.header(new);
        let bucket = self.for_ttl(old_header.ttl());
        let prev = old_header.prev();
        let next = old_header.next();

        match prev {
            Some(prev) => segments.header(prev).set_next(Some(new)),
            None => bucket.first.store(new as i32, Ordering::Release),
        }
        match next {
            Some(next) => segments.header(next).set_prev(Some(new)),
            None => bucket.last.store(new as i32, Ordering::Release),
        }

        if bucket.next_to_merge() == Some(old) {
            bucket.set_next_to_merge(Some(new));
        }

        new_header.set_prev(prev);
        new_header.set_next(next);
        old_header.set_prev(None);
        old_header.set_next(None);
        trace!("replaced segment {} with {} in ttl bucket {}", old, new, bucket.ttl);
    }

    /// Walk every chain and verify that the links agree in both directions.
    /// Returns the ids of every linked segment, or `None` if a chain is
    /// broken.
    pub(crate) fn verify(&self, segments: &Segments, _arena: &ArenaGuard<'_>) -> Option<Vec<u32>> {
        let mut linked = Vec::new();
        for (idx, bucket) in self.buckets.iter().enumerate() {
            let mut prev = None;
            let mut current = bucket.first();
            let mut count = 0;
            while let Some(id) = current {
                let header = segments.header(id);
                if header.prev() != prev {
                    error!(
                        "ttl bucket {}: segment {} has prev {:?}, expected {:?}",
                        idx,
                        id,
                        header.prev(),
                        prev
                    );
                    return None;
                }
                if Self::index(header.ttl()) != idx {
                    error!("ttl bucket {}: segment {} has ttl {}", idx, id, header.ttl());
                    return None;
                }
                count += 1;
                if count > segments.count() {
                    error!("ttl bucket {}: chain has a cycle", idx);
                    return None;
                }
                linked.push(id);
                prev = current;
                current = header.next();
            }
            if bucket.last() != prev {
                error!(
                    "ttl bucket {}: tail is {:?} but chain ends at {:?}",
                    idx,
                    bucket.last(),
                    prev
                );
                return None;
            }
            if bucket.nseg() as usize != count {
                error!(
                    "ttl bucket {}: counted {} segments, expected {}",
                    idx,
                    count,
                    bucket.nseg()
                );
                return None;
            }
        }
        Some(linked)
    }
}
