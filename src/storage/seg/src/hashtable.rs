// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A bulk chaining hash table.
//!
//! The table is an array of cache-line sized buckets of eight 64-bit slots.
//! The first slot of the head bucket holds bucket metadata:
//!
//! ```text
//! ┌──────┬──────┬──────────────┬──────────────────────────────┐
//! │ LOCK │ CHAIN│  TIMESTAMP   │             CAS              │
//! │8 bit │8 bit │    16 bit    │            32 bit            │
//! └──────┴──────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! Every other slot is either empty (zero) or holds an item info:
//!
//! ```text
//! ┌──────────┬──────┬──────────────────┬────────────────┐
//! │   TAG    │ FREQ │      SEG ID      │     OFFSET     │
//! │  12 bit  │8 bit │      24 bit      │     20 bit     │
//! └──────────┴──────┴──────────────────┴────────────────┘
//! ```
//!
//! The offset is stored in 8-byte units. The tag always has its lowest bit
//! set so that an occupied slot is never zero. When every slot in a chain is
//! full, the last slot of the final bucket is moved into a new overflow bucket
//! and replaced with a link to it. Links have a zero tag, which can never
//! match a lookup.
//!
//! All mutations lock the head bucket of the chain. Lookups do not lock,
//! except to reset the frequency counters at most once per second per
//! bucket. Frequency counters are updated with a compare-and-swap on the slot
//! and lost updates are tolerated.

use crate::*;

use ahash::RandomState;
use core::hash::{BuildHasher, Hasher};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const N_SLOT_PER_BUCKET: usize = 8;

// item info
const TAG_MASK: u64 = 0xFFF0_0000_0000_0000;
const FREQ_MASK: u64 = 0x000F_F000_0000_0000;
const SEG_ID_MASK: u64 = 0x0000_0FFF_FFF0_0000;
const OFFSET_MASK: u64 = 0x0000_0000_000F_FFFF;

const TAG_BIT: u64 = 0x0010_0000_0000_0000;
const FREQ_BIT_SHIFT: u64 = 44;
const SEG_ID_BIT_SHIFT: u64 = 20;
const OFFSET_UNIT_IN_BIT: u64 = 3;

// clears the "incremented this second" bit of the frequency
const CLEAR_FREQ_SMOOTH_MASK: u64 = 0xFFF7_FFFF_FFFF_FFFF;

// bucket info
const LOCK_MASK: u64 = 0xFF00_0000_0000_0000;
const BUCKET_CHAIN_LEN_MASK: u64 = 0x00FF_0000_0000_0000;
const TS_MASK: u64 = 0x0000_FFFF_0000_0000;
const CAS_MASK: u64 = 0x0000_0000_FFFF_FFFF;

const LOCKED: u64 = 0x0100_0000_0000_0000;
const BUCKET_CHAIN_LEN_BIT_SHIFT: u64 = 48;
const TS_BIT_SHIFT: u64 = 32;

const MAX_FREQ: u64 = 127;

#[inline]
fn tag_from_hash(hash: u64) -> u64 {
    (hash & TAG_MASK) | TAG_BIT
}

#[inline]
pub(crate) fn build_item_info(tag: u64, seg_id: u32, offset: u32) -> u64 {
    debug_assert_eq!(offset % 8, 0);
    tag | ((seg_id as u64) << SEG_ID_BIT_SHIFT) | ((offset as u64) >> OFFSET_UNIT_IN_BIT)
}

#[inline]
fn get_tag(info: u64) -> u64 {
    info & TAG_MASK
}

#[inline]
fn get_freq(info: u64) -> u64 {
    (info & FREQ_MASK) >> FREQ_BIT_SHIFT
}

#[inline]
fn get_seg_id(info: u64) -> u32 {
    ((info & SEG_ID_MASK) >> SEG_ID_BIT_SHIFT) as u32
}

#[inline]
fn get_offset(info: u64) -> u32 {
    ((info & OFFSET_MASK) << OFFSET_UNIT_IN_BIT) as u32
}

#[inline]
fn clear_freq(info: u64) -> u64 {
    info & !FREQ_MASK
}

#[inline]
fn is_link(value: u64) -> bool {
    value != 0 && get_tag(value) == 0
}

#[inline]
fn chain_len(info: u64) -> u64 {
    ((info & BUCKET_CHAIN_LEN_MASK) >> BUCKET_CHAIN_LEN_BIT_SHIFT) + 1
}

#[inline]
fn get_ts(info: u64) -> u64 {
    (info & TS_MASK) >> TS_BIT_SHIFT
}

#[inline]
fn get_cas(info: u64) -> u32 {
    (info & CAS_MASK) as u32
}

#[repr(C, align(64))]
struct HashBucket {
    data: [AtomicU64; N_SLOT_PER_BUCKET],
}

impl HashBucket {
    fn new() -> Self {
        Self {
            data: Default::default(),
        }
    }

    fn info(&self) -> &AtomicU64 {
        &self.data[0]
    }
}

/// Holds the lock bit of a head bucket and releases it on drop.
struct BucketLock<'a> {
    info: &'a AtomicU64,
    bump_cas: bool,
}

impl<'a> BucketLock<'a> {
    fn incr_chain_len(&self) {
        let info = self.info.load(Ordering::Acquire);
        let len = chain_len(info);
        let info = (info & !BUCKET_CHAIN_LEN_MASK) | (len << BUCKET_CHAIN_LEN_BIT_SHIFT);
        self.info.store(info, Ordering::Release);
        trace!("increased bucket chain to len {}", len + 1);
    }

    fn set_ts(&self, ts: u64) {
        let info = self.info.load(Ordering::Acquire);
        self.info
            .store((info & !TS_MASK) | (ts << TS_BIT_SHIFT), Ordering::Release);
    }
}

impl<'a> Drop for BucketLock<'a> {
    fn drop(&mut self) {
        // only the lock holder writes the info word
        let mut info = self.info.load(Ordering::Acquire) & !LOCK_MASK;
        if self.bump_cas {
            info = (info & !CAS_MASK) | ((info + 1) & CAS_MASK);
        }
        self.info.store(info, Ordering::Release);
    }
}

/// Summary of hash table occupancy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HashStats {
    pub items: usize,
    pub buckets: usize,
}

pub(crate) struct HashTable {
    hash_builder: Box<RandomState>,
    mask: u64,
    data: Box<[HashBucket]>,
    overflow: Box<[HashBucket]>,
    next_overflow: AtomicUsize,
}

impl HashTable {
    /// Creates a table with `2^power` slots and room for
    /// `overflow_factor` times as many buckets again for chaining.
    pub(crate) fn new(power: u8, overflow_factor: f64) -> Result<Self, SegError> {
        if !(4..=40).contains(&power) {
            return Err(SegError::Config("hash power must be between 4 and 40"));
        }
        if overflow_factor.is_nan() || overflow_factor < 0.0 {
            return Err(SegError::Config("overflow factor must not be negative"));
        }

        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        let buckets = 1_usize << (power - 3);
        let overflow = (buckets as f64 * overflow_factor).ceil() as usize;

        let data: Box<[HashBucket]> = (0..buckets).map(|_| HashBucket::new()).collect();
        let overflow: Box<[HashBucket]> = (0..overflow).map(|_| HashBucket::new()).collect();

        info!(
            "hash table has {} buckets and {} overflow buckets",
            buckets, overflow.len()
        );

        Ok(Self {
            hash_builder: Box::new(hash_builder),
            mask: buckets as u64 - 1,
            data,
            overflow,
            next_overflow: AtomicUsize::new(0),
        })
    }

    fn hash(&self, key: &[u8]) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        hasher.write(key);
        hasher.finish()
    }

    fn head(&self, hash: u64) -> &HashBucket {
        &self.data[(hash & self.mask) as usize]
    }

    fn next_bucket(&self, bucket: &HashBucket) -> Option<&HashBucket> {
        let value = bucket.data[N_SLOT_PER_BUCKET - 1].load(Ordering::Acquire);
        if is_link(value) {
            self.overflow.get((value - 1) as usize)
        } else {
            None
        }
    }

    fn alloc_overflow(&self) -> Option<usize> {
        let idx = self.next_overflow.fetch_add(1, Ordering::AcqRel);
        if idx < self.overflow.len() {
            Some(idx)
        } else {
            self.next_overflow.fetch_sub(1, Ordering::AcqRel);
            None
        }
    }

    fn lock<'a>(&self, head: &'a HashBucket, bump_cas: bool) -> BucketLock<'a> {
        let info = head.info();
        let mut attempt = 0;
        loop {
            let current = info.load(Ordering::Relaxed);
            if current & LOCK_MASK == 0
                && info
                    .compare_exchange_weak(
                        current,
                        current | LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return BucketLock { info, bump_cas };
            }
            backoff(attempt);
            attempt = (attempt + 1).min(6);
        }
    }

    /// Calls `f` with every item slot in the chain starting at `head`, until
    /// `f` returns false.
    fn for_each_slot<'a, F>(&'a self, head: &'a HashBucket, mut f: F)
    where
        F: FnMut(&'a AtomicU64) -> bool,
    {
        let mut bucket = head;
        let mut start = 1;
        loop {
            let next = self.next_bucket(bucket);
            let end = if next.is_some() {
                N_SLOT_PER_BUCKET - 1
            } else {
                N_SLOT_PER_BUCKET
            };
            for slot in &bucket.data[start..end] {
                if !f(slot) {
                    return;
                }
            }
            match next {
                Some(next) => {
                    bucket = next;
                    start = 0;
                }
                None => return,
            }
        }
    }

    /// Full key comparison against the item an info points to.
    fn same_item(&self, key: &[u8], info: u64, segments: &Segments) -> bool {
        let seg_id = get_seg_id(info);
        let offset = get_offset(info);
        if seg_id as usize >= segments.count()
            || offset as usize + ITEM_HDR_SIZE > segments.segment_size() as usize
        {
            return false;
        }
        let item = segments.item(seg_id, offset);
        if !item.is_defined() || item.klen() != key.len() {
            return false;
        }
        let end = offset as usize + ITEM_HDR_SIZE + item.olen() + item.klen();
        end <= segments.segment_size() as usize && item.key() == key
    }

    /// Update the accounting of the segment holding an item which is no longer
    /// referenced from the table, optionally marking it deleted.
    fn free_item(&self, info: u64, tombstone: bool, segments: &Segments) {
        let seg_id = get_seg_id(info);
        let item = segments.item(seg_id, get_offset(info));
        if tombstone {
            item.tombstone();
        }
        segments.header(seg_id).release_item(item.size());
    }

    /// Once per second per bucket, clear the bit recording that each item's
    /// frequency was already bumped during the current second.
    fn reset_freq_epoch(&self, head: &HashBucket, now: u32) {
        let ts = (now & 0xFFFF) as u64;
        if get_ts(head.info().load(Ordering::Acquire)) == ts {
            return;
        }

        let lock = self.lock(head, false);
        if get_ts(head.info().load(Ordering::Acquire)) != ts {
            lock.set_ts(ts);
            self.for_each_slot(head, |slot| {
                slot.fetch_and(CLEAR_FREQ_SMOOTH_MASK, Ordering::AcqRel);
                true
            });
        }
    }

    /// Bump the approximate frequency counter of a slot. Counters below 16
    /// always increase; above that they increase with probability
    /// `1 / freq`. Each item is counted at most once per second.
    fn incr_freq(slot: &AtomicU64, info: u64) {
        let freq = get_freq(info);
        if freq >= MAX_FREQ {
            // either saturated or already counted this second
            return;
        }
        let freq = if freq <= 16 || random_u64() % freq == 0 {
            (freq + 1) | 0x80
        } else {
            freq | 0x80
        };
        let updated = (info & !FREQ_MASK) | (freq << FREQ_BIT_SHIFT);
        let _ = slot.compare_exchange(info, updated, Ordering::AcqRel, Ordering::Relaxed);
    }

    /// Look up an item by key. On a hit, the item's segment has a reader
    /// reference held by the returned guard and the item's frequency counter
    /// is updated.
    pub(crate) fn get<'a>(
        &self,
        key: &[u8],
        now: u32,
        segments: &'a Segments,
    ) -> Option<(RawItem, SegmentRef<'a>)> {
        HASH_LOOKUP.increment();

        let hash = self.hash(key);
        let tag = tag_from_hash(hash);
        let head = self.head(hash);

        self.reset_freq_epoch(head, now);

        let mut result = None;
        self.for_each_slot(head, |slot| {
            let info = slot.load(Ordering::Acquire);
            if get_tag(info) != tag {
                return true;
            }
            let seg_id = get_seg_id(info);
            let guard = match segments.read_ref(seg_id) {
                Some(guard) => guard,
                None => return true,
            };
            if !self.same_item(key, info, segments) {
                HASH_TAG_COLLISION.increment();
                return true;
            }
            Self::incr_freq(slot, info);
            result = Some((segments.item(seg_id, get_offset(info)), guard));
            false
        });
        result
    }

    /// Link an item into the table, replacing the newest existing entry for
    /// the key, or taking the first empty slot. The replaced item's segment
    /// accounting is updated but the item is not tombstoned.
    pub(crate) fn insert(
        &self,
        key: &[u8],
        seg_id: u32,
        offset: u32,
        segments: &Segments,
    ) -> Result<(), SegError> {
        HASH_INSERT.increment();

        let hash = self.hash(key);
        let tag = tag_from_hash(hash);
        let head = self.head(hash);

        let lock = self.lock(head, true);
        self.link(&lock, head, key, build_item_info(tag, seg_id, offset), segments)
    }

    /// Link an item only if the newest entry for the key refers to an item
    /// with version `expected`. `visible` decides whether the current entry
    /// still counts as present. The check and the update happen under the
    /// same bucket lock.
    pub(crate) fn compare_and_insert<F>(
        &self,
        key: &[u8],
        seg_id: u32,
        offset: u32,
        expected: u32,
        segments: &Segments,
        visible: F,
    ) -> Result<(), SegError>
    where
        F: Fn(u32, &RawItem) -> bool,
    {
        HASH_INSERT.increment();

        let hash = self.hash(key);
        let tag = tag_from_hash(hash);
        let head = self.head(hash);

        let mut lock = self.lock(head, false);

        let mut current = None;
        self.for_each_slot(head, |slot| {
            let info = slot.load(Ordering::Acquire);
            if get_tag(info) != tag {
                return true;
            }
            if !self.same_item(key, info, segments) {
                HASH_TAG_COLLISION.increment();
                return true;
            }
            current = Some(info);
            false
        });

        let info = current.ok_or(SegError::NotFound)?;
        let seg_id_current = get_seg_id(info);
        let item = segments.item(seg_id_current, get_offset(info));
        if !visible(seg_id_current, &item) {
            return Err(SegError::NotFound);
        }
        if item.cas() != expected {
            return Err(SegError::Exists);
        }

        lock.bump_cas = true;
        self.link(&lock, head, key, build_item_info(tag, seg_id, offset), segments)
    }

    /// Store `insert_info` in the chain starting at `head`. Must be called
    /// with the chain locked.
    fn link(
        &self,
        lock: &BucketLock<'_>,
        head: &HashBucket,
        key: &[u8],
        mut insert_info: u64,
        segments: &Segments,
    ) -> Result<(), SegError> {
        let tag = get_tag(insert_info);

        let mut bucket = head;
        let mut start = 1;
        loop {
            let next = self.next_bucket(bucket);
            let end = if next.is_some() {
                N_SLOT_PER_BUCKET - 1
            } else {
                N_SLOT_PER_BUCKET
            };

            for slot in &bucket.data[start..end] {
                let current = slot.load(Ordering::Acquire);
                if get_tag(current) != tag {
                    if insert_info != 0 && current == 0 {
                        slot.store(insert_info, Ordering::Release);
                        insert_info = 0;
                    }
                    continue;
                }
                if !self.same_item(key, current, segments) {
                    HASH_TAG_COLLISION.increment();
                    continue;
                }
                // replace the old entry, or clear it if already inserted
                slot.store(insert_info, Ordering::Release);
                insert_info = 0;
                self.free_item(current, false, segments);
                ITEM_REPLACE.increment();
            }

            // older entries further down the chain are left for eviction to
            // clean up
            if insert_info == 0 {
                return Ok(());
            }

            match next {
                Some(next) => {
                    bucket = next;
                    start = 0;
                }
                None => break,
            }
        }

        // every slot in the chain is occupied, extend it
        let idx = match self.alloc_overflow() {
            Some(idx) => idx,
            None => {
                HASH_INSERT_EX.increment();
                return Err(SegError::HashTableInsertEx);
            }
        };
        let extension = &self.overflow[idx];
        let last = &bucket.data[N_SLOT_PER_BUCKET - 1];
        extension.data[0].store(last.load(Ordering::Acquire), Ordering::Release);
        extension.data[1].store(insert_info, Ordering::Release);
        last.store(idx as u64 + 1, Ordering::Release);
        lock.incr_chain_len();
        HASH_BUCKET_ALLOC.increment();

        Ok(())
    }

    /// Remove every entry for the key. The newest entry's item is
    /// tombstoned; older generations are only unlinked. Returns true if any
    /// entry was found.
    pub(crate) fn delete(&self, key: &[u8], segments: &Segments) -> bool {
        HASH_REMOVE.increment();

        let hash = self.hash(key);
        let tag = tag_from_hash(hash);
        let head = self.head(hash);

        let _lock = self.lock(head, true);

        let mut deleted = false;
        self.for_each_slot(head, |slot| {
            let current = slot.load(Ordering::Acquire);
            if get_tag(current) != tag {
                return true;
            }
            if !self.same_item(key, current, segments) {
                HASH_TAG_COLLISION.increment();
                return true;
            }
            slot.store(0, Ordering::Release);
            self.free_item(current, !deleted, segments);
            deleted = true;
            true
        });
        deleted
    }

    /// Remove the entry for a specific generation of a key, along with any
    /// older generations behind it. Returns true if that generation was still
    /// in the table.
    ///
    /// If the generation is the newest, it is unlinked without a tombstone and
    /// older generations are tombstoned. If a newer generation exists, it is
    /// kept and everything older is unlinked without tombstones.
    pub(crate) fn evict(&self, key: &[u8], seg_id: u32, offset: u32, segments: &Segments) -> bool {
        HASH_REMOVE.increment();

        let hash = self.hash(key);
        let tag = tag_from_hash(hash);
        let head = self.head(hash);
        let target = build_item_info(tag, seg_id, offset);

        let _lock = self.lock(head, false);

        let mut first_match = true;
        let mut outdated = true;
        let mut found = false;
        self.for_each_slot(head, |slot| {
            let current = slot.load(Ordering::Acquire);
            if get_tag(current) != tag {
                return true;
            }
            if !self.same_item(key, current, segments) {
                HASH_TAG_COLLISION.increment();
                return true;
            }
            if first_match {
                first_match = false;
                if clear_freq(current) == target {
                    slot.store(0, Ordering::Release);
                    self.free_item(current, false, segments);
                    outdated = false;
                    found = true;
                }
                return true;
            }
            if clear_freq(current) == target {
                found = true;
            }
            slot.store(0, Ordering::Release);
            self.free_item(current, !outdated, segments);
            true
        });
        found
    }

    /// Point the newest entry for a key at a new location. Fails, returning
    /// false, if the newest entry is not the expected old location. Older
    /// generations are unlinked. The frequency counter starts over.
    pub(crate) fn relink(
        &self,
        key: &[u8],
        old: (u32, u32),
        new: (u32, u32),
        segments: &Segments,
    ) -> bool {
        HASH_RELINK.increment();

        let hash = self.hash(key);
        let tag = tag_from_hash(hash);
        let head = self.head(hash);
        let old_info = build_item_info(tag, old.0, old.1);
        let new_info = build_item_info(tag, new.0, new.1);

        let _lock = self.lock(head, false);

        let mut first_match = true;
        let mut outdated = true;
        self.for_each_slot(head, |slot| {
            let current = slot.load(Ordering::Acquire);
            if get_tag(current) != tag {
                return true;
            }
            if !self.same_item(key, current, segments) {
                HASH_TAG_COLLISION.increment();
                return true;
            }
            if first_match {
                first_match = false;
                if clear_freq(current) == old_info {
                    slot.store(new_info, Ordering::Release);
                    outdated = false;
                }
                return true;
            }
            slot.store(0, Ordering::Release);
            self.free_item(current, false, segments);
            true
        });
        !outdated
    }

    /// The frequency counter of a specific generation of a key, or zero if a
    /// newer generation exists or the key is absent.
    pub(crate) fn get_freq(&self, key: &[u8], seg_id: u32, offset: u32, segments: &Segments) -> u8 {
        let hash = self.hash(key);
        let tag = tag_from_hash(hash);
        let head = self.head(hash);
        let target = build_item_info(tag, seg_id, offset);

        let mut freq = 0;
        self.for_each_slot(head, |slot| {
            let current = slot.load(Ordering::Acquire);
            if get_tag(current) != tag || !self.same_item(key, current, segments) {
                return true;
            }
            if clear_freq(current) == target {
                freq = (get_freq(current) & 0x7F) as u8;
            }
            false
        });
        freq
    }

    /// Returns true if the given generation is the newest entry for the key.
    pub(crate) fn is_current(&self, key: &[u8], seg_id: u32, offset: u32, segments: &Segments) -> bool {
        let hash = self.hash(key);
        let tag = tag_from_hash(hash);
        let head = self.head(hash);
        let target = build_item_info(tag, seg_id, offset);

        let mut current = false;
        self.for_each_slot(head, |slot| {
            let info = slot.load(Ordering::Acquire);
            if get_tag(info) != tag || !self.same_item(key, info, segments) {
                return true;
            }
            current = clear_freq(info) == target;
            false
        });
        current
    }

    /// The version counter of the bucket a key maps to. It changes on every
    /// insert or delete in the bucket.
    pub(crate) fn bucket_cas(&self, key: &[u8]) -> u32 {
        let hash = self.hash(key);
        get_cas(self.head(hash).info().load(Ordering::Acquire))
    }

    /// Count the occupied slots and the buckets in use, including overflow
    /// buckets.
    pub(crate) fn stats(&self) -> HashStats {
        let mut stats = HashStats::default();
        for head in self.data.iter() {
            stats.buckets += chain_len(head.info().load(Ordering::Acquire)) as usize;
            self.for_each_slot(head, |slot| {
                if slot.load(Ordering::Acquire) != 0 {
                    stats.items += 1;
                }
                true
            });
        }
        stats
    }

    /// Count the entries which point into a segment. Used to diagnose a
    /// segment whose accounting disagrees with the table.
    pub(crate) fn entries_in_segment(&self, seg_id: u32) -> usize {
        let mut count = 0;
        for head in self.data.iter() {
            self.for_each_slot(head, |slot| {
                let info = slot.load(Ordering::Acquire);
                if info != 0 && get_seg_id(info) == seg_id {
                    count += 1;
                }
                true
            });
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_info_layout() {
        let tag = tag_from_hash(0xABCD_0000_0000_0000);
        assert_eq!(tag, 0xABD0_0000_0000_0000);
        assert_ne!(tag_from_hash(0), 0);

        let info = build_item_info(tag, 0x00AB_CDEF, 8 * 0x000F_FFFF);
        assert_eq!(get_tag(info), tag);
        assert_eq!(get_seg_id(info), 0x00AB_CDEF);
        assert_eq!(get_offset(info), 8 * 0x000F_FFFF);
        assert_eq!(get_freq(info), 0);

        let with_freq = info | (0x85 << FREQ_BIT_SHIFT);
        assert_eq!(get_freq(with_freq), 0x85);
        assert_eq!(clear_freq(with_freq), info);
        assert_eq!(get_freq(with_freq & CLEAR_FREQ_SMOOTH_MASK), 0x05);
        assert!(!is_link(info));
        assert!(is_link(1));
        assert!(!is_link(0));
    }

    #[test]
    fn bucket_info_layout() {
        assert_eq!(chain_len(0), 1);
        assert_eq!(chain_len(0x0003_0000_0000_0000), 4);
        assert_eq!(get_ts(0x0000_1234_0000_0000), 0x1234);
        assert_eq!(get_cas(0xFFFF_FFFF_0000_0007), 7);
    }

    #[test]
    fn sizing() {
        assert!(HashTable::new(3, 0.0).is_err());
        assert!(HashTable::new(4, -1.0).is_err());

        let table = HashTable::new(10, 0.5).expect("failed to create table");
        assert_eq!(table.data.len(), 128);
        assert_eq!(table.overflow.len(), 64);
        assert_eq!(table.stats(), HashStats { items: 0, buckets: 128 });
    }

    #[test]
    fn frequency_counter() {
        crate::rand::reseed(42);
        let slot = AtomicU64::new(build_item_info(TAG_BIT, 1, 0));

        // counted at most once per epoch
        HashTable::incr_freq(&slot, slot.load(Ordering::Relaxed));
        HashTable::incr_freq(&slot, slot.load(Ordering::Relaxed));
        assert_eq!(get_freq(slot.load(Ordering::Relaxed)), 0x81);

        // new epoch, low counts always increase
        for expected in 2..=17 {
            slot.fetch_and(CLEAR_FREQ_SMOOTH_MASK, Ordering::Relaxed);
            HashTable::incr_freq(&slot, slot.load(Ordering::Relaxed));
            assert_eq!(get_freq(slot.load(Ordering::Relaxed)) & 0x7F, expected);
        }

        // higher counts grow slowly and saturate at 127
        for _ in 0..100_000 {
            slot.fetch_and(CLEAR_FREQ_SMOOTH_MASK, Ordering::Relaxed);
            HashTable::incr_freq(&slot, slot.load(Ordering::Relaxed));
        }
        let freq = get_freq(slot.load(Ordering::Relaxed)) & 0x7F;
        assert!(freq > 17);
        assert!(freq <= 127);
    }
}
