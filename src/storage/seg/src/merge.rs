// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Merge-based eviction.
//!
//! Instead of evicting a whole segment, a run of mature segments within one
//! TTL bucket is compacted into a single fresh segment. Items are copied
//! forward if their access frequency, normalized by size, is above a cutoff.
//! The cutoff is tuned while scanning so that roughly `1 / merge` of the
//! scanned bytes are kept, which frees about `merge - 1` segments per round.

use crate::*;

use crate::eviction::N_MAX_SEG_MERGE;
use crate::seg::{Reclaim, Seg};

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

// segments younger than this are not merged on the first attempt
const MIN_MATURE_TIME: u32 = 20;

// segments this close to expiring are left to expire
const EXPIRY_MARGIN: u32 = 20;

const N_MERGE_ATTEMPT: usize = 8;

// merged segments needed before the anti-starvation check is trusted
const MIN_MERGED_FOR_STARVATION: u64 = 100;

/// Summary of one compaction round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Segments emptied and returned to the free pool, in chain order.
    pub segments: Vec<u32>,
    /// Bytes of current items found in the consumed segments.
    pub scanned: usize,
    /// Bytes copied into the destination.
    pub copied: usize,
    /// Bytes of current items dropped from the cache.
    pub discarded: usize,
    /// The segment which received the copied items. `None` if nothing was
    /// kept, or if the round expired an old segment instead of merging.
    pub destination: Option<u32>,
}

pub(crate) struct Merge {
    max: usize,
    target_ratio: f64,
    stop_ratio: f64,
    // ttl bucket to resume scanning from
    cursor: AtomicUsize,
    empty_merges: AtomicU32,
    successful_merges: AtomicU32,
    // total segments claimed for merging and the sum of their ages, used to
    // detect buckets which cannot be merged
    merged: AtomicU64,
    merged_age_sum: AtomicU64,
}

impl Merge {
    /// `max` segments are claimed per round, and about `1 / merge` of the
    /// scanned bytes are kept.
    pub(crate) fn new(max: usize, merge: usize) -> Self {
        let max = max.clamp(2, N_MAX_SEG_MERGE);
        let merge = merge.clamp(2, max);
        Self {
            max,
            target_ratio: 1.0 / merge as f64,
            stop_ratio: (merge - 1) as f64 / merge as f64 + 0.05,
            cursor: AtomicUsize::new(0),
            empty_merges: AtomicU32::new(0),
            successful_merges: AtomicU32::new(0),
            merged: AtomicU64::new(0),
            merged_age_sum: AtomicU64::new(0),
        }
    }

    fn margin(&self, segment_size: u32) -> u32 {
        (segment_size as f64 * self.stop_ratio) as u32
    }

    /// Free up at least one segment for writers. Returns false if nothing
    /// could be merged or expired.
    pub(crate) fn make_room(&self, seg: &Seg) -> bool {
        if seg.segments.free_count() > seg.segments.reserved() {
            return true;
        }
        self.run(seg).is_some()
    }

    /// Run a compaction round, relaxing the maturity requirement on each
    /// attempt that finds nothing to merge.
    pub(crate) fn run(&self, seg: &Seg) -> Option<MergeReport> {
        match retry(N_MERGE_ATTEMPT, |attempt| {
            let maturity = MIN_MATURE_TIME >> attempt;
            match self.scan(seg, maturity) {
                Some(report) => Attempt::Done(report),
                None => {
                    debug!("no mergeable segments, maturity {}s", maturity);
                    Attempt::Retry
                }
            }
        }) {
            Outcome::Success(report) => Some(report),
            Outcome::Contended | Outcome::Exhausted => {
                warn!("cannot find mergeable segments");
                None
            }
        }
    }

    fn is_mergeable(header: &SegmentHeader, now: u32, maturity: u32) -> bool {
        header.is_evictable()
            && header.next().is_some()
            && now.saturating_sub(header.create_at()) >= maturity
            && (header.create_at() as i64 + header.ttl() as i64 - now as i64) > EXPIRY_MARGIN as i64
    }

    /// Visit the TTL buckets round-robin, and merge the first run of
    /// mergeable segments found.
    fn scan(&self, seg: &Seg, maturity: u32) -> Option<MergeReport> {
        let start = self.cursor.load(Ordering::Relaxed);

        // one extra step so that a single busy bucket is visited again
        for i in 0..=MAX_N_TTL_BUCKET {
            let idx = (start + i) % MAX_N_TTL_BUCKET;
            let bucket = seg.ttl_buckets.get(idx);
            let first = match bucket.first() {
                Some(first) => first,
                None => continue,
            };

            // another thread is merging this bucket
            let _guard = match bucket.try_lock() {
                Some(guard) => guard,
                None => continue,
            };

            let now = seg.now();
            let begin = bucket
                .next_to_merge()
                .filter(|id| seg.segments.header(*id).ttl() == bucket.ttl())
                .unwrap_or(first);

            match self.find_run(seg, begin, now, maturity) {
                Some(run) => {
                    let sources = self.claim(seg, run, now, maturity);
                    if sources.len() < 2 {
                        Self::release(seg, &sources);
                        continue;
                    }
                    let (report, next) = match self.merge(seg, &sources, now) {
                        Some(merged) => merged,
                        None => {
                            Self::release(seg, &sources);
                            return None;
                        }
                    };
                    bucket.set_next_to_merge(next);
                    self.cursor.store(idx, Ordering::Relaxed);
                    return Some(report);
                }
                None => {
                    bucket.set_next_to_merge(None);
                    if let Some(report) = self.expire_stale_head(seg, bucket, now) {
                        self.cursor.store((idx + 1) % MAX_N_TTL_BUCKET, Ordering::Relaxed);
                        return Some(report);
                    }
                }
            }
        }
        None
    }

    /// Walk a chain from `begin` looking for three consecutive mergeable
    /// segments followed by at least one more segment.
    fn find_run(&self, seg: &Seg, begin: u32, now: u32, maturity: u32) -> Option<u32> {
        let segments = &seg.segments;
        let mut current = begin;

        // the chain may be edited while walking it
        for _ in 0..segments.count() {
            let h0 = segments.header(current);
            let n1 = h0.next()?;
            let h1 = segments.header(n1);
            let n2 = h1.next()?;
            let h2 = segments.header(n2);
            let n3 = h2.next()?;

            if !Self::is_mergeable(h0, now, maturity) {
                current = n1;
            } else if !Self::is_mergeable(h1, now, maturity) {
                current = n2;
            } else if Self::is_mergeable(h2, now, maturity) {
                return Some(current);
            } else {
                current = n3;
            }
        }
        None
    }

    /// Claim up to `max` mergeable segments starting at `start`, so they
    /// cannot be evicted or expired while they are merged.
    fn claim(&self, seg: &Seg, start: u32, now: u32, maturity: u32) -> Vec<u32> {
        let mut claimed = Vec::with_capacity(self.max);
        let _arena = seg.segments.lock();

        let mut current = Some(start);
        for _ in 0..self.max {
            let id = match current {
                Some(id) => id,
                None => break,
            };
            let header = seg.segments.header(id);
            current = header.next();

            if !Self::is_mergeable(header, now, maturity) || !header.try_claim() {
                continue;
            }
            claimed.push(id);
            self.merged.fetch_add(1, Ordering::Relaxed);
            self.merged_age_sum.fetch_add(
                now.saturating_sub(header.create_at()) as u64,
                Ordering::Relaxed,
            );
        }
        claimed
    }

    /// Return claimed segments which were not consumed.
    fn release(seg: &Seg, ids: &[u32]) {
        for id in ids {
            seg.segments.header(*id).set_evictable(true);
        }
    }

    /// If nothing in the bucket can be merged but its oldest segment is much
    /// older than the segments usually merged, reclaim it outright.
    fn expire_stale_head(&self, seg: &Seg, bucket: &TtlBucket, now: u32) -> Option<MergeReport> {
        let merged = self.merged.load(Ordering::Relaxed);
        if merged <= MIN_MERGED_FOR_STARVATION {
            return None;
        }
        let average = self.merged_age_sum.load(Ordering::Relaxed) / merged;

        let head = bucket.first()?;
        let header = seg.segments.header(head);
        let age = now.saturating_sub(header.create_at()) as u64;
        if age <= average * 2 {
            return None;
        }

        let occupied = header.occupied().max(0) as usize;
        if !seg.reclaim(head, Reclaim::Expire) {
            return None;
        }
        let mut arena = seg.segments.lock();
        seg.segments.push_free(&mut arena, head);
        debug!(
            "expired segment {} aged {}s, average merged age {}s",
            head, age, average
        );

        Some(MergeReport {
            segments: vec![head],
            scanned: occupied,
            copied: 0,
            discarded: occupied,
            destination: None,
        })
    }

    /// Merge the claimed segments into one fresh segment. Returns the report
    /// and where the bucket's next merge should start, or `None` if no
    /// destination segment was available.
    fn merge(&self, seg: &Seg, sources: &[u32], now: u32) -> Option<(MergeReport, Option<u32>)> {
        let segments = &seg.segments;
        let first = segments.header(sources[0]);
        let after_run = sources.last().and_then(|id| segments.header(*id).next());

        let dest = match seg.take_free(true) {
            Some(id) => id,
            None => {
                warn!("no free segment to merge into");
                return None;
            }
        };
        segments.init(dest, first.ttl(), first.create_at());
        let dest_header = segments.header(dest);
        dest_header.set_merge_at(now);

        let mut cutoff = if self.empty_merges.load(Ordering::Relaxed)
            > self.successful_merges.load(Ordering::Relaxed)
            && self.empty_merges.load(Ordering::Relaxed) > 2
        {
            0.0
        } else {
            1.0
        };

        let margin = self.margin(segments.segment_size());
        let mut report = MergeReport::default();
        let mut consumed = 0;

        while consumed < sources.len() && dest_header.write_offset() < margin {
            let src = sources[consumed];
            consumed += 1;

            self.copy(seg, dest, src, &mut cutoff, &mut report);

            let src_header = segments.header(src);
            src_header.set_accessible(false);
            segments.wait_refcount(src);

            // a writer may have linked an item after the scan
            if src_header.n_item() > 0 {
                SEGMENT_EVICT_RETRY.increment();
                seg.scrub(src);
            }

            let mut arena = segments.lock();
            if consumed == 1 {
                seg.ttl_buckets.replace(segments, dest, src, &arena);
            } else {
                seg.ttl_buckets.unlink(segments, src, &arena);
            }
            segments.push_free(&mut arena, src);
            report.segments.push(src);
            SEGMENT_MERGE.increment();
        }

        Self::release(seg, &sources[consumed..]);

        if dest_header.occupied() <= 0 {
            dest_header.set_accessible(false);
            segments.wait_refcount(dest);
            {
                let mut arena = segments.lock();
                seg.ttl_buckets.unlink(segments, dest, &arena);
                segments.push_free(&mut arena, dest);
            }
            self.empty_merges.fetch_add(1, Ordering::Relaxed);
            SEGMENT_MERGE_EMPTY.increment();
            warn!(
                "merged {} segments with no live items, returned segment {}",
                consumed, dest
            );
            return Some((report, after_run));
        }

        segments.clear_tail(dest);
        dest_header.set_evictable(true);
        self.successful_merges.fetch_add(1, Ordering::Relaxed);
        report.destination = Some(dest);

        info!(
            "ttl {}: merged {}/{} segments {:?} into segment {}, {} free segments, {} bytes in {} items",
            dest_header.ttl(),
            consumed,
            sources.len(),
            report.segments,
            dest,
            segments.free_count(),
            dest_header.occupied(),
            dest_header.n_item()
        );

        Some((report, dest_header.next()))
    }

    /// Copy the hot items of `src` into `dest`, evicting the rest.
    fn copy(&self, seg: &Seg, dest: u32, src: u32, cutoff: &mut f64, report: &mut MergeReport) {
        let segments = &seg.segments;
        let hashtable = &seg.hashtable;
        let segment_size = segments.segment_size() as usize;
        let src_header = segments.header(src);
        let dest_header = segments.header(dest);

        let n_item = src_header.n_item();
        let mean_size = if n_item > 0 {
            src_header.occupied() as f64 / n_item as f64
        } else {
            1.0
        };

        let mut copy_all = *cutoff < 0.0001;
        let mut threshold = (1.0 + *cutoff) / 2.0;
        let update_interval = (segment_size / 10).max(1);
        let mut next_update = update_interval;
        let margin = self.margin(segments.segment_size()) as usize;

        let mut scanned = 0;
        let mut copied = 0;

        for (offset, item) in segments.items(src) {
            let size = item.size();
            scanned += size;

            if scanned >= next_update {
                next_update += update_interval;
                let t = (copied as f64 / scanned as f64 - self.target_ratio) / self.target_ratio;
                if !(-0.5..=0.5).contains(&t) {
                    threshold *= 1.0 + t;
                }
            }

            // this is the last segment this destination can take, so keep
            // everything that still fits
            if !copy_all
                && dest_header.write_offset() as usize >= margin
                && offset as usize > margin
            {
                copy_all = true;
            }

            if item.is_deleted() || !hashtable.is_current(item.key(), src, offset, segments) {
                continue;
            }
            report.scanned += size;

            // invisible after a flush
            if seg.is_flushed(&item) {
                if hashtable.evict(item.key(), src, offset, segments) {
                    ITEM_EVICT.increment();
                }
                report.discarded += size;
                continue;
            }

            let freq = hashtable.get_freq(item.key(), src, offset, segments) as f64;
            let hit = freq / (size as f64 / mean_size);

            let dest_offset = dest_header.write_offset();
            if (hit <= threshold && !copy_all) || dest_offset as usize + size > segment_size {
                if hashtable.evict(item.key(), src, offset, segments) {
                    ITEM_DISCARDED.increment();
                }
                report.discarded += size;
                continue;
            }

            // SAFETY: the destination is not visible to writers and the range
            // was checked to fit
            unsafe {
                item.copy_to(segments.raw(dest, dest_offset));
            }

            if hashtable.relink(item.key(), (src, offset), (dest, dest_offset), segments) {
                dest_header.set_write_offset(dest_offset + size as u32);
                dest_header.add_item(size);
                src_header.release_item(size);
                copied += size;
                report.copied += size;
                ITEM_COMPACTED.increment();
            } else {
                // superseded while copying
                ITEM_RELINK_STALE.increment();
            }
        }

        *cutoff = threshold;
        debug!(
            "moved items from segment {} to segment {}: {} items, offset {}, cutoff {:.2}, target ratio {:.2}",
            src,
            dest,
            dest_header.n_item(),
            dest_header.write_offset(),
            cutoff,
            self.target_ratio
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    #[test]
    fn ratios() {
        let merge = Merge::new(8, 4);
        assert_eq!(merge.max, 8);
        assert!((merge.target_ratio - 0.25).abs() < f64::EPSILON);
        assert!((merge.stop_ratio - 0.8).abs() < 1e-9);
        assert_eq!(merge.margin(1000), 800);

        // out of range parameters are clamped
        let merge = Merge::new(100, 1);
        assert_eq!(merge.max, N_MAX_SEG_MERGE);
        assert!((merge.target_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn stale_head_is_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Seg::builder()
            .heap_size(8 * 1024)
            .segment_size(1024)
            .clock(clock.clone())
            .build()
            .expect("failed to create cache");

        // two full segments in one bucket, too short a chain to merge
        let value = vec![0; 1024 - ITEM_HDR_SIZE - 8];
        assert!(cache.set(b"stale-01", &value, None, 3600).is_ok());
        assert!(cache.set(b"stale-02", &value, None, 3600).is_ok());
        assert_eq!(cache.free_segments(), 6);
        clock.advance(100);

        let merge = Merge::new(8, 4);

        // without a history of merges the head is left alone
        assert_eq!(merge.run(&cache), None);
        assert_eq!(cache.free_segments(), 6);

        // segments usually merge at 10s, the head is 100s old
        merge.merged.store(MIN_MERGED_FOR_STARVATION + 1, Ordering::Relaxed);
        merge
            .merged_age_sum
            .store((MIN_MERGED_FOR_STARVATION + 1) * 10, Ordering::Relaxed);

        let report = merge.run(&cache).expect("nothing expired");
        assert_eq!(report.segments.len(), 1);
        assert_eq!(report.destination, None);
        assert_eq!(report.copied, 0);
        assert_eq!(report.discarded, report.scanned);
        assert!(report.scanned > 0);

        assert_eq!(cache.free_segments(), 7);
        assert!(cache.get(b"stale-01").is_none());
        assert!(cache.get(b"stale-02").is_some());
        assert!(cache.check_integrity());
    }
}
