// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The segment arena. One contiguous region of memory is divided into
//! fixed-size segments. Each segment has a header kept outside of the arena
//! which tracks its write offset, live bytes and items, its position in a
//! chain, and the flags and reference counts used to reclaim it safely.
//!
//! A segment is always in exactly one of: the free pool, or one TTL bucket
//! chain. Both are doubly linked lists threaded through the `prev` and `next`
//! fields of the headers, and every structural edit to either is made while
//! holding the arena lock. Scans may read the links without the lock and must
//! tolerate seeing a chain mid-edit.

use crate::*;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, Ordering};
use datatier::Datapool;
use parking_lot::{Mutex, MutexGuard};

/// Sentinel for "no segment" in chain links.
pub(crate) const NO_SEG: i32 = -1;

/// Largest segment addressable by the hash table's 20-bit offset field, which
/// counts 8-byte units.
pub(crate) const MAX_SEGMENT_SIZE: usize = (1 << 20) * 8;

/// Largest number of segments addressable by the 24-bit segment id field.
pub(crate) const MAX_SEGMENTS: usize = 1 << 24;

/// Per-segment metadata.
pub(crate) struct SegmentHeader {
    id: u32,
    ttl: AtomicU32,
    create_at: AtomicU32,
    merge_at: AtomicU32,
    write_offset: AtomicU32,
    occupied: AtomicI64,
    n_item: AtomicI32,
    prev: AtomicI32,
    next: AtomicI32,
    accessible: AtomicBool,
    evictable: AtomicBool,
    r_refcount: AtomicU32,
    w_refcount: AtomicU32,
}

impl SegmentHeader {
    fn new(id: u32) -> Self {
        Self {
            id,
            ttl: AtomicU32::new(0),
            create_at: AtomicU32::new(0),
            merge_at: AtomicU32::new(0),
            write_offset: AtomicU32::new(0),
            occupied: AtomicI64::new(0),
            n_item: AtomicI32::new(0),
            prev: AtomicI32::new(NO_SEG),
            next: AtomicI32::new(NO_SEG),
            accessible: AtomicBool::new(false),
            evictable: AtomicBool::new(false),
            r_refcount: AtomicU32::new(0),
            w_refcount: AtomicU32::new(0),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn ttl(&self) -> u32 {
        self.ttl.load(Ordering::Acquire)
    }

    pub(crate) fn set_ttl(&self, ttl: u32) {
        self.ttl.store(ttl, Ordering::Release)
    }

    pub(crate) fn create_at(&self) -> u32 {
        self.create_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_create_at(&self, now: u32) {
        self.create_at.store(now, Ordering::Release)
    }

    pub(crate) fn merge_at(&self) -> u32 {
        self.merge_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_merge_at(&self, now: u32) {
        self.merge_at.store(now, Ordering::Release)
    }

    /// Returns true if every item in the segment has outlived the TTL of the
    /// segment.
    pub(crate) fn is_expired(&self, now: u32) -> bool {
        self.create_at().saturating_add(self.ttl()) <= now
    }

    pub(crate) fn write_offset(&self) -> u32 {
        self.write_offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_offset(&self, offset: u32) {
        self.write_offset.store(offset, Ordering::Release)
    }

    pub(crate) fn occupied(&self) -> i64 {
        self.occupied.load(Ordering::Acquire)
    }

    pub(crate) fn n_item(&self) -> i32 {
        self.n_item.load(Ordering::SeqCst)
    }

    pub(crate) fn prev(&self) -> Option<u32> {
        let id = self.prev.load(Ordering::Acquire);
        if id < 0 {
            None
        } else {
            Some(id as u32)
        }
    }

    pub(crate) fn next(&self) -> Option<u32> {
        let id = self.next.load(Ordering::Acquire);
        if id < 0 {
            None
        } else {
            Some(id as u32)
        }
    }

    /// Only to be called with the arena lock held.
    pub(crate) fn set_prev(&self, id: Option<u32>) {
        self.prev
            .store(id.map(|v| v as i32).unwrap_or(NO_SEG), Ordering::Release)
    }

    /// Only to be called with the arena lock held.
    pub(crate) fn set_next(&self, id: Option<u32>) {
        self.next
            .store(id.map(|v| v as i32).unwrap_or(NO_SEG), Ordering::Release)
    }

    pub(crate) fn is_accessible(&self) -> bool {
        self.accessible.load(Ordering::SeqCst)
    }

    pub(crate) fn set_accessible(&self, accessible: bool) {
        self.accessible.store(accessible, Ordering::SeqCst)
    }

    pub(crate) fn is_evictable(&self) -> bool {
        self.evictable.load(Ordering::Acquire)
    }

    pub(crate) fn set_evictable(&self, evictable: bool) {
        self.evictable.store(evictable, Ordering::Release)
    }

    /// Take exclusive ownership of the segment for reclamation or merging.
    /// Exactly one concurrent caller can win.
    pub(crate) fn try_claim(&self) -> bool {
        self.evictable
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.r_refcount.load(Ordering::SeqCst) + self.w_refcount.load(Ordering::SeqCst)
    }

    /// Atomically reserve `size` bytes at the end of the written region.
    /// Returns the offset of the reservation, or `None` if the segment does
    /// not have enough room left.
    pub(crate) fn reserve_space(&self, size: u32, segment_size: u32) -> Option<u32> {
        match cas_u32(&self.write_offset, 64, |current| {
            let end = current.checked_add(size)?;
            if end > segment_size {
                None
            } else {
                Some((end, current))
            }
        }) {
            Outcome::Success(offset) => Some(offset),
            Outcome::Contended | Outcome::Exhausted => None,
        }
    }

    /// Account for a new live item.
    pub(crate) fn add_item(&self, size: usize) {
        self.n_item.fetch_add(1, Ordering::SeqCst);
        self.occupied.fetch_add(size as i64, Ordering::AcqRel);
    }

    /// Account for an item which is no longer live.
    pub(crate) fn release_item(&self, size: usize) {
        let prev = self.n_item.fetch_sub(1, Ordering::SeqCst);
        let occupied = self.occupied.fetch_sub(size as i64, Ordering::AcqRel);
        if prev <= 0 || occupied < size as i64 {
            error!(
                "segment {} accounting went negative: items {} bytes {}",
                self.id,
                prev - 1,
                occupied - size as i64
            );
            debug_assert!(prev > 0, "negative item count on segment {}", self.id);
        }
    }

    fn reset(&self) {
        self.write_offset.store(0, Ordering::Release);
        self.occupied.store(0, Ordering::Release);
        self.n_item.store(0, Ordering::SeqCst);
    }

    pub(crate) fn info(&self) -> SegmentInfo {
        SegmentInfo {
            id: self.id,
            ttl: self.ttl(),
            create_at: self.create_at(),
            merge_at: self.merge_at(),
            write_offset: self.write_offset(),
            occupied: self.occupied().max(0) as u32,
            n_item: self.n_item().max(0) as u32,
            prev: self.prev(),
            next: self.next(),
            accessible: self.is_accessible(),
            evictable: self.is_evictable(),
        }
    }
}

/// A point-in-time snapshot of a segment's header, for diagnostics and for
/// external victim selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u32,
    pub ttl: u32,
    pub create_at: u32,
    pub merge_at: u32,
    pub write_offset: u32,
    pub occupied: u32,
    pub n_item: u32,
    pub prev: Option<u32>,
    pub next: Option<u32>,
    pub accessible: bool,
    pub evictable: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RefKind {
    Read,
    Write,
}

/// A reference on a segment. While any reference is held the segment's bytes
/// will not be reinitialized.
pub(crate) struct SegmentRef<'a> {
    header: &'a SegmentHeader,
    kind: RefKind,
}

impl<'a> SegmentRef<'a> {
    pub(crate) fn header(&self) -> &'a SegmentHeader {
        self.header
    }
}

impl<'a> Drop for SegmentRef<'a> {
    fn drop(&mut self) {
        match self.kind {
            RefKind::Read => self.header.r_refcount.fetch_sub(1, Ordering::SeqCst),
            RefKind::Write => self.header.w_refcount.fetch_sub(1, Ordering::SeqCst),
        };
    }
}

/// State protected by the arena lock. Holding the guard is required for
/// any change to the free pool or to segment chain links.
pub(crate) struct FreePool {
    head: i32,
    count: u32,
}

pub(crate) type ArenaGuard<'a> = MutexGuard<'a, FreePool>;

pub(crate) struct Segments {
    headers: Box<[SegmentHeader]>,
    data: NonNull<u8>,
    segment_size: u32,
    reserved: u32,
    free: AtomicU32,
    arena: Mutex<FreePool>,
    datapool: Mutex<Box<dyn Datapool>>,
}

// SAFETY: all access to the arena memory is coordinated through the segment
// headers' flags, reference counts, and the hash table bucket locks.
unsafe impl Send for Segments {}
unsafe impl Sync for Segments {}

impl Segments {
    /// Divide the datapool into segments, all of which start in the free pool.
    /// `reserved` free segments are held back for callers which ask for them
    /// explicitly.
    pub(crate) fn new(
        mut datapool: Box<dyn Datapool>,
        segment_size: usize,
        reserved: usize,
    ) -> Result<Self, SegError> {
        if segment_size < ITEM_HDR_SIZE + 8 || segment_size % 8 != 0 {
            return Err(SegError::Config(
                "segment size must be a multiple of 8 bytes and hold at least one item",
            ));
        }
        if segment_size > MAX_SEGMENT_SIZE {
            return Err(SegError::Config("segment size exceeds 8MB"));
        }

        let count = datapool.len() / segment_size;
        if count == 0 {
            return Err(SegError::Config("heap is smaller than one segment"));
        }
        if count > MAX_SEGMENTS {
            return Err(SegError::Config("too many segments"));
        }

        let data = NonNull::new(datapool.as_mut_slice().as_mut_ptr())
            .ok_or(SegError::Config("datapool has no memory"))?;

        let headers: Box<[SegmentHeader]> =
            (0..count as u32).map(SegmentHeader::new).collect();

        // thread every segment onto the free list in id order
        for id in 0..count {
            let header = &headers[id];
            header.set_prev(if id == 0 { None } else { Some(id as u32 - 1) });
            header.set_next(if id + 1 == count {
                None
            } else {
                Some(id as u32 + 1)
            });
        }

        info!(
            "arena of {} bytes divided into {} segments of {} bytes",
            count * segment_size,
            count,
            segment_size
        );

        Ok(Self {
            headers,
            data,
            segment_size: segment_size as u32,
            reserved: reserved as u32,
            free: AtomicU32::new(count as u32),
            arena: Mutex::new(FreePool {
                head: 0,
                count: count as u32,
            }),
            datapool: Mutex::new(datapool),
        })
    }

    pub(crate) fn lock(&self) -> ArenaGuard<'_> {
        self.arena.lock()
    }

    pub(crate) fn segment_size(&self) -> u32 {
        self.segment_size
    }

    pub(crate) fn count(&self) -> usize {
        self.headers.len()
    }

    pub(crate) fn free_count(&self) -> u32 {
        self.free.load(Ordering::Acquire)
    }

    pub(crate) fn reserved(&self) -> u32 {
        self.reserved
    }

    pub(crate) fn headers(&self) -> &[SegmentHeader] {
        &self.headers
    }

    pub(crate) fn header(&self, id: u32) -> &SegmentHeader {
        &self.headers[id as usize]
    }

    fn data_ptr(&self, id: u32) -> *mut u8 {
        debug_assert!((id as usize) < self.headers.len());
        // SAFETY: ids are bounded by the number of segments carved out of the
        // datapool, so the result stays within the mapping
        unsafe {
            self.data
                .as_ptr()
                .add(id as usize * self.segment_size as usize)
        }
    }

    /// A view of the item at `offset` within segment `id`.
    pub(crate) fn item(&self, id: u32, offset: u32) -> RawItem {
        debug_assert!(offset as usize + ITEM_HDR_SIZE <= self.segment_size as usize);
        // SAFETY: offset is within the segment and 8-byte aligned since all
        // items are padded to 8 bytes
        unsafe { RawItem::from_ptr(self.data_ptr(id).add(offset as usize)) }
    }

    /// Pointer to `offset` bytes into segment `id`.
    ///
    /// # Safety
    ///
    /// `offset` plus the length written must stay within the segment.
    pub(crate) unsafe fn raw(&self, id: u32, offset: u32) -> *mut u8 {
        self.data_ptr(id).add(offset as usize)
    }

    /// Take a reader reference on a segment, failing if it is not
    /// accessible. The increment happens before the check so that a
    /// concurrent reclaim either sees the reference or we see the flag.
    pub(crate) fn read_ref(&self, id: u32) -> Option<SegmentRef<'_>> {
        self.take_ref(id, RefKind::Read)
    }

    /// Take a writer reference on a segment, failing if it is not accessible.
    pub(crate) fn write_ref(&self, id: u32) -> Option<SegmentRef<'_>> {
        self.take_ref(id, RefKind::Write)
    }

    fn take_ref(&self, id: u32, kind: RefKind) -> Option<SegmentRef<'_>> {
        let header = self.headers.get(id as usize)?;
        match kind {
            RefKind::Read => header.r_refcount.fetch_add(1, Ordering::SeqCst),
            RefKind::Write => header.w_refcount.fetch_add(1, Ordering::SeqCst),
        };
        let guard = SegmentRef { header, kind };
        if header.is_accessible() {
            Some(guard)
        } else {
            None
        }
    }

    /// Busy-wait, yielding, until no references remain on the segment.
    pub(crate) fn wait_refcount(&self, id: u32) {
        let header = self.header(id);
        let mut spins = 0;
        while header.refcount() > 0 {
            if spins < 16 {
                backoff(spins);
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
        trace!("segment {} references drained", id);
    }

    /// Iterate over the defined items within a segment's written region. The
    /// scan stops at the first header which has not been written yet.
    pub(crate) fn items(&self, id: u32) -> SegmentItems<'_> {
        let end = self
            .header(id)
            .write_offset()
            .min(self.segment_size) as usize;
        SegmentItems {
            segments: self,
            id,
            offset: 0,
            end,
        }
    }

    /// Pop a segment from the free pool. Unless `use_reserved` is set, the
    /// last `reserved` free segments are not handed out.
    pub(crate) fn take_free(&self, arena: &mut ArenaGuard<'_>, use_reserved: bool) -> Option<u32> {
        if arena.count == 0 || (!use_reserved && arena.count <= self.reserved) {
            return None;
        }
        debug_assert!(arena.head != NO_SEG);
        let id = arena.head as u32;
        let header = self.header(id);

        arena.head = header.next().map(|v| v as i32).unwrap_or(NO_SEG);
        if let Some(next) = header.next() {
            self.header(next).set_prev(None);
        }
        arena.count -= 1;
        self.free.store(arena.count, Ordering::Release);
        header.set_next(None);
        header.set_prev(None);

        SEGMENT_FREE.decrement();
        trace!("took segment {} from free pool, {} left", id, arena.count);
        Some(id)
    }

    /// Push a segment onto the free pool. The segment must already be
    /// detached from any chain, unclaimed, and drained of references.
    pub(crate) fn push_free(&self, arena: &mut ArenaGuard<'_>, id: u32) {
        let header = self.header(id);
        debug_assert!(!header.is_evictable());

        header.set_accessible(false);
        let n_item = header.n_item();
        if n_item != 0 {
            warn!("segment {} returned to free pool with {} items", id, n_item);
        }
        header.reset();

        header.set_prev(None);
        if arena.head == NO_SEG {
            header.set_next(None);
        } else {
            header.set_next(Some(arena.head as u32));
            self.header(arena.head as u32).set_prev(Some(id));
        }
        arena.head = id as i32;
        arena.count += 1;
        self.free.store(arena.count, Ordering::Release);

        SEGMENT_FREE.increment();
        SEGMENT_RETURN.increment();
        trace!("returned segment {} to free pool, {} free", id, arena.count);
    }

    /// Walk the free pool. Requires the arena lock.
    pub(crate) fn free_list(&self, arena: &ArenaGuard<'_>) -> Vec<u32> {
        let mut ids = Vec::with_capacity(arena.count as usize);
        let mut current = arena.head;
        while current != NO_SEG && ids.len() <= self.count() {
            ids.push(current as u32);
            current = self
                .header(current as u32)
                .next()
                .map(|v| v as i32)
                .unwrap_or(NO_SEG);
        }
        ids
    }

    /// Prepare a segment taken from the free pool for writes. The segment is
    /// accessible afterwards but not evictable until it is linked into a
    /// chain.
    pub(crate) fn init(&self, id: u32, ttl: u32, now: u32) {
        let header = self.header(id);
        debug_assert_eq!(header.refcount(), 0);

        // SAFETY: a free segment has no references and no hash table entries,
        // so nothing can observe its bytes while they are cleared
        unsafe {
            core::ptr::write_bytes(self.data_ptr(id), 0, self.segment_size as usize);
        }

        header.reset();
        header.set_prev(None);
        header.set_next(None);
        header.set_ttl(ttl);
        header.set_create_at(now);
        header.set_merge_at(0);
        header.set_evictable(false);
        header.set_accessible(true);
    }

    /// Zero the unwritten tail of a segment.
    pub(crate) fn clear_tail(&self, id: u32) {
        let offset = self.header(id).write_offset().min(self.segment_size);
        // SAFETY: the range lies within the segment
        unsafe {
            core::ptr::write_bytes(
                self.data_ptr(id).add(offset as usize),
                0,
                (self.segment_size - offset) as usize,
            );
        }
    }

    pub(crate) fn flush(&self) -> Result<(), std::io::Error> {
        self.datapool.lock().flush()
    }
}

/// Iterator over `(offset, item)` pairs within a segment.
pub(crate) struct SegmentItems<'a> {
    segments: &'a Segments,
    id: u32,
    offset: usize,
    end: usize,
}

impl<'a> Iterator for SegmentItems<'a> {
    type Item = (u32, RawItem);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + ITEM_HDR_SIZE > self.end {
            return None;
        }
        let item = self.segments.item(self.id, self.offset as u32);
        if !item.is_defined() || item.klen() == 0 {
            return None;
        }
        let size = item.size();
        if self.offset + size > self.segments.segment_size as usize {
            error!(
                "corrupt item in segment {} at offset {}",
                self.id, self.offset
            );
            return None;
        }
        let offset = self.offset as u32;
        self.offset += size;
        Some((offset, item))
    }
}
