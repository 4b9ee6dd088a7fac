// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Items are the base unit of data stored within the cache. Each item lives
//! inside a segment and is laid out as a fixed header followed by the optional
//! metadata, the key, and the value. Items are padded out to a multiple of
//! 8 bytes so that offsets can be stored in 8-byte units in the hash table.
//!
//! ```text
//! ┌──────────┬──────────┬──────┬──────┬───────┬─────┐
//! │  MAGIC   │   VLEN   │ KLEN │ OLEN │ FLAGS │ PAD │
//! │  32 bit  │  32 bit  │ 8bit │ 8bit │ 8 bit │8 bit│
//! ├──────────┼──────────┼──────┴──────┴───────┴─────┤
//! │CREATE_AT │EXPIRE_AT │             CAS             │
//! │  32 bit  │  32 bit  │            32 bit           │
//! ├──────────┴──────────┴─────────────────────────────┤
//! │      OPTIONAL       │     KEY     │     VALUE     │
//! └─────────────────────┴─────────────┴───────────────┘
//! ```

use crate::segments::SegmentRef;

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

pub(crate) const ITEM_HDR_SIZE: usize = 24;
pub(crate) const ITEM_MAGIC: u32 = 0x0EED_FACE;

const MAGIC_OFFSET: usize = 0;
const VLEN_OFFSET: usize = 4;
const KLEN_OFFSET: usize = 8;
const OLEN_OFFSET: usize = 9;
const FLAGS_OFFSET: usize = 10;
const CREATE_AT_OFFSET: usize = 12;
const EXPIRE_AT_OFFSET: usize = 16;
const CAS_OFFSET: usize = 20;

const DELETED_FLAG: u8 = 0x01;

/// Total size of an item with the given lengths, including the header and
/// padding.
pub(crate) fn item_size(klen: usize, vlen: usize, olen: usize) -> usize {
    let size = ITEM_HDR_SIZE + klen + vlen + olen;
    (size + 7) & !7
}

/// Like [`item_size`] for untrusted lengths. Returns `None` if the lengths
/// cannot be stored in an item header or the size overflows.
pub(crate) fn checked_item_size(klen: usize, vlen: usize, olen: usize) -> Option<usize> {
    if klen > u8::MAX as usize || olen > u8::MAX as usize || vlen > u32::MAX as usize {
        return None;
    }
    ITEM_HDR_SIZE
        .checked_add(klen)?
        .checked_add(olen)?
        .checked_add(vlen)?
        .checked_add(7)
        .map(|size| size & !7)
}

/// A view of item memory inside the arena. This does not keep the memory
/// alive; callers must hold a reference on the owning segment for as long as
/// the view is in use.
#[derive(Clone, Copy)]
pub(crate) struct RawItem {
    data: *mut u8,
}

impl RawItem {
    /// # Safety
    ///
    /// `data` must point to at least `ITEM_HDR_SIZE` bytes, 8-byte aligned,
    /// within a segment's data region. Any fields beyond the header may only
    /// be read once the header says they are present.
    pub(crate) unsafe fn from_ptr(data: *mut u8) -> Self {
        Self { data }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile(self.data.add(offset) as *const u32) }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile(self.data.add(offset) as *mut u32, value) }
    }

    fn read_u8(&self, offset: usize) -> u8 {
        unsafe { core::ptr::read_volatile(self.data.add(offset)) }
    }

    fn magic_atomic(&self) -> &AtomicU32 {
        unsafe { &*(self.data.add(MAGIC_OFFSET) as *const AtomicU32) }
    }

    fn flags_atomic(&self) -> &AtomicU8 {
        unsafe { &*(self.data.add(FLAGS_OFFSET) as *const AtomicU8) }
    }

    /// Returns true once the header has been completely written.
    pub(crate) fn is_defined(&self) -> bool {
        self.magic_atomic().load(Ordering::Acquire) == ITEM_MAGIC
    }

    pub(crate) fn klen(&self) -> usize {
        self.read_u8(KLEN_OFFSET) as usize
    }

    pub(crate) fn olen(&self) -> usize {
        self.read_u8(OLEN_OFFSET) as usize
    }

    pub(crate) fn vlen(&self) -> usize {
        self.read_u32(VLEN_OFFSET) as usize
    }

    pub(crate) fn create_at(&self) -> u32 {
        self.read_u32(CREATE_AT_OFFSET)
    }

    pub(crate) fn expire_at(&self) -> u32 {
        self.read_u32(EXPIRE_AT_OFFSET)
    }

    pub(crate) fn cas(&self) -> u32 {
        self.read_u32(CAS_OFFSET)
    }

    /// Total size of the item, including header and padding.
    pub(crate) fn size(&self) -> usize {
        item_size(self.klen(), self.vlen(), self.olen())
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.flags_atomic().load(Ordering::Acquire) & DELETED_FLAG != 0
    }

    /// Mark the item as logically deleted. Returns true if this call set the
    /// tombstone.
    pub(crate) fn tombstone(&self) -> bool {
        self.flags_atomic().fetch_or(DELETED_FLAG, Ordering::AcqRel) & DELETED_FLAG == 0
    }

    pub(crate) fn optional(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data.add(ITEM_HDR_SIZE), self.olen()) }
    }

    pub(crate) fn key(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self.data.add(ITEM_HDR_SIZE + self.olen()), self.klen())
        }
    }

    pub(crate) fn value(&self) -> &[u8] {
        let offset = ITEM_HDR_SIZE + self.olen() + self.klen();
        unsafe { core::slice::from_raw_parts(self.data.add(offset), self.vlen()) }
    }

    /// # Safety
    ///
    /// The caller must be the only writer of this item, which holds for the
    /// thread which reserved it until it is inserted.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn optional_mut(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.data.add(ITEM_HDR_SIZE), self.olen())
    }

    /// # Safety
    ///
    /// See [`RawItem::optional_mut`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn value_mut(&self) -> &mut [u8] {
        let offset = ITEM_HDR_SIZE + self.olen() + self.klen();
        core::slice::from_raw_parts_mut(self.data.add(offset), self.vlen())
    }

    /// Writes the header and key. The magic is stored last so that a
    /// concurrent scan never sees a partially written header as valid.
    pub(crate) fn define(
        &self,
        key: &[u8],
        vlen: usize,
        olen: usize,
        create_at: u32,
        expire_at: u32,
        cas: u32,
    ) {
        debug_assert!(!key.is_empty() && key.len() <= u8::MAX as usize);
        debug_assert!(olen <= u8::MAX as usize);
        self.write_u32(VLEN_OFFSET, vlen as u32);
        unsafe {
            core::ptr::write_volatile(self.data.add(KLEN_OFFSET), key.len() as u8);
            core::ptr::write_volatile(self.data.add(OLEN_OFFSET), olen as u8);
        }
        self.flags_atomic().store(0, Ordering::Relaxed);
        self.write_u32(CREATE_AT_OFFSET, create_at);
        self.write_u32(EXPIRE_AT_OFFSET, expire_at);
        self.write_u32(CAS_OFFSET, cas);
        unsafe {
            core::ptr::copy_nonoverlapping(
                key.as_ptr(),
                self.data.add(ITEM_HDR_SIZE + olen),
                key.len(),
            );
        }
        self.magic_atomic().store(ITEM_MAGIC, Ordering::Release);
    }

    /// Copies this item verbatim to `dst`, clearing any flags. Used when
    /// compacting segments.
    ///
    /// # Safety
    ///
    /// `dst` must have room for `self.size()` bytes and must not be visible to
    /// any other thread yet.
    pub(crate) unsafe fn copy_to(&self, dst: *mut u8) {
        let size = self.size();
        core::ptr::copy_nonoverlapping(self.data, dst, size);
        let copy = RawItem::from_ptr(dst);
        copy.flags_atomic().store(0, Ordering::Release);
    }
}

/// A read handle on an item returned from [`crate::Seg::get`]. The item's
/// memory stays valid for the lifetime of this handle, which holds a reader
/// reference on the owning segment.
///
/// Handles should be dropped promptly: a segment cannot be reclaimed while a
/// handle on one of its items is alive.
pub struct Item<'a> {
    raw: RawItem,
    _guard: SegmentRef<'a>,
}

impl<'a> Item<'a> {
    pub(crate) fn new(raw: RawItem, guard: SegmentRef<'a>) -> Self {
        Self { raw, _guard: guard }
    }

    pub fn key(&self) -> &[u8] {
        self.raw.key()
    }

    pub fn value(&self) -> &[u8] {
        self.raw.value()
    }

    pub fn optional(&self) -> Option<&[u8]> {
        if self.raw.olen() > 0 {
            Some(self.raw.optional())
        } else {
            None
        }
    }

    /// The version of this item, usable with [`crate::Seg::cas`].
    pub fn cas(&self) -> u32 {
        self.raw.cas()
    }

    /// Time, in clock seconds, at which the item was written.
    pub fn create_at(&self) -> u32 {
        self.raw.create_at()
    }

    /// Time, in clock seconds, at which the item was requested to expire.
    pub fn expire_at(&self) -> u32 {
        self.raw.expire_at()
    }
}

impl<'a> std::fmt::Debug for Item<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Item")
            .field("cas", &self.cas())
            .field("key", &self.key())
            .field("value", &self.value())
            .finish()
    }
}

/// Space reserved for a new item which has not been linked into the hash table
/// yet. The value and optional bytes should be filled in before passing the
/// handle to [`crate::Seg::insert`] or [`crate::Seg::cas`]. Dropping the
/// handle without inserting marks the space dead.
pub struct ReservedItem<'a> {
    raw: RawItem,
    seg_id: u32,
    offset: u32,
    guard: SegmentRef<'a>,
    linked: bool,
}

impl<'a> ReservedItem<'a> {
    pub(crate) fn new(raw: RawItem, seg_id: u32, offset: u32, guard: SegmentRef<'a>) -> Self {
        Self {
            raw,
            seg_id,
            offset,
            guard,
            linked: false,
        }
    }

    pub fn key(&self) -> &[u8] {
        self.raw.key()
    }

    pub fn value(&self) -> &[u8] {
        self.raw.value()
    }

    pub fn value_mut(&mut self) -> &mut [u8] {
        // SAFETY: the reserving thread is the only writer until insert
        unsafe { self.raw.value_mut() }
    }

    pub fn optional_mut(&mut self) -> &mut [u8] {
        // SAFETY: the reserving thread is the only writer until insert
        unsafe { self.raw.optional_mut() }
    }

    /// The version this item will have once inserted.
    pub fn cas(&self) -> u32 {
        self.raw.cas()
    }

    pub(crate) fn seg_id(&self) -> u32 {
        self.seg_id
    }

    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    /// Marks the reservation as consumed by the hash table.
    pub(crate) fn set_linked(&mut self) {
        self.linked = true;
    }
}

impl<'a> Drop for ReservedItem<'a> {
    fn drop(&mut self) {
        if !self.linked && self.raw.tombstone() {
            self.guard.header().release_item(self.raw.size());
        }
    }
}
