// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Byte arenas used as the backing memory for segment storage.
//!
//! A datapool is one contiguous, page-aligned region. [`Memory`] is an
//! anonymous mapping which is lost on exit. [`MmapFile`] maps a file which
//! starts with a one page [`Header`], so an arena which was flushed on a clean
//! shutdown can be opened again and verified.

use blake3::Hash;
use core::ops::Range;
use std::fs::OpenOptions;
use std::io::Error;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::{MmapMut, MmapOptions};

const PAGE_SIZE: usize = 4096;
const HEADER_SIZE: usize = core::mem::size_of::<Header>();
const MAGIC: [u8; 8] = *b"SEGARENA";

// NOTE: this must be incremented if there are breaking changes to the on-disk
// format
const VERSION: u64 = 1;

mod memory;
mod mmap_file;

pub use memory::Memory;
pub use mmap_file::MmapFile;

/// The datapool trait defines the abstraction that each datapool implementation
/// should conform to.
#[allow(clippy::len_without_is_empty)]
pub trait Datapool: Send {
    /// Immutable borrow of the data within the datapool
    fn as_slice(&self) -> &[u8];

    /// Mutable borrow of the data within the datapool
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Performs any actions necessary to persist the data to the backing store.
    /// This may be a no-op for datapools which cannot persist data.
    fn flush(&mut self) -> Result<(), std::io::Error>;

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// Round `size` bytes up to a whole number of pages.
fn page_align(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Touch one byte in every page so that the whole range is faulted in.
fn prefault(region: &mut [u8]) {
    let mut offset = 0;
    while offset < region.len() {
        region[offset] = 0;
        offset += PAGE_SIZE;
    }
}

// NOTE: make sure this is a whole number of pages and that all fields which are
// accessed are properly aligned to avoid undefined behavior.
/// The first page of a file-backed datapool.
#[repr(C, packed)]
pub struct Header {
    checksum: [u8; 32],
    magic: [u8; 8],
    version: u64,
    user_version: u64,
    data_size: u64,
    flushed_at: u64,
    _pad: [u8; 4024],
}

impl Header {
    fn new(user_version: u64, data_size: usize) -> Self {
        let flushed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            checksum: [0; 32],
            magic: MAGIC,
            version: VERSION,
            user_version,
            data_size: data_size as u64,
            flushed_at,
            _pad: [0; 4024],
        }
    }

    /// Copy a header out of the first page of a mapping.
    fn read_from(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= HEADER_SIZE);
        // SAFETY: the header is plain old data, packed, and the source holds
        // at least HEADER_SIZE bytes
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Header) }
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts((self as *const Header) as *const u8, HEADER_SIZE) }
    }

    fn set_checksum(&mut self, hash: Hash) {
        self.checksum.copy_from_slice(&hash.as_bytes()[0..32]);
    }

    fn zero_checksum(&mut self) {
        self.checksum = [0; 32];
    }

    /// Checksum over the header, with a zeroed checksum field, followed by
    /// the data region.
    fn digest(&self, data: &[u8]) -> Hash {
        let mut header = Header::read_from(self.as_bytes());
        header.zero_checksum();

        let mut hasher = blake3::Hasher::new();
        hasher.update(header.as_bytes());
        hasher.update(data);
        hasher.finalize()
    }

    fn check(&self, user_version: u64, data_size: usize) -> Result<(), std::io::Error> {
        if self.magic != MAGIC {
            return Err(Error::other("header is not recognized"));
        }
        let version = self.version;
        if version != VERSION {
            return Err(Error::other("file has incompatible version"));
        }
        let stored = self.user_version;
        if stored != user_version {
            return Err(Error::other("user version mismatch"));
        }
        let stored = self.data_size;
        if stored != data_size as u64 {
            return Err(Error::other("data size mismatch"));
        }
        Ok(())
    }

    /// The layout version of the data, as given by the owner of the pool.
    pub fn user_version(&self) -> u64 {
        self.user_version
    }

    /// Seconds since the unix epoch at which the pool was last flushed.
    pub fn flushed_at(&self) -> u64 {
        self.flushed_at
    }
}
