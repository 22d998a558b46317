// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Entries are the base unit of data stored within the map.
//!
//! An entry occupies one fixed-size slot of a tier's arena and is addressed
//! by its entry position. The serialized form is a 24 byte header followed by
//! the key bytes and then the value bytes:
//!
//! ```text
//! ┌──────┬─────┬──────┬──────┬─────────────┬─────────────┬─────┬───────┐
//! │ KLEN │FLAGS│ORIGIN│ VLEN │   ORIGIN    │  CHECKSUM   │ KEY │ VALUE │
//! │      │     │  ID  │      │  TIMESTAMP  │             │     │       │
//! │16 bit│8 bit│8 bit │32 bit│   64 bit    │   64 bit    │     │       │
//! └──────┴─────┴──────┴──────┴─────────────┴─────────────┴─────┴───────┘
//! ```
//!
//! The origin timestamp and identifier are the replication metadata; on maps
//! built without replication they stay zero. A tombstone is an entry whose
//! tombstone flag is set: it is invisible to lookups but keeps its key and
//! metadata so the replication acceptance rule can compare against it.

use crate::error::ShmapError;

use ahash::RandomState;
use core::hash::{BuildHasher, Hasher};

pub(crate) const ENTRY_HDR_SIZE: usize = 24;

/// Entry flag: the entry is a tombstone left by a replicated removal
pub(crate) const FLAG_TOMBSTONE: u8 = 0x01;

/// Replication metadata carried by every entry of a replicated map.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct OriginMeta {
    /// Wall-clock microseconds of the originating write
    pub ts: u64,
    /// Identifier of the originating node
    pub id: u8,
}

#[repr(C)]
struct EntryHeader {
    klen: u16,
    flags: u8,
    origin_id: u8,
    vlen: u32,
    origin_ts: u64,
    checksum: u64,
}

/// The raw byte-level representation of an entry inside the arena.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct RawEntry {
    data: *mut u8,
    size: usize,
}

impl RawEntry {
    /// Create a `RawEntry` from a pointer to an arena slot of `size` bytes.
    ///
    /// # Safety
    ///
    /// `data` must be 64bit aligned and point at `size` valid bytes. It is up
    /// to the caller to ensure the slot actually holds a defined entry before
    /// reading through the returned value.
    pub(crate) unsafe fn from_ptr(data: *mut u8, size: usize) -> RawEntry {
        Self { data, size }
    }

    fn header(&self) -> &EntryHeader {
        unsafe { &*(self.data as *const EntryHeader) }
    }

    fn header_mut(&mut self) -> *mut EntryHeader {
        self.data as *mut EntryHeader
    }

    /// Returns the key length
    #[inline]
    pub(crate) fn klen(&self) -> usize {
        self.header().klen as usize
    }

    /// Returns the value length
    #[inline]
    pub(crate) fn vlen(&self) -> usize {
        self.header().vlen as usize
    }

    #[inline]
    pub(crate) fn is_tombstone(&self) -> bool {
        self.header().flags & FLAG_TOMBSTONE != 0
    }

    /// Borrow the key
    pub(crate) fn key(&self) -> &[u8] {
        unsafe {
            let ptr = self.data.add(self.key_offset());
            std::slice::from_raw_parts(ptr, self.klen())
        }
    }

    /// Borrow the value
    pub(crate) fn value(&self) -> &[u8] {
        unsafe {
            let ptr = self.data.add(self.value_offset());
            std::slice::from_raw_parts(ptr, self.vlen())
        }
    }

    /// Replication metadata of this entry
    pub(crate) fn meta(&self) -> OriginMeta {
        let header = self.header();
        OriginMeta {
            ts: header.origin_ts,
            id: header.origin_id,
        }
    }

    pub(crate) fn set_meta(&mut self, meta: OriginMeta) {
        unsafe {
            (*self.header_mut()).origin_ts = meta.ts;
            (*self.header_mut()).origin_id = meta.id;
        }
    }

    /// Whether a key/value pair fits into an entry slot of `size` bytes
    #[inline]
    pub(crate) const fn fits(size: usize, klen: usize, vlen: usize) -> bool {
        ENTRY_HDR_SIZE + klen + vlen <= size
    }

    /// Check that a key/value pair fits an entry slot of `size` bytes and the
    /// length fields of the header, otherwise fail before any byte is
    /// written.
    pub(crate) fn check_fits(size: usize, klen: usize, vlen: usize) -> Result<(), ShmapError> {
        if klen <= u16::MAX as usize && Self::fits(size, klen, vlen) {
            Ok(())
        } else {
            Err(ShmapError::EntryOversized {
                size: ENTRY_HDR_SIZE + klen + vlen,
                max: size,
            })
        }
    }

    /// Copy a key/value pair and its metadata into the entry, clearing any
    /// tombstone flag. The caller must have checked the sizes with
    /// [`Self::check_fits`] and must hold the segment's write lock.
    pub(crate) fn define(&mut self, key: &[u8], value: &[u8], meta: OriginMeta) {
        debug_assert!(Self::fits(self.size, key.len(), value.len()));
        unsafe {
            (*self.header_mut()).klen = key.len() as u16;
            (*self.header_mut()).flags = 0;
            (*self.header_mut()).origin_id = meta.id;
            (*self.header_mut()).vlen = value.len() as u32;
            (*self.header_mut()).origin_ts = meta.ts;
            (*self.header_mut()).checksum = 0;
            std::ptr::copy_nonoverlapping(key.as_ptr(), self.data.add(self.key_offset()), key.len());
            std::ptr::copy_nonoverlapping(
                value.as_ptr(),
                self.data.add(self.value_offset()),
                value.len(),
            );
        }
    }

    /// Turn a live entry into a tombstone carrying the given metadata. The
    /// key and value bytes are retained.
    pub(crate) fn make_tombstone(&mut self, meta: OriginMeta) {
        unsafe {
            (*self.header_mut()).flags |= FLAG_TOMBSTONE;
        }
        self.set_meta(meta);
    }

    pub(crate) fn stored_checksum(&self) -> u64 {
        self.header().checksum
    }

    pub(crate) fn set_checksum(&mut self, checksum: u64) {
        unsafe {
            (*self.header_mut()).checksum = checksum;
        }
    }

    /// Checksum over the key and value bytes as currently stored
    pub(crate) fn compute_checksum(&self) -> u64 {
        checksum(self.key(), self.value())
    }

    pub(crate) fn verify_checksum(&self) -> bool {
        self.stored_checksum() == self.compute_checksum()
    }

    // Gets the offset to the key
    #[inline]
    fn key_offset(&self) -> usize {
        ENTRY_HDR_SIZE
    }

    // Gets the offset to the value
    #[inline]
    fn value_offset(&self) -> usize {
        self.key_offset() + self.klen()
    }
}

impl std::fmt::Debug for RawEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        f.debug_struct("RawEntry")
            .field("klen", &self.klen())
            .field("vlen", &self.vlen())
            .field("tombstone", &self.is_tombstone())
            .field("meta", &self.meta())
            .finish()
    }
}

// The checksum hasher uses fixed seeds so that every process computes the
// same checksum for the same bytes. The seeds differ from the lookup hash
// seeds so slot placement and checksums stay uncorrelated.
fn checksum_hasher() -> RandomState {
    RandomState::with_seeds(
        0x9ae16a3b2f90404f,
        0xc3a5c85c97cb3127,
        0xb492b66fbe98f273,
        0x9ae16a3b2f90404f,
    )
}

/// Checksum over a key/value pair
pub(crate) fn checksum(key: &[u8], value: &[u8]) -> u64 {
    let mut hasher = checksum_hasher().build_hasher();
    hasher.write(key);
    hasher.write(value);
    hasher.finish()
}
