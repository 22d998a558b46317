// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! On-file layout of the map.
//!
//! The backing region is statically partitioned:
//!
//! ```text
//! +---------------+-----------------+--------+--------+-     -+--------+
//! | Global header | Segment headers | Tier 0 | Tier 1 |  ...  | Tier N |
//! |   4096 bytes  |  64 bytes each  |        |        |       |        |
//! +---------------+-----------------+--------+--------+-     -+--------+
//! ```
//!
//! Tier `i` for `i < nseg` is the resident tier 0 of segment `i`; the
//! remaining tiers form the shared overflow pool. Each tier is itself
//! partitioned into a 64 byte tier header (chain link), the entry free
//! bitmap, the hash slot array, and the entry arena.
//!
//! All offsets are computed from the geometry recorded in the global header,
//! so every process mapping the same file derives identical addresses. The
//! magic word is written last during initialization and acts as the creation
//! commit point: a reopening process that observes the magic observes a fully
//! initialized file.

use crate::entry::ENTRY_HDR_SIZE;
use crate::error::ShmapError;
use crate::hashlookup::MAX_ARENA_CAP;

use core::sync::atomic::{AtomicU64, Ordering};

/// "shmap001" as a little-endian u64
pub(crate) const MAGIC: u64 = 0x3130_3070_616d_6873;
pub(crate) const FORMAT_VERSION: u64 = 1;

pub(crate) const GLOBAL_HEADER_SIZE: usize = 4096;
pub(crate) const SEG_HEADER_SIZE: usize = 64;
pub(crate) const TIER_HEADER_SIZE: usize = 64;

// global header field offsets
pub(crate) const OFF_MAGIC: usize = 0;
pub(crate) const OFF_VERSION: usize = 8;
pub(crate) const OFF_NSEG: usize = 16;
pub(crate) const OFF_TIER_SLOTS: usize = 24;
pub(crate) const OFF_ARENA_CAP: usize = 32;
pub(crate) const OFF_ENTRY_SIZE: usize = 40;
pub(crate) const OFF_TOTAL_TIERS: usize = 48;
pub(crate) const OFF_TIER_CURSOR: usize = 56;
pub(crate) const OFF_REPLICATION: usize = 64;
pub(crate) const OFF_SCHEMA_DIGEST: usize = 72;

/// Replication word: bit 8 set when replication is enabled, bits 0..8 hold
/// the node identifier.
const REPLICATION_ENABLED: u64 = 0x100;

/// Sizing of every region in the file. Fixed for the life of the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    /// Number of segments
    pub nseg: u64,
    /// Hash slots per tier, power of two
    pub tier_slots: u64,
    /// Entry arena capacity per tier
    pub arena_cap: u64,
    /// Size of one entry slot in the arena, in bytes, multiple of 8
    pub entry_size: u64,
    /// Total tiers in the file: `nseg` resident tiers plus the overflow pool
    pub total_tiers: u64,
}

impl Geometry {
    pub fn validate(&self) -> Result<(), ShmapError> {
        let bad = |reason: &str| -> Result<(), ShmapError> {
            Err(ShmapError::BadHeader {
                reason: reason.to_string(),
            })
        };

        if self.nseg == 0 {
            return bad("segment count must be non-zero");
        }
        if !self.tier_slots.is_power_of_two() || self.tier_slots < 2 {
            return bad("tier slots must be a power of two and at least 2");
        }
        // at least one hash slot must always stay empty so that linear probes
        // terminate within a tier
        if self.arena_cap == 0 || self.arena_cap >= self.tier_slots {
            return bad("arena capacity must be in 1..tier_slots");
        }
        if self.arena_cap > MAX_ARENA_CAP as u64 {
            return bad("arena capacity exceeds the entry position encoding");
        }
        if self.entry_size < (ENTRY_HDR_SIZE + 8) as u64 || self.entry_size % 8 != 0 {
            return bad("entry size must be a multiple of 8 with room for the entry header");
        }
        if self.total_tiers < self.nseg {
            return bad("total tiers must cover one resident tier per segment");
        }
        Ok(())
    }

    /// Words in the per-tier free bitmap
    pub fn bitmap_words(&self) -> usize {
        (self.arena_cap as usize + 63) / 64
    }

    /// Bytes reserved for the per-tier free bitmap, padded so the slot array
    /// which follows stays cacheline aligned
    pub fn bitmap_bytes(&self) -> usize {
        (self.bitmap_words() * 8 + 63) & !63
    }

    /// Size of one tier in bytes
    pub fn tier_bytes(&self) -> usize {
        TIER_HEADER_SIZE
            + self.bitmap_bytes()
            + self.tier_slots as usize * 8
            + self.arena_cap as usize * self.entry_size as usize
    }

    /// Total file size in bytes
    pub fn file_size(&self) -> usize {
        GLOBAL_HEADER_SIZE
            + self.nseg as usize * SEG_HEADER_SIZE
            + self.total_tiers as usize * self.tier_bytes()
    }

    /// Offset of the header for segment `seg`
    pub fn seg_header_offset(&self, seg: u64) -> usize {
        GLOBAL_HEADER_SIZE + seg as usize * SEG_HEADER_SIZE
    }

    /// Offset of tier `tier`
    pub fn tier_offset(&self, tier: u64) -> usize {
        GLOBAL_HEADER_SIZE + self.nseg as usize * SEG_HEADER_SIZE + tier as usize * self.tier_bytes()
    }

    /// Offset of the free bitmap within a tier
    pub fn tier_bitmap_offset(&self) -> usize {
        TIER_HEADER_SIZE
    }

    /// Offset of the hash slot array within a tier
    pub fn tier_slots_offset(&self) -> usize {
        TIER_HEADER_SIZE + self.bitmap_bytes()
    }

    /// Offset of the entry arena within a tier
    pub fn tier_arena_offset(&self) -> usize {
        self.tier_slots_offset() + self.tier_slots as usize * 8
    }
}

/// Everything recorded in the global header.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HeaderParams {
    pub geometry: Geometry,
    /// Node identifier when replication is enabled
    pub node: Option<u8>,
    pub schema_digest: [u8; 16],
}

/// Borrow a shared word of the mapped region as an atomic.
///
/// # Safety
///
/// `base + offset` must be within the mapped region and 8 byte aligned. The
/// returned reference must not outlive the mapping.
#[inline]
pub(crate) unsafe fn atomic_at<'a>(base: *mut u8, offset: usize) -> &'a AtomicU64 {
    &*(base.add(offset) as *const AtomicU64)
}

#[inline]
unsafe fn read_u64(base: *const u8, offset: usize) -> u64 {
    (base.add(offset) as *const u64).read()
}

#[inline]
unsafe fn write_u64(base: *mut u8, offset: usize, value: u64) {
    (base.add(offset) as *mut u64).write(value)
}

/// Write the global header into a freshly zeroed region. The magic word is
/// stored last, with release ordering, as the creation commit point.
///
/// # Safety
///
/// `base` must point at a writable region of at least
/// `params.geometry.file_size()` bytes.
pub(crate) unsafe fn write_header(base: *mut u8, params: &HeaderParams) {
    let g = &params.geometry;
    write_u64(base, OFF_VERSION, FORMAT_VERSION);
    write_u64(base, OFF_NSEG, g.nseg);
    write_u64(base, OFF_TIER_SLOTS, g.tier_slots);
    write_u64(base, OFF_ARENA_CAP, g.arena_cap);
    write_u64(base, OFF_ENTRY_SIZE, g.entry_size);
    write_u64(base, OFF_TOTAL_TIERS, g.total_tiers);
    // the first `nseg` tiers are the resident tiers; the pool cursor starts
    // right after them
    write_u64(base, OFF_TIER_CURSOR, g.nseg);
    let replication = match params.node {
        Some(id) => REPLICATION_ENABLED | id as u64,
        None => 0,
    };
    write_u64(base, OFF_REPLICATION, replication);
    std::ptr::copy_nonoverlapping(
        params.schema_digest.as_ptr(),
        base.add(OFF_SCHEMA_DIGEST),
        params.schema_digest.len(),
    );
    atomic_at(base, OFF_MAGIC).store(MAGIC, Ordering::Release);
}

/// Read and validate the global header of an existing file.
///
/// # Safety
///
/// `base` must point at a readable region of at least `file_size` bytes.
pub(crate) unsafe fn read_header(
    base: *const u8,
    file_size: usize,
) -> Result<HeaderParams, ShmapError> {
    let bad = |reason: String| ShmapError::BadHeader { reason };

    if file_size < GLOBAL_HEADER_SIZE {
        return Err(bad("file smaller than the global header".to_string()));
    }
    let magic = atomic_at(base as *mut u8, OFF_MAGIC).load(Ordering::Acquire);
    if magic != MAGIC {
        return Err(bad(format!("magic mismatch: {:#018x}", magic)));
    }
    let version = read_u64(base, OFF_VERSION);
    if version != FORMAT_VERSION {
        return Err(bad(format!("unsupported format version: {}", version)));
    }

    let geometry = Geometry {
        nseg: read_u64(base, OFF_NSEG),
        tier_slots: read_u64(base, OFF_TIER_SLOTS),
        arena_cap: read_u64(base, OFF_ARENA_CAP),
        entry_size: read_u64(base, OFF_ENTRY_SIZE),
        total_tiers: read_u64(base, OFF_TOTAL_TIERS),
    };
    geometry.validate()?;
    if geometry.file_size() != file_size {
        return Err(bad(format!(
            "geometry implies {} bytes but the file has {}",
            geometry.file_size(),
            file_size
        )));
    }

    let replication = read_u64(base, OFF_REPLICATION);
    let node = if replication & REPLICATION_ENABLED != 0 {
        Some((replication & 0xFF) as u8)
    } else {
        None
    };

    let mut schema_digest = [0u8; 16];
    std::ptr::copy_nonoverlapping(
        base.add(OFF_SCHEMA_DIGEST),
        schema_digest.as_mut_ptr(),
        schema_digest.len(),
    );

    Ok(HeaderParams {
        geometry,
        node,
        schema_digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            nseg: 4,
            tier_slots: 128,
            arena_cap: 96,
            entry_size: 256,
            total_tiers: 8,
        }
    }

    #[test]
    fn offsets_are_aligned() {
        let g = geometry();
        g.validate().unwrap();
        assert_eq!(g.seg_header_offset(0) % 64, 0);
        assert_eq!(g.tier_offset(0) % 8, 0);
        assert_eq!(g.tier_slots_offset() % 64, 0);
        assert_eq!(g.tier_arena_offset() % 8, 0);
        assert_eq!(g.tier_offset(1) - g.tier_offset(0), g.tier_bytes());
    }

    // an 8 byte aligned region, the way the datapools provide one
    fn region(bytes: usize) -> Vec<u64> {
        vec![0u64; (bytes + 7) / 8]
    }

    #[test]
    fn header_round_trip() {
        let g = geometry();
        let params = HeaderParams {
            geometry: g,
            node: Some(7),
            schema_digest: [3; 16],
        };
        let mut region = region(g.file_size());
        let base = region.as_mut_ptr() as *mut u8;
        unsafe {
            write_header(base, &params);
            let read = read_header(base as *const u8, g.file_size()).unwrap();
            assert_eq!(read.geometry, g);
            assert_eq!(read.node, Some(7));
            assert_eq!(read.schema_digest, [3; 16]);
        }
    }

    #[test]
    fn rejects_unwritten_header() {
        let g = geometry();
        let region = region(g.file_size());
        assert!(
            unsafe { read_header(region.as_ptr() as *const u8, g.file_size()) }.is_err()
        );
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut g = geometry();
        g.arena_cap = g.tier_slots;
        assert!(g.validate().is_err());
        g = geometry();
        g.tier_slots = 100;
        assert!(g.validate().is_err());
    }
}
