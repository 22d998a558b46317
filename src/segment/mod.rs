// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Segments are the independently lockable shards of the map. Each segment
//! owns a chain of tiers: tier 0 is resident at a fixed offset, overflow
//! tiers are drawn from a shared pool and linked through their tier headers.
//!
//! A `SegmentHeader` or `Tier` is a thin view over the mapped bytes; all the
//! real state lives in the file. Words which are read without holding the
//! segment lock (entry count, chain links) are accessed as atomics. The free
//! bitmap and the arena are mutated only under the segment's write lock, and
//! the lock release fences those writes for the next holder.

use crate::entry::RawEntry;
use crate::hashlookup::HashLookup;
use crate::layout::{atomic_at, Geometry, OFF_TIER_CURSOR, SEG_HEADER_SIZE};
use crate::ShmapError;

use core::sync::atomic::{AtomicU64, Ordering};

// segment header field offsets
const SEG_OFF_LOCK: usize = 0;
const SEG_OFF_COUNT: usize = 8;
const SEG_OFF_TAIL: usize = 16;
const SEG_OFF_VERSION: usize = 24;

// tier header field offsets
const TIER_OFF_NEXT: usize = 0;

/// View of one segment's header in the mapped region.
#[derive(Clone, Copy)]
pub(crate) struct SegmentHeader {
    base: *mut u8,
}

impl SegmentHeader {
    /// # Safety
    ///
    /// `map_base` must point at a live mapping laid out per `geometry` and
    /// `seg` must be a valid segment index.
    pub unsafe fn new(map_base: *mut u8, geometry: &Geometry, seg: u64) -> Self {
        debug_assert!(seg < geometry.nseg);
        Self {
            base: map_base.add(geometry.seg_header_offset(seg)),
        }
    }

    /// Pointer to the lock state word
    pub fn lock_word(&self) -> *mut u8 {
        unsafe { self.base.add(SEG_OFF_LOCK) }
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU64 {
        unsafe { atomic_at(self.base, offset) }
    }

    /// Live entries in this segment. Read without a lock, so the value may be
    /// stale by the time the caller looks at it.
    pub fn entry_count(&self) -> u64 {
        self.word(SEG_OFF_COUNT).load(Ordering::Relaxed)
    }

    pub fn increment_count(&self) {
        self.word(SEG_OFF_COUNT).fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_count(&self) {
        let prev = self.word(SEG_OFF_COUNT).fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    /// Index of the last tier in this segment's chain, the tier inserts go to
    pub fn chain_tail(&self) -> u64 {
        self.word(SEG_OFF_TAIL).load(Ordering::Acquire)
    }

    pub fn set_chain_tail(&self, tier: u64) {
        self.word(SEG_OFF_TAIL).store(tier, Ordering::Release);
    }

    /// Modification version, bumped on every mutation, for diagnostics
    #[cfg(any(test, feature = "debug"))]
    pub fn version(&self) -> u64 {
        self.word(SEG_OFF_VERSION).load(Ordering::Relaxed)
    }

    pub fn bump_version(&self) {
        self.word(SEG_OFF_VERSION).fetch_add(1, Ordering::Relaxed);
    }
}

/// View of one tier in the mapped region.
#[derive(Clone, Copy)]
pub(crate) struct Tier<'a> {
    base: *mut u8,
    geometry: &'a Geometry,
}

impl<'a> Tier<'a> {
    /// # Safety
    ///
    /// `map_base` must point at a live mapping laid out per `geometry` and
    /// `tier` must be a valid tier index.
    pub unsafe fn new(map_base: *mut u8, geometry: &'a Geometry, tier: u64) -> Self {
        debug_assert!(tier < geometry.total_tiers);
        Self {
            base: map_base.add(geometry.tier_offset(tier)),
            geometry,
        }
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU64 {
        unsafe { atomic_at(self.base, offset) }
    }

    /// The next tier in the chain. The link is published with release
    /// ordering when a fresh tier is appended, so a reader walking the chain
    /// either sees the terminator (and misses) or sees a fully initialized
    /// tier and continues probing. Zero terminates the chain: tier 0 is a
    /// resident tier and can never be chained.
    pub fn next_tier(&self) -> Option<u64> {
        let next = self.word(TIER_OFF_NEXT).load(Ordering::Acquire);
        if next == 0 {
            None
        } else {
            Some(next)
        }
    }

    /// Append a tier to the chain. Requires the segment's update or write
    /// lock; the new tier must already be initialized.
    pub fn set_next_tier(&self, tier: u64) {
        debug_assert!(tier != 0);
        self.word(TIER_OFF_NEXT).store(tier, Ordering::Release);
    }

    /// Base address of this tier's hash slot array
    pub fn slot_base(&self) -> *mut u8 {
        unsafe { self.base.add(self.geometry.tier_slots_offset()) }
    }

    /// The entry stored at `pos` in this tier's arena
    pub fn entry(&self, pos: u64) -> RawEntry {
        debug_assert!(pos < self.geometry.arena_cap);
        let entry_size = self.geometry.entry_size as usize;
        unsafe {
            RawEntry::from_ptr(
                self.base
                    .add(self.geometry.tier_arena_offset() + pos as usize * entry_size),
                entry_size,
            )
        }
    }

    #[inline]
    fn bitmap_word(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.geometry.bitmap_words());
        self.word(self.geometry.tier_bitmap_offset() + index * 8)
    }

    // bits at or beyond the arena capacity read as allocated so alloc never
    // hands them out
    fn occupancy(&self, index: usize) -> u64 {
        let word = self.bitmap_word(index).load(Ordering::Relaxed);
        let first_bit = index as u64 * 64;
        let cap = self.geometry.arena_cap;
        if first_bit + 64 <= cap {
            word
        } else if first_bit >= cap {
            u64::MAX
        } else {
            word | !((1u64 << (cap - first_bit)) - 1)
        }
    }

    /// Allocate the lowest free entry position, or `None` when the arena is
    /// full. Requires the segment's write lock.
    pub fn alloc(&self) -> Option<u64> {
        for index in 0..self.geometry.bitmap_words() {
            let occupancy = self.occupancy(index);
            if occupancy != u64::MAX {
                let bit = occupancy.trailing_ones() as u64;
                let word = self.bitmap_word(index);
                word.store(
                    word.load(Ordering::Relaxed) | (1 << bit),
                    Ordering::Relaxed,
                );
                return Some(index as u64 * 64 + bit);
            }
        }
        None
    }

    /// Free the entry position. Requires the segment's write lock.
    pub fn free(&self, pos: u64) {
        debug_assert!(pos < self.geometry.arena_cap);
        let word = self.bitmap_word(pos as usize / 64);
        let bit = 1u64 << (pos % 64);
        debug_assert!(word.load(Ordering::Relaxed) & bit != 0);
        word.store(word.load(Ordering::Relaxed) & !bit, Ordering::Relaxed);
    }

    /// Live entry positions in this tier's arena
    #[cfg(any(test, feature = "debug"))]
    pub fn live(&self) -> u64 {
        let mut live = 0;
        for index in 0..self.geometry.bitmap_words() {
            live += (!self.occupancy(index)).count_zeros() as u64;
        }
        // out-of-range bits counted as occupied
        live - (self.geometry.bitmap_words() as u64 * 64 - self.geometry.arena_cap)
    }

    /// Reset the tier to empty: clear the chain link and the bitmap, and fill
    /// the slot array with the unset pattern. Must only be called on a tier
    /// which is not yet reachable through any chain.
    pub fn reset(&self, hl: &HashLookup) {
        self.word(TIER_OFF_NEXT).store(0, Ordering::Relaxed);
        for index in 0..self.geometry.bitmap_words() {
            self.bitmap_word(index).store(0, Ordering::Relaxed);
        }
        unsafe { hl.clear_all(self.slot_base()) };
    }
}

/// Draw a fresh tier from the shared overflow pool by advancing the pool
/// cursor in the global header. Tiers are never returned to the pool while
/// the map is open, so the cursor only moves forward.
///
/// # Safety
///
/// `map_base` must point at a live mapping laid out per `geometry`.
pub(crate) unsafe fn acquire_tier(
    map_base: *mut u8,
    geometry: &Geometry,
) -> Result<u64, ShmapError> {
    let cursor = atomic_at(map_base, OFF_TIER_CURSOR);
    let tier = cursor.fetch_add(1, Ordering::AcqRel);
    if tier >= geometry.total_tiers {
        // park the cursor back at the cap; concurrent failures converge
        cursor.fetch_sub(1, Ordering::AcqRel);
        return Err(ShmapError::NoFreeTiers);
    }
    Ok(tier)
}

// keep the header layout honest: four u64 fields must fit the reserved space
const _: () = assert!(4 * 8 <= SEG_HEADER_SIZE);
