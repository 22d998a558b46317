// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The hash lookup is a compact open-addressed slot array used to find the
//! arena position of an entry from its key hash.
//!
//! Every tier carries one slot array of `S` slots, where `S` is a power of
//! two. A slot is a single 64 bit word packing the search key (the lower 48
//! bits of the key hash) together with the entry position in the tier's
//! arena:
//!
//! ```text
//! ┌────────────────────────────────────────────────┬────────────────┐
//! │                   SEARCH KEY                   │   ENTRY POS    │
//! │                                                │                │
//! │                     48 bit                     │     16 bit     │
//! │                                                │                │
//! │0                                             47│48            63│
//! └────────────────────────────────────────────────┴────────────────┘
//! ```
//!
//! An unused slot holds the all-bits-one pattern [`UNSET_SLOT`]. Because the
//! arena capacity is capped below `0xFFFF`, no live slot can collide with the
//! sentinel. Collisions probe linearly, one slot at a time, wrapping at the
//! end of the array.
//!
//! Slot reads in the probe loop use acquire ordering and the write which
//! publishes a filled slot uses release ordering. This is the happens-before
//! edge which lets a thread holding only the read lock follow a freshly
//! published slot to a fully written entry: all entry bytes are written
//! before the slot store, so a reader that observes the slot observes the
//! entry.

use core::sync::atomic::{AtomicU64, Ordering};

/// Bits used for the entry position within a slot
pub(crate) const ENTRY_POS_BITS: u64 = 16;
/// A mask to get the entry position from a slot
pub(crate) const ENTRY_POS_MASK: u64 = 0xFFFF;
/// A mask to get the search key bits from a key hash
pub(crate) const SEARCH_KEY_MASK: u64 = 0xFFFF_FFFF_FFFF;
/// The sentinel pattern held by an unused slot
pub(crate) const UNSET_SLOT: u64 = u64::MAX;
/// Largest arena capacity which keeps every live slot distinct from
/// [`UNSET_SLOT`]
pub(crate) const MAX_ARENA_CAP: usize = 0xFFFE;

/// Get the search key from a key hash
#[inline]
pub(crate) const fn search_key_from_hash(hash: u64) -> u64 {
    hash & SEARCH_KEY_MASK
}

/// Get the segment index from a key hash. The upper bits pick the segment so
/// that segment choice is independent from the in-tier probe position.
#[inline]
pub(crate) const fn seg_from_hash(hash: u64, nseg: u64) -> u64 {
    (hash >> 48) % nseg
}

/// Pack a search key and an entry position into a slot
#[inline]
pub(crate) const fn build_slot(search_key: u64, entry_pos: u64) -> u64 {
    (search_key << ENTRY_POS_BITS) | entry_pos
}

/// Get the search key from a slot
#[inline]
pub(crate) const fn search_key(slot: u64) -> u64 {
    slot >> ENTRY_POS_BITS
}

/// Get the entry position from a slot
#[inline]
pub(crate) const fn entry_pos(slot: u64) -> u64 {
    slot & ENTRY_POS_MASK
}

/// Check whether a slot is unused
#[inline]
pub(crate) const fn slot_empty(slot: u64) -> bool {
    slot == UNSET_SLOT
}

/// Probe arithmetic and slot IO over one tier's slot array.
///
/// The struct holds only the geometry; the slot array base address is passed
/// into each operation because a segment walks multiple tiers with identical
/// geometry.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HashLookup {
    cap_mask: u64,
}

impl HashLookup {
    pub fn new(tier_slots: u64) -> Self {
        debug_assert!(tier_slots.is_power_of_two());
        Self {
            cap_mask: tier_slots - 1,
        }
    }

    /// First probe position for a search key
    #[inline]
    pub fn hl_pos(&self, search_key: u64) -> u64 {
        search_key & self.cap_mask
    }

    /// Next probe position
    #[inline]
    pub fn step(&self, pos: u64) -> u64 {
        (pos + 1) & self.cap_mask
    }

    /// Previous probe position
    #[inline]
    pub fn step_back(&self, pos: u64) -> u64 {
        pos.wrapping_sub(1) & self.cap_mask
    }

    #[inline]
    unsafe fn slot(&self, base: *mut u8, pos: u64) -> &AtomicU64 {
        &*(base.add(pos as usize * 8) as *const AtomicU64)
    }

    /// Volatile slot read: makes a happens-before edge with the release store
    /// which published the slot from another thread or process.
    ///
    /// # Safety
    ///
    /// `base` must point at a slot array of this geometry inside the mapping.
    #[inline]
    pub unsafe fn read_slot_volatile(&self, base: *mut u8, pos: u64) -> u64 {
        self.slot(base, pos).load(Ordering::Acquire)
    }

    /// Plain slot read, permitted only for within-thread checks by the thread
    /// which performed the last mutation of this slot.
    ///
    /// # Safety
    ///
    /// See [`Self::read_slot_volatile`].
    #[inline]
    pub unsafe fn read_slot(&self, base: *mut u8, pos: u64) -> u64 {
        self.slot(base, pos).load(Ordering::Relaxed)
    }

    /// Publish a filled slot. All writes to the referenced entry must precede
    /// this store in program order.
    ///
    /// # Safety
    ///
    /// See [`Self::read_slot_volatile`]. The caller must hold the segment's
    /// update or write lock.
    #[inline]
    pub unsafe fn write_slot_volatile(
        &self,
        base: *mut u8,
        pos: u64,
        search_key: u64,
        entry_pos: u64,
    ) {
        self.write_raw_volatile(base, pos, build_slot(search_key, entry_pos));
    }

    #[inline]
    unsafe fn write_raw_volatile(&self, base: *mut u8, pos: u64, slot: u64) {
        self.slot(base, pos).store(slot, Ordering::Release);
    }

    /// Clear a slot with back-shift deletion, preserving probe reachability of
    /// every other live slot. Walks forward from the cleared position; each
    /// subsequent live slot whose natural position reaches the hole without
    /// crossing it is moved into the hole, opening a new hole further along.
    /// Stops at the first empty slot. Returns the position left empty, which
    /// is where an interrupted probe should resume.
    ///
    /// # Safety
    ///
    /// See [`Self::read_slot_volatile`]. The caller must hold the segment's
    /// write lock.
    pub unsafe fn remove(&self, base: *mut u8, pos: u64) -> u64 {
        let mut pos_to_remove = pos;
        let mut pos_to_shift = pos_to_remove;
        loop {
            pos_to_shift = self.step(pos_to_shift);
            let slot_to_shift = self.read_slot(base, pos_to_shift);
            if slot_empty(slot_to_shift) {
                break;
            }
            let insert_pos = self.hl_pos(search_key(slot_to_shift));
            // the cyclic interval [insert_pos, pos_to_shift] must contain
            // pos_to_remove for the move to keep the slot reachable
            let cond1 = insert_pos <= pos_to_remove;
            let cond2 = pos_to_remove <= pos_to_shift;
            if (cond1 && cond2) || (pos_to_shift < insert_pos && (cond1 || cond2)) {
                self.write_raw_volatile(base, pos_to_remove, slot_to_shift);
                pos_to_remove = pos_to_shift;
            }
        }
        self.write_raw_volatile(base, pos_to_remove, UNSET_SLOT);
        pos_to_remove
    }

    /// Reset every slot to [`UNSET_SLOT`]. Used when a tier is initialized or
    /// drawn from the overflow pool, before the tier is linked into a chain.
    ///
    /// # Safety
    ///
    /// See [`Self::read_slot_volatile`]. The tier must not be reachable by
    /// other threads yet.
    pub unsafe fn clear_all(&self, base: *mut u8) {
        for pos in 0..=self.cap_mask {
            self.slot(base, pos).store(UNSET_SLOT, Ordering::Relaxed);
        }
    }
}
