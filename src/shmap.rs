// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Core datastructure

use crate::builder::Builder;
use crate::context::{LocalLockState, QueryContext, SegmentGuard, UpdateContext};
use crate::datapool::Datapool;
use crate::entry::{OriginMeta, RawEntry};
use crate::error::ShmapError;
use crate::hashlookup::{
    entry_pos, search_key, search_key_from_hash, seg_from_hash, slot_empty, HashLookup,
};
use crate::layout::Geometry;
use crate::replication::{decide_on_remote_modification, AcceptanceDecision, RemoteOp};
use crate::segment::{acquire_tier, SegmentHeader, Tier};
use crate::TimestampSource;

use ahash::RandomState;
use core::hash::{BuildHasher, Hasher};
use metrics::counter;
use std::time::Duration;

/// Replication identity of this map instance.
pub(crate) struct Replication {
    pub node_id: u8,
    pub clock: TimestampSource,
}

/// A persistent hash map over a memory mapped file, shared by every process
/// which maps the same file. The map is partitioned into independently
/// lockable segments; a key's segment is chosen by the upper bits of its
/// hash. Each segment stores entries in a chain of fixed-size tiers, with
/// overflow tiers drawn from a shared pool.
///
/// All operations take `&self`: cross-thread and cross-process exclusion is
/// enforced by the per-segment read/update/write locks living inside the
/// file itself.
pub struct Shmap {
    // keeps the mapping alive; `base` points into it
    pub(crate) pool: Box<dyn Datapool>,
    pub(crate) base: *mut u8,
    pub(crate) geometry: Geometry,
    pub(crate) hl: HashLookup,
    pub(crate) hash_builder: Box<RandomState>,
    pub(crate) identity: String,
    pub(crate) replication: Option<Replication>,
    pub(crate) checksums: bool,
    pub(crate) lock_timeout: Duration,
    pub(crate) registry: crate::context::ContextRegistry,
}

// Safety: every word of the mapped region which can be touched concurrently
// is accessed through atomics, and all multi-byte entry reads and writes are
// serialized by the segment lock protocol. The raw base pointer itself is
// never handed out.
unsafe impl Send for Shmap {}
unsafe impl Sync for Shmap {}

/// Where a probe for one key ended, across the segment's tier chain.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SearchOutcome {
    /// A live entry for the key
    Present {
        tier: u64,
        slot_pos: u64,
        entry_pos: u64,
    },
    /// A tombstone for the key, invisible to lookups but carrying the origin
    /// metadata for the replication acceptance rule
    Tombstone {
        tier: u64,
        slot_pos: u64,
        entry_pos: u64,
    },
    /// No entry on any tier; `tier` is the tail tier and `slot_pos` the
    /// empty slot where the probe stopped, which is where an insert goes
    Absent { tier: u64, slot_pos: u64 },
}

/// Which flavor of put is being performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PutMode {
    Upsert,
    IfAbsent,
    Replace,
}

/// The fixed-seed hash builder: every process must hash a key identically
pub(crate) fn hash_builder() -> RandomState {
    RandomState::with_seeds(
        0xbb8c484891ec6c86,
        0x0522a25ae9c769f9,
        0xeed2797b9571bc75,
        0x4feb29c1fbbd59d0,
    )
}

impl Shmap {
    /// Returns a new `Builder` which is used to configure and construct a
    /// `Shmap` instance.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// // create an anonymous in-memory map
    /// let map = Shmap::builder().build().expect("failed to create map");
    ///
    /// // create a map shared through a file
    /// # let dir = tempfile::tempdir().unwrap();
    /// # let path = dir.path().join("example.map");
    /// let map = Shmap::builder()
    ///     .segments(16)
    ///     .tier_slots(256)
    ///     .datapool_path(Some(&path))
    ///     .build()
    ///     .expect("failed to create map");
    /// ```
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Internal function used to calculate a hash value for a key
    fn hash(&self, key: &[u8]) -> u64 {
        counter!("hash_lookup").increment(1);
        let mut hasher = self.hash_builder.build_hasher();
        hasher.write(key);
        hasher.finish()
    }

    /// Segment index and search key for a key
    pub(crate) fn index(&self, key: &[u8]) -> (u64, u64) {
        let hash = self.hash(key);
        (
            seg_from_hash(hash, self.geometry.nseg),
            search_key_from_hash(hash),
        )
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn seg_header(&self, seg: u64) -> SegmentHeader {
        unsafe { SegmentHeader::new(self.base, &self.geometry, seg) }
    }

    pub(crate) fn tier(&self, tier: u64) -> Tier<'_> {
        unsafe { Tier::new(self.base, &self.geometry, tier) }
    }

    /// Get a copy of the value stored for the key, or `None` when the key is
    /// absent.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder().build().expect("failed to create map");
    /// assert!(map.get(b"coffee").unwrap().is_none());
    ///
    /// map.put(b"coffee", b"strong").unwrap();
    /// assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"strong"[..]));
    /// ```
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ShmapError> {
        let (seg, search_key) = self.index(key);
        let mut guard = SegmentGuard::new(self, seg);
        guard.read_lock()?;
        self.value_in_context(&guard, key, search_key)
    }

    /// Whether an entry for the key is present
    pub fn contains_key(&self, key: &[u8]) -> Result<bool, ShmapError> {
        Ok(self.get(key)?.is_some())
    }

    /// Store a value for the key, returning the previous value if the key
    /// was present.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder().build().expect("failed to create map");
    /// assert_eq!(map.put(b"drink", b"coffee").unwrap(), None);
    /// let prev = map.put(b"drink", b"whisky").unwrap();
    /// assert_eq!(prev.as_deref(), Some(&b"coffee"[..]));
    /// assert_eq!(map.get(b"drink").unwrap().as_deref(), Some(&b"whisky"[..]));
    /// ```
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, ShmapError> {
        let (seg, search_key) = self.index(key);
        let mut guard = SegmentGuard::new(self, seg);
        self.put_in_context(&mut guard, key, search_key, value, PutMode::Upsert)
    }

    /// Store a value only if the key is absent. Returns the existing value
    /// when the key is present, in which case the map is unchanged.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder().build().expect("failed to create map");
    /// assert_eq!(map.put_if_absent(b"drink", b"coffee").unwrap(), None);
    /// let existing = map.put_if_absent(b"drink", b"whisky").unwrap();
    /// assert_eq!(existing.as_deref(), Some(&b"coffee"[..]));
    /// assert_eq!(map.get(b"drink").unwrap().as_deref(), Some(&b"coffee"[..]));
    /// ```
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, ShmapError> {
        let (seg, search_key) = self.index(key);
        let mut guard = SegmentGuard::new(self, seg);
        self.put_in_context(&mut guard, key, search_key, value, PutMode::IfAbsent)
    }

    /// Replace the value for a key which is already present, returning the
    /// previous value. Absent keys are left absent.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder().build().expect("failed to create map");
    /// assert_eq!(map.replace(b"drink", b"coffee").unwrap(), None);
    /// assert!(map.get(b"drink").unwrap().is_none());
    ///
    /// map.put(b"drink", b"coffee").unwrap();
    /// let prev = map.replace(b"drink", b"whisky").unwrap();
    /// assert_eq!(prev.as_deref(), Some(&b"coffee"[..]));
    /// ```
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, ShmapError> {
        let (seg, search_key) = self.index(key);
        let mut guard = SegmentGuard::new(self, seg);
        self.put_in_context(&mut guard, key, search_key, value, PutMode::Replace)
    }

    /// Remove the entry for the key, returning the previous value if the key
    /// was present. On replicated maps the entry is tombstoned instead of
    /// reclaimed, so the removal can win against concurrent remote writes.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder().build().expect("failed to create map");
    /// assert_eq!(map.remove(b"coffee").unwrap(), None);
    ///
    /// map.put(b"coffee", b"strong").unwrap();
    /// assert_eq!(map.remove(b"coffee").unwrap().as_deref(), Some(&b"strong"[..]));
    /// assert!(map.get(b"coffee").unwrap().is_none());
    /// assert_eq!(map.remove(b"coffee").unwrap(), None);
    /// ```
    pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ShmapError> {
        let (seg, search_key) = self.index(key);
        let mut guard = SegmentGuard::new(self, seg);
        self.remove_in_context(&mut guard, key, search_key)
    }

    /// Live entries across all segments. Reads the per-segment counters
    /// without locking, so concurrent writers may make the value stale
    /// immediately.
    pub fn len(&self) -> usize {
        (0..self.geometry.nseg)
            .map(|seg| self.seg_header(seg).entry_count())
            .sum::<u64>() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a read-only context over the entry for a key.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder().build().expect("failed to create map");
    /// map.put(b"coffee", b"strong").unwrap();
    ///
    /// let mut ctx = map.query_context(b"coffee");
    /// ctx.read_lock().unwrap();
    /// assert_eq!(ctx.value().unwrap().as_deref(), Some(&b"strong"[..]));
    /// ```
    pub fn query_context(&self, key: &[u8]) -> QueryContext<'_> {
        QueryContext::new(self, key)
    }

    /// Open a read-write context over the entry for a key.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder().build().expect("failed to create map");
    ///
    /// let mut ctx = map.update_context(b"coffee");
    /// ctx.update_lock().unwrap();
    /// assert!(ctx.value().unwrap().is_none());
    /// ctx.put(b"strong").unwrap();
    /// drop(ctx);
    ///
    /// assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"strong"[..]));
    /// ```
    pub fn update_context(&self, key: &[u8]) -> UpdateContext<'_> {
        UpdateContext::new(self, key)
    }

    /// Apply a modification received from another node. The acceptance rule
    /// decides deterministically whether the remote write or the local entry
    /// wins, so all nodes converge on the same bytes.
    ///
    /// ```
    /// use shmap::{AcceptanceDecision, RemoteOp, Shmap};
    ///
    /// let map = Shmap::builder().replicated(1).build().expect("failed to create map");
    ///
    /// let decision = map
    ///     .remote_apply(b"coffee", RemoteOp::Put(b"strong"), 100, 2)
    ///     .unwrap();
    /// assert_eq!(decision, AcceptanceDecision::Accept);
    /// assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"strong"[..]));
    ///
    /// // an older write for the same key is discarded
    /// let decision = map
    ///     .remote_apply(b"coffee", RemoteOp::Put(b"stale"), 99, 3)
    ///     .unwrap();
    /// assert_eq!(decision, AcceptanceDecision::Discard);
    /// assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"strong"[..]));
    /// ```
    pub fn remote_apply(
        &self,
        key: &[u8],
        op: RemoteOp,
        remote_ts: u64,
        remote_id: u8,
    ) -> Result<AcceptanceDecision, ShmapError> {
        let (seg, search_key) = self.index(key);
        let mut guard = SegmentGuard::new(self, seg);
        self.remote_apply_in_context(&mut guard, key, search_key, op, remote_ts, remote_id)
    }

    /// Persist the mapped region to its backing store
    pub fn flush(&self) -> Result<(), ShmapError> {
        self.pool.flush()?;
        Ok(())
    }

    /// Walk the tier chain probing for the key. Requires the caller to hold
    /// the segment's lock at read level or above.
    pub(crate) fn locate(
        &self,
        seg: u64,
        key_search: u64,
        key: &[u8],
    ) -> Result<SearchOutcome, ShmapError> {
        let mut tier_idx = seg;
        loop {
            let tier = self.tier(tier_idx);
            let slot_base = tier.slot_base();
            let search_start = self.hl.hl_pos(key_search);
            let mut pos = search_start;
            loop {
                // volatile read to make a happens-before edge between entry
                // insertion from a concurrent thread under update lock and
                // this thread reading the entry
                let slot = unsafe { self.hl.read_slot_volatile(slot_base, pos) };
                if slot_empty(slot) {
                    break;
                }
                if search_key(slot) == key_search {
                    let entry_pos = entry_pos(slot);
                    let entry = tier.entry(entry_pos);
                    if entry.key() == key {
                        return Ok(if entry.is_tombstone() {
                            SearchOutcome::Tombstone {
                                tier: tier_idx,
                                slot_pos: pos,
                                entry_pos,
                            }
                        } else {
                            SearchOutcome::Present {
                                tier: tier_idx,
                                slot_pos: pos,
                                entry_pos,
                            }
                        });
                    }
                    counter!("hash_tag_collision").increment(1);
                }
                pos = self.hl.step(pos);
                if pos == search_start {
                    return Err(ShmapError::HashLookupOverflow {
                        identity: self.identity.clone(),
                    });
                }
            }
            match tier.next_tier() {
                Some(next) => tier_idx = next,
                None => {
                    return Ok(SearchOutcome::Absent {
                        tier: tier_idx,
                        slot_pos: pos,
                    })
                }
            }
        }
    }

    // within-thread self-check that a previously located slot still holds the
    // expected key and entry; the update lock held across the search makes a
    // plain read sufficient
    fn slot_holds(&self, tier: &Tier, slot_pos: u64, key_search: u64, pos: u64) -> bool {
        let slot = unsafe { self.hl.read_slot(tier.slot_base(), slot_pos) };
        search_key(slot) == key_search && entry_pos(slot) == pos
    }

    fn read_value(
        &self,
        guard: &SegmentGuard,
        tier: u64,
        entry_pos: u64,
    ) -> Result<Vec<u8>, ShmapError> {
        let entry = self.tier(tier).entry(entry_pos);
        // an entry this context mutated has its checksum folded on downgrade,
        // not yet
        if self.checksums && !guard.is_dirty(tier, entry_pos) && !entry.verify_checksum() {
            return Err(ShmapError::ChecksumMismatch {
                identity: self.identity.clone(),
            });
        }
        Ok(entry.value().to_vec())
    }

    pub(crate) fn value_in_context(
        &self,
        guard: &SegmentGuard,
        key: &[u8],
        search_key: u64,
    ) -> Result<Option<Vec<u8>>, ShmapError> {
        debug_assert!(guard.state() != LocalLockState::Unlocked);
        match self.locate(guard.seg(), search_key, key)? {
            SearchOutcome::Present {
                tier, entry_pos, ..
            } => Ok(Some(self.read_value(guard, tier, entry_pos)?)),
            _ => Ok(None),
        }
    }

    /// Origin metadata for a local mutation: the wall clock stamped with
    /// this node's identifier, advanced past the entry being replaced so the
    /// origin tuple of an entry never moves backwards on its own node.
    pub(crate) fn next_origin(&self, existing: Option<OriginMeta>) -> OriginMeta {
        match &self.replication {
            None => OriginMeta::default(),
            Some(replication) => {
                let now = (replication.clock)();
                let ts = match existing {
                    Some(meta) if now <= meta.ts => meta.ts + 1,
                    _ => now,
                };
                OriginMeta {
                    ts,
                    id: replication.node_id,
                }
            }
        }
    }

    pub(crate) fn put_in_context(
        &self,
        guard: &mut SegmentGuard,
        key: &[u8],
        search_key: u64,
        value: &[u8],
        mode: PutMode,
    ) -> Result<Option<Vec<u8>>, ShmapError> {
        RawEntry::check_fits(self.geometry.entry_size as usize, key.len(), value.len())?;
        if guard.state() == LocalLockState::Unlocked {
            guard.update_lock()?;
        }
        let seg = guard.seg();
        match self.locate(seg, search_key, key)? {
            SearchOutcome::Present {
                tier,
                slot_pos,
                entry_pos,
            } => {
                let prev = self.read_value(guard, tier, entry_pos)?;
                if mode == PutMode::IfAbsent {
                    return Ok(Some(prev));
                }
                guard.write_lock()?;
                let tier_view = self.tier(tier);
                debug_assert!(self.slot_holds(&tier_view, slot_pos, search_key, entry_pos));
                let mut entry = tier_view.entry(entry_pos);
                let meta = self.next_origin(Some(entry.meta()));
                entry.define(key, value, meta);
                guard.mark_dirty(tier, entry_pos);
                self.seg_header(seg).bump_version();
                Ok(Some(prev))
            }
            SearchOutcome::Tombstone {
                tier,
                slot_pos,
                entry_pos,
            } => {
                if mode == PutMode::Replace {
                    return Ok(None);
                }
                guard.write_lock()?;
                let tier_view = self.tier(tier);
                debug_assert!(self.slot_holds(&tier_view, slot_pos, search_key, entry_pos));
                let mut entry = tier_view.entry(entry_pos);
                let meta = self.next_origin(Some(entry.meta()));
                entry.define(key, value, meta);
                guard.mark_dirty(tier, entry_pos);
                let header = self.seg_header(seg);
                header.increment_count();
                header.bump_version();
                Ok(None)
            }
            SearchOutcome::Absent { tier, slot_pos } => {
                if mode == PutMode::Replace {
                    return Ok(None);
                }
                guard.write_lock()?;
                let meta = self.next_origin(None);
                self.insert_entry(
                    guard, seg, search_key, tier, slot_pos, key, value, meta, false,
                )?;
                Ok(None)
            }
        }
    }

    pub(crate) fn remove_in_context(
        &self,
        guard: &mut SegmentGuard,
        key: &[u8],
        search_key: u64,
    ) -> Result<Option<Vec<u8>>, ShmapError> {
        if guard.state() == LocalLockState::Unlocked {
            guard.update_lock()?;
        }
        let seg = guard.seg();
        match self.locate(seg, search_key, key)? {
            SearchOutcome::Present {
                tier,
                slot_pos,
                entry_pos,
            } => {
                let prev = self.read_value(guard, tier, entry_pos)?;
                guard.write_lock()?;
                counter!("hash_remove").increment(1);
                let tier_view = self.tier(tier);
                debug_assert!(self.slot_holds(&tier_view, slot_pos, search_key, entry_pos));
                if self.replication.is_some() {
                    // keep the entry as a tombstone so the acceptance rule can
                    // compare remote writes against the removal
                    let mut entry = tier_view.entry(entry_pos);
                    let meta = self.next_origin(Some(entry.meta()));
                    entry.make_tombstone(meta);
                    guard.mark_dirty(tier, entry_pos);
                } else {
                    guard.clear_dirty(tier, entry_pos);
                    tier_view.free(entry_pos);
                    unsafe { self.hl.remove(tier_view.slot_base(), slot_pos) };
                }
                let header = self.seg_header(seg);
                header.decrement_count();
                header.bump_version();
                Ok(Some(prev))
            }
            _ => Ok(None),
        }
    }

    pub(crate) fn remote_apply_in_context(
        &self,
        guard: &mut SegmentGuard,
        key: &[u8],
        search_key: u64,
        op: RemoteOp,
        remote_ts: u64,
        remote_id: u8,
    ) -> Result<AcceptanceDecision, ShmapError> {
        let node_id = self
            .replication
            .as_ref()
            .map(|replication| replication.node_id)
            .ok_or(ShmapError::ReplicationDisabled)?;
        let entry_size = self.geometry.entry_size as usize;
        match op {
            RemoteOp::Put(value) => RawEntry::check_fits(entry_size, key.len(), value.len())?,
            RemoteOp::Remove => RawEntry::check_fits(entry_size, key.len(), 0)?,
        }

        if guard.state() == LocalLockState::Unlocked {
            guard.update_lock()?;
        }
        let seg = guard.seg();
        let outcome = self.locate(seg, search_key, key)?;
        let local = match outcome {
            SearchOutcome::Present {
                tier, entry_pos, ..
            }
            | SearchOutcome::Tombstone {
                tier, entry_pos, ..
            } => Some(self.tier(tier).entry(entry_pos).meta()),
            SearchOutcome::Absent { .. } => None,
        };
        let decision = match local {
            Some(origin) => {
                decide_on_remote_modification(origin, remote_ts, remote_id, node_id)
            }
            // nothing local to defend: the remote modification lands
            None => AcceptanceDecision::Accept,
        };
        if decision == AcceptanceDecision::Discard {
            trace!(
                "discarded remote op from node {} at {} for segment {}",
                remote_id,
                remote_ts,
                seg
            );
            return Ok(decision);
        }

        guard.write_lock()?;
        let meta = OriginMeta {
            ts: remote_ts,
            id: remote_id,
        };
        let header = self.seg_header(seg);
        match (outcome, op) {
            (
                SearchOutcome::Present {
                    tier, entry_pos, ..
                },
                RemoteOp::Put(value),
            ) => {
                let mut entry = self.tier(tier).entry(entry_pos);
                entry.define(key, value, meta);
                guard.mark_dirty(tier, entry_pos);
                header.bump_version();
            }
            (
                SearchOutcome::Present {
                    tier, entry_pos, ..
                },
                RemoteOp::Remove,
            ) => {
                let mut entry = self.tier(tier).entry(entry_pos);
                entry.make_tombstone(meta);
                guard.mark_dirty(tier, entry_pos);
                header.decrement_count();
                header.bump_version();
            }
            (
                SearchOutcome::Tombstone {
                    tier, entry_pos, ..
                },
                RemoteOp::Put(value),
            ) => {
                let mut entry = self.tier(tier).entry(entry_pos);
                entry.define(key, value, meta);
                guard.mark_dirty(tier, entry_pos);
                header.increment_count();
                header.bump_version();
            }
            (
                SearchOutcome::Tombstone {
                    tier, entry_pos, ..
                },
                RemoteOp::Remove,
            ) => {
                // the newer removal just advances the tombstone's origin
                let mut entry = self.tier(tier).entry(entry_pos);
                entry.set_meta(meta);
                guard.mark_dirty(tier, entry_pos);
                header.bump_version();
            }
            (SearchOutcome::Absent { tier, slot_pos }, RemoteOp::Put(value)) => {
                self.insert_entry(
                    guard, seg, search_key, tier, slot_pos, key, value, meta, false,
                )?;
            }
            (SearchOutcome::Absent { tier, slot_pos }, RemoteOp::Remove) => {
                // record the removal of a key this node has never seen, so a
                // stale concurrent write cannot resurrect it
                self.insert_entry(guard, seg, search_key, tier, slot_pos, key, b"", meta, true)?;
            }
        }
        Ok(AcceptanceDecision::Accept)
    }

    /// Write a fresh entry and publish its slot. The slot publish is the
    /// commit point: on any failure before it, the allocated arena slot is
    /// released and the map is unchanged.
    #[allow(clippy::too_many_arguments)]
    fn insert_entry(
        &self,
        guard: &mut SegmentGuard,
        seg: u64,
        search_key: u64,
        tier: u64,
        slot_pos: u64,
        key: &[u8],
        value: &[u8],
        meta: OriginMeta,
        tombstone: bool,
    ) -> Result<(), ShmapError> {
        counter!("hash_insert").increment(1);
        let mut tier_idx = tier;
        let mut slot_pos = slot_pos;
        loop {
            // inserts always target the tail of the chain
            debug_assert_eq!(self.seg_header(seg).chain_tail(), tier_idx);
            let tier_view = self.tier(tier_idx);
            if let Some(entry_pos) = tier_view.alloc() {
                let mut entry = tier_view.entry(entry_pos);
                entry.define(key, value, meta);
                if tombstone {
                    entry.make_tombstone(meta);
                }
                // publish: all entry bytes are written, the volatile slot
                // store makes them visible to readers that observe the slot
                unsafe {
                    self.hl
                        .write_slot_volatile(tier_view.slot_base(), slot_pos, search_key, entry_pos)
                };
                let header = self.seg_header(seg);
                if !tombstone {
                    header.increment_count();
                }
                header.bump_version();
                guard.mark_dirty(tier_idx, entry_pos);
                return Ok(());
            }

            // the tail tier's arena is full: chain a fresh tier. The probe
            // restarts at the new tier's natural position for the key.
            let next = match unsafe { acquire_tier(self.base, &self.geometry) } {
                Ok(next) => next,
                Err(e) => {
                    counter!("hash_insert_ex").increment(1);
                    return Err(e);
                }
            };
            let fresh = self.tier(next);
            fresh.reset(&self.hl);
            tier_view.set_next_tier(next);
            self.seg_header(seg).set_chain_tail(next);
            debug!("segment {} chained tier {}", seg, next);
            tier_idx = next;
            slot_pos = self.hl.hl_pos(search_key);
        }
    }

    /// Checks the integrity of all segments: every occupied slot must agree
    /// with the key of the entry it references, every allocated arena
    /// position must be referenced by exactly one slot of its tier, and the
    /// per segment entry count must match the live entries found. Takes the
    /// read lock on each segment in turn.
    /// *NOTE*: this operation is relatively expensive
    #[cfg(any(test, feature = "debug"))]
    pub fn check_integrity(&self) -> Result<(), ShmapError> {
        let corrupted = || ShmapError::DataCorrupted {
            identity: self.identity.clone(),
        };
        for seg in 0..self.geometry.nseg {
            let mut guard = SegmentGuard::new(self, seg);
            guard.read_lock()?;
            let mut live = 0u64;
            let mut tier_idx = seg;
            loop {
                let tier = self.tier(tier_idx);
                let slot_base = tier.slot_base();
                let mut referenced = vec![false; self.geometry.arena_cap as usize];
                for pos in 0..self.geometry.tier_slots {
                    let slot = unsafe { self.hl.read_slot_volatile(slot_base, pos) };
                    if slot_empty(slot) {
                        continue;
                    }
                    let pos_in_arena = entry_pos(slot) as usize;
                    if pos_in_arena >= referenced.len() || referenced[pos_in_arena] {
                        return Err(corrupted());
                    }
                    referenced[pos_in_arena] = true;
                    let entry = tier.entry(pos_in_arena as u64);
                    let hash = self.hash(entry.key());
                    if search_key_from_hash(hash) != search_key(slot)
                        || seg_from_hash(hash, self.geometry.nseg) != seg
                    {
                        return Err(corrupted());
                    }
                    if !entry.is_tombstone() {
                        live += 1;
                    }
                }
                if referenced.iter().filter(|r| **r).count() as u64 != tier.live() {
                    return Err(corrupted());
                }
                match tier.next_tier() {
                    Some(next) => tier_idx = next,
                    None => break,
                }
            }
            if live != self.seg_header(seg).entry_count() {
                return Err(corrupted());
            }
        }
        Ok(())
    }

    /// Gets a count of entries in each tier of a segment's chain. Only
    /// enabled for tests and builds with the `debug` feature enabled.
    #[cfg(any(test, feature = "debug"))]
    pub(crate) fn tier_chain(&self, seg: u64) -> Vec<(u64, u64)> {
        let mut chain = Vec::new();
        let mut tier_idx = seg;
        loop {
            let tier = self.tier(tier_idx);
            chain.push((tier_idx, tier.live()));
            match tier.next_tier() {
                Some(next) => tier_idx = next,
                None => return chain,
            }
        }
    }
}

impl Drop for Shmap {
    fn drop(&mut self) {
        // unlink per-thread contexts so their registrations never outlive
        // the map
        self.registry.clear();
        if let Err(e) = self.pool.flush() {
            warn!("failed to flush map on close: {}", e);
        }
    }
}
