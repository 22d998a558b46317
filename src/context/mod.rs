// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-thread lock contexts over a segment.
//!
//! A [`SegmentGuard`] tracks one thread's view of a segment's lock: a local
//! state in `{UNLOCKED, READ_LOCKED, UPDATE_LOCKED, WRITE_LOCKED}` plus three
//! counters for nested acquisitions. The shared lock word is touched only
//! when a counter passes through zero, so re-entrant locking is cheap.
//!
//! Two transitions are special:
//!
//! * read → update (or write) is forbidden. Two readers both waiting to
//!   upgrade would deadlock, so the upgrade path runs exclusively through
//!   the update level and a context already at read level must fail fast.
//!   The same applies across contexts: if another context on the same
//!   thread holds the read lock on this segment, acquiring the update lock
//!   here would stack an illegal upgrade, and the caller is told to take
//!   the update lock in the outer context instead.
//! * unlock from update or write does not release the segment, it folds any
//!   pending delayed checksum and downgrades to the next lower held level,
//!   ending at read. The segment is fully released only when the context
//!   closes.
//!
//! Every process keeps a registry of its live contexts. The registry backs
//! the diagnostic snapshot attached to `DeadLockDetected` failures, the
//! outer-read-lock check above, and teardown: closing the map clears the
//! registry so stale contexts never pin lock diagnostics for a map which is
//! already gone.

use crate::error::ShmapError;
use crate::lock::{Acquire, CancelToken, SegmentLock, Wait};
use crate::replication::RemoteOp;
use crate::shmap::{PutMode, Shmap};

use metrics::counter;
use parking_lot::Mutex;
use std::thread::ThreadId;
use std::time::Duration;

/// One thread's local view of a segment lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LocalLockState {
    Unlocked,
    ReadLocked,
    UpdateLocked,
    WriteLocked,
}

#[derive(Clone, Debug)]
struct ContextInfo {
    thread: ThreadId,
    seg: u64,
    state: LocalLockState,
    read: u32,
    update: u32,
    write: u32,
}

/// Process-wide registry of live contexts, per map.
pub(crate) struct ContextRegistry {
    slots: Mutex<Vec<Option<ContextInfo>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, info: ContextInfo) -> usize {
        let mut slots = self.slots.lock();
        if let Some(id) = slots.iter().position(|slot| slot.is_none()) {
            slots[id] = Some(info);
            id
        } else {
            slots.push(Some(info));
            slots.len() - 1
        }
    }

    fn update(&self, id: usize, info: ContextInfo) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(id) {
            *slot = Some(info);
        }
    }

    fn unregister(&self, id: usize) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(id) {
            *slot = None;
        }
    }

    // whether another context on the same thread holds this segment at read
    // level: the caller is about to attempt an upgrade it must not make
    fn read_locked_elsewhere(&self, thread: ThreadId, seg: u64, excluding: usize) -> bool {
        let slots = self.slots.lock();
        slots.iter().enumerate().any(|(id, slot)| {
            id != excluding
                && slot.as_ref().map_or(false, |info| {
                    info.thread == thread
                        && info.seg == seg
                        && info.state == LocalLockState::ReadLocked
                })
        })
    }

    /// Render all live contexts of this process, for lock failure diagnostics
    pub fn snapshot(&self) -> String {
        let slots = self.slots.lock();
        let mut lines: Vec<String> = slots
            .iter()
            .flatten()
            .map(|info| {
                format!(
                    "  {:?} segment {} {:?} (read: {} update: {} write: {})",
                    info.thread, info.seg, info.state, info.read, info.update, info.write
                )
            })
            .collect();
        if lines.is_empty() {
            lines.push("  no live contexts in this process".to_string());
        }
        lines.join("\n")
    }

    /// Drop every registration. Called on map teardown so per-thread state
    /// becomes reclaimable promptly.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// A thread's lock context over one segment.
pub(crate) struct SegmentGuard<'a> {
    map: &'a Shmap,
    seg: u64,
    thread: ThreadId,
    state: LocalLockState,
    read: u32,
    update: u32,
    write: u32,
    /// Entry with a delayed checksum: folded on unlock or close
    dirty: Option<(u64, u64)>,
    registry_id: usize,
}

impl<'a> SegmentGuard<'a> {
    pub fn new(map: &'a Shmap, seg: u64) -> Self {
        let thread = std::thread::current().id();
        let registry_id = map.registry.register(ContextInfo {
            thread,
            seg,
            state: LocalLockState::Unlocked,
            read: 0,
            update: 0,
            write: 0,
        });
        Self {
            map,
            seg,
            thread,
            state: LocalLockState::Unlocked,
            read: 0,
            update: 0,
            write: 0,
            dirty: None,
            registry_id,
        }
    }

    pub fn seg(&self) -> u64 {
        self.seg
    }

    pub fn state(&self) -> LocalLockState {
        self.state
    }

    fn lock(&self) -> SegmentLock {
        unsafe { SegmentLock::from_ptr(self.map.seg_header(self.seg).lock_word()) }
    }

    fn sync(&self) {
        self.map.registry.update(
            self.registry_id,
            ContextInfo {
                thread: self.thread,
                seg: self.seg,
                state: self.state,
                read: self.read,
                update: self.update,
                write: self.write,
            },
        );
    }

    fn wait<'c>(&self, cancel: Option<&'c CancelToken>) -> Wait<'c> {
        Wait::new(self.map.lock_timeout, cancel)
    }

    fn deadlock(&self) -> ShmapError {
        counter!("segment_deadlock").increment(1);
        let lock = self.lock();
        let snapshot = format!(
            "segment {} lock word {:#018x} with {} waiter(s); live contexts:\n{}",
            self.seg,
            lock.state(),
            lock.waiters(),
            self.map.registry.snapshot()
        );
        ShmapError::DeadLockDetected {
            identity: self.map.identity().to_string(),
            snapshot,
        }
    }

    fn forbidden_upgrade(&self) -> ShmapError {
        ShmapError::ForbiddenUpgrade {
            identity: self.map.identity().to_string(),
        }
    }

    fn outer_read_locked(&self) -> ShmapError {
        ShmapError::OuterContextReadLocked {
            identity: self.map.identity().to_string(),
        }
    }

    fn illegal_monitor(&self) -> ShmapError {
        ShmapError::IllegalMonitorState {
            identity: self.map.identity().to_string(),
        }
    }

    fn check_acquired(&self, outcome: Acquire) -> Result<(), ShmapError> {
        match outcome {
            Acquire::Acquired => Ok(()),
            Acquire::TimedOut => Err(self.deadlock()),
            Acquire::Interrupted => Err(ShmapError::Interrupted),
        }
    }

    // the forbidden upgrade check which spans contexts: an outer context on
    // this thread at read level makes any update/write acquisition here an
    // upgrade in disguise
    fn check_outer_contexts(&self) -> Result<(), ShmapError> {
        if self
            .map
            .registry
            .read_locked_elsewhere(self.thread, self.seg, self.registry_id)
        {
            Err(self.outer_read_locked())
        } else {
            Ok(())
        }
    }

    pub fn read_lock(&mut self) -> Result<(), ShmapError> {
        self.read_lock_inner(None)
    }

    pub fn read_lock_interruptibly(&mut self, token: &CancelToken) -> Result<(), ShmapError> {
        if token.is_cancelled() {
            return Err(ShmapError::Interrupted);
        }
        self.read_lock_inner(Some(token))
    }

    fn read_lock_inner(&mut self, cancel: Option<&CancelToken>) -> Result<(), ShmapError> {
        if self.state == LocalLockState::Unlocked {
            let outcome = self.lock().read_lock(&self.wait(cancel));
            self.check_acquired(outcome)?;
            self.state = LocalLockState::ReadLocked;
        }
        self.read += 1;
        self.sync();
        Ok(())
    }

    pub fn try_read_lock(&mut self) -> bool {
        if self.state == LocalLockState::Unlocked {
            if !self.lock().try_read_lock() {
                return false;
            }
            self.state = LocalLockState::ReadLocked;
        }
        self.read += 1;
        self.sync();
        true
    }

    pub fn try_read_lock_for(&mut self, timeout: Duration) -> Result<bool, ShmapError> {
        if self.state == LocalLockState::Unlocked {
            match self.lock().read_lock(&Wait::new(timeout, None)) {
                Acquire::Acquired => {}
                Acquire::TimedOut => return Ok(false),
                Acquire::Interrupted => return Err(ShmapError::Interrupted),
            }
            self.state = LocalLockState::ReadLocked;
        }
        self.read += 1;
        self.sync();
        Ok(true)
    }

    pub fn update_lock(&mut self) -> Result<(), ShmapError> {
        self.update_lock_inner(None)
    }

    pub fn update_lock_interruptibly(&mut self, token: &CancelToken) -> Result<(), ShmapError> {
        if token.is_cancelled() {
            return Err(ShmapError::Interrupted);
        }
        self.update_lock_inner(Some(token))
    }

    fn update_lock_inner(&mut self, cancel: Option<&CancelToken>) -> Result<(), ShmapError> {
        match self.state {
            LocalLockState::Unlocked => {
                self.check_outer_contexts()?;
                let outcome = self.lock().update_lock(&self.wait(cancel));
                self.check_acquired(outcome)?;
                self.state = LocalLockState::UpdateLocked;
            }
            LocalLockState::ReadLocked => return Err(self.forbidden_upgrade()),
            LocalLockState::UpdateLocked | LocalLockState::WriteLocked => {}
        }
        self.update += 1;
        self.sync();
        Ok(())
    }

    pub fn try_update_lock(&mut self) -> Result<bool, ShmapError> {
        match self.state {
            LocalLockState::Unlocked => {
                self.check_outer_contexts()?;
                if !self.lock().try_update_lock() {
                    return Ok(false);
                }
                self.state = LocalLockState::UpdateLocked;
            }
            LocalLockState::ReadLocked => return Err(self.forbidden_upgrade()),
            LocalLockState::UpdateLocked | LocalLockState::WriteLocked => {}
        }
        self.update += 1;
        self.sync();
        Ok(true)
    }

    pub fn try_update_lock_for(&mut self, timeout: Duration) -> Result<bool, ShmapError> {
        match self.state {
            LocalLockState::Unlocked => {
                self.check_outer_contexts()?;
                match self.lock().update_lock(&Wait::new(timeout, None)) {
                    Acquire::Acquired => {}
                    Acquire::TimedOut => return Ok(false),
                    Acquire::Interrupted => return Err(ShmapError::Interrupted),
                }
                self.state = LocalLockState::UpdateLocked;
            }
            LocalLockState::ReadLocked => return Err(self.forbidden_upgrade()),
            LocalLockState::UpdateLocked | LocalLockState::WriteLocked => {}
        }
        self.update += 1;
        self.sync();
        Ok(true)
    }

    pub fn write_lock(&mut self) -> Result<(), ShmapError> {
        self.write_lock_inner(None)
    }

    pub fn write_lock_interruptibly(&mut self, token: &CancelToken) -> Result<(), ShmapError> {
        if token.is_cancelled() {
            return Err(ShmapError::Interrupted);
        }
        self.write_lock_inner(Some(token))
    }

    fn write_lock_inner(&mut self, cancel: Option<&CancelToken>) -> Result<(), ShmapError> {
        match self.state {
            LocalLockState::Unlocked => {
                self.check_outer_contexts()?;
                let outcome = self.lock().write_lock(&self.wait(cancel));
                self.check_acquired(outcome)?;
                self.state = LocalLockState::WriteLocked;
            }
            LocalLockState::ReadLocked => return Err(self.forbidden_upgrade()),
            LocalLockState::UpdateLocked => {
                let outcome = self.lock().upgrade_update_to_write(&self.wait(cancel));
                self.check_acquired(outcome)?;
                self.state = LocalLockState::WriteLocked;
            }
            LocalLockState::WriteLocked => {}
        }
        self.write += 1;
        self.sync();
        Ok(())
    }

    pub fn try_write_lock(&mut self) -> Result<bool, ShmapError> {
        match self.state {
            LocalLockState::Unlocked => {
                self.check_outer_contexts()?;
                if !self.lock().try_write_lock() {
                    return Ok(false);
                }
                self.state = LocalLockState::WriteLocked;
            }
            LocalLockState::ReadLocked => return Err(self.forbidden_upgrade()),
            LocalLockState::UpdateLocked => {
                if !self.lock().try_upgrade_update_to_write() {
                    return Ok(false);
                }
                self.state = LocalLockState::WriteLocked;
            }
            LocalLockState::WriteLocked => {}
        }
        self.write += 1;
        self.sync();
        Ok(true)
    }

    /// Unlock one level: from update or write this folds the delayed
    /// checksum and downgrades to the next lower held level, from read it
    /// releases once the nesting unwinds. The context never re-acquires; a
    /// later lock call at a higher level starts from the downgraded state.
    pub fn unlock(&mut self) -> Result<(), ShmapError> {
        match self.state {
            LocalLockState::Unlocked => return Err(self.illegal_monitor()),
            LocalLockState::ReadLocked => {
                self.read -= 1;
                if self.read == 0 {
                    self.lock().read_unlock();
                    self.state = LocalLockState::Unlocked;
                }
            }
            LocalLockState::UpdateLocked => {
                self.close_delayed_update_checksum();
                self.update -= 1;
                if self.update == 0 {
                    self.lock().downgrade_update_to_read();
                    self.state = LocalLockState::ReadLocked;
                    self.read += 1;
                }
            }
            LocalLockState::WriteLocked => {
                self.close_delayed_update_checksum();
                self.write -= 1;
                if self.write == 0 {
                    if self.update > 0 {
                        self.lock().downgrade_write_to_update();
                        self.state = LocalLockState::UpdateLocked;
                    } else {
                        self.lock().downgrade_write_to_read();
                        self.state = LocalLockState::ReadLocked;
                        self.read += 1;
                    }
                }
            }
        }
        self.sync();
        Ok(())
    }

    /// Record a mutated entry for delayed checksum computation. Multiple
    /// mutations of one entry under a single lock session fold into one
    /// checksum update on downgrade.
    pub fn mark_dirty(&mut self, tier: u64, entry_pos: u64) {
        if self.map.checksums {
            self.close_delayed_update_checksum();
            self.dirty = Some((tier, entry_pos));
        }
    }

    /// Forget a pending checksum for an entry which no longer exists
    pub fn clear_dirty(&mut self, tier: u64, entry_pos: u64) {
        if self.dirty == Some((tier, entry_pos)) {
            self.dirty = None;
        }
    }

    pub fn is_dirty(&self, tier: u64, entry_pos: u64) -> bool {
        self.dirty == Some((tier, entry_pos))
    }

    fn close_delayed_update_checksum(&mut self) {
        if let Some((tier, entry_pos)) = self.dirty.take() {
            let tier = self.map.tier(tier);
            let mut entry = tier.entry(entry_pos);
            entry.set_checksum(entry.compute_checksum());
        }
    }

    fn close(&mut self) {
        self.close_delayed_update_checksum();
        match self.state {
            LocalLockState::Unlocked => {}
            LocalLockState::ReadLocked => self.lock().read_unlock(),
            LocalLockState::UpdateLocked => self.lock().update_unlock(),
            LocalLockState::WriteLocked => self.lock().write_unlock(),
        }
        self.state = LocalLockState::Unlocked;
        self.read = 0;
        self.update = 0;
        self.write = 0;
        self.map.registry.unregister(self.registry_id);
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A read-only context over the entry for one key.
///
/// The context exposes the read lock as a re-entrant acquire/release pair
/// and direct access to the entry. Whatever is still held is released when
/// the context drops.
pub struct QueryContext<'a> {
    guard: SegmentGuard<'a>,
    key: Vec<u8>,
    search_key: u64,
}

impl<'a> QueryContext<'a> {
    pub(crate) fn new(map: &'a Shmap, key: &[u8]) -> Self {
        let (seg, search_key) = map.index(key);
        Self {
            guard: SegmentGuard::new(map, seg),
            key: key.to_vec(),
            search_key,
        }
    }

    pub fn read_lock(&mut self) -> Result<(), ShmapError> {
        self.guard.read_lock()
    }

    pub fn read_lock_interruptibly(&mut self, token: &CancelToken) -> Result<(), ShmapError> {
        self.guard.read_lock_interruptibly(token)
    }

    pub fn try_read_lock(&mut self) -> bool {
        self.guard.try_read_lock()
    }

    pub fn try_read_lock_for(&mut self, timeout: Duration) -> Result<bool, ShmapError> {
        self.guard.try_read_lock_for(timeout)
    }

    /// Copy of the value for this context's key, or `None` when absent.
    /// Acquires the read lock if the context holds no lock yet.
    pub fn value(&mut self) -> Result<Option<Vec<u8>>, ShmapError> {
        if self.guard.state() == LocalLockState::Unlocked {
            self.guard.read_lock()?;
        }
        self.guard
            .map
            .value_in_context(&self.guard, &self.key, self.search_key)
    }

    /// Whether an entry for this context's key is present
    pub fn contains(&mut self) -> Result<bool, ShmapError> {
        Ok(self.value()?.is_some())
    }

    /// Release one lock level, see the module documentation
    pub fn unlock(&mut self) -> Result<(), ShmapError> {
        self.guard.unlock()
    }
}

/// A read-write context over the entry for one key.
///
/// Exposes all three lock levels as re-entrant acquire/release pairs, plus
/// entry access and mutation. Mutations acquire the missing lock levels
/// themselves: `put`/`remove` upgrade to the write lock, which fails with
/// `ForbiddenUpgrade` if the context only holds the read lock. Whatever is
/// still held is released when the context drops.
pub struct UpdateContext<'a> {
    guard: SegmentGuard<'a>,
    key: Vec<u8>,
    search_key: u64,
}

impl<'a> UpdateContext<'a> {
    pub(crate) fn new(map: &'a Shmap, key: &[u8]) -> Self {
        let (seg, search_key) = map.index(key);
        Self {
            guard: SegmentGuard::new(map, seg),
            key: key.to_vec(),
            search_key,
        }
    }

    pub fn read_lock(&mut self) -> Result<(), ShmapError> {
        self.guard.read_lock()
    }

    pub fn read_lock_interruptibly(&mut self, token: &CancelToken) -> Result<(), ShmapError> {
        self.guard.read_lock_interruptibly(token)
    }

    pub fn try_read_lock(&mut self) -> bool {
        self.guard.try_read_lock()
    }

    pub fn try_read_lock_for(&mut self, timeout: Duration) -> Result<bool, ShmapError> {
        self.guard.try_read_lock_for(timeout)
    }

    pub fn update_lock(&mut self) -> Result<(), ShmapError> {
        self.guard.update_lock()
    }

    pub fn update_lock_interruptibly(&mut self, token: &CancelToken) -> Result<(), ShmapError> {
        self.guard.update_lock_interruptibly(token)
    }

    pub fn try_update_lock(&mut self) -> Result<bool, ShmapError> {
        self.guard.try_update_lock()
    }

    pub fn try_update_lock_for(&mut self, timeout: Duration) -> Result<bool, ShmapError> {
        self.guard.try_update_lock_for(timeout)
    }

    pub fn write_lock(&mut self) -> Result<(), ShmapError> {
        self.guard.write_lock()
    }

    pub fn write_lock_interruptibly(&mut self, token: &CancelToken) -> Result<(), ShmapError> {
        self.guard.write_lock_interruptibly(token)
    }

    pub fn try_write_lock(&mut self) -> Result<bool, ShmapError> {
        self.guard.try_write_lock()
    }

    /// Copy of the value for this context's key, or `None` when absent.
    /// Acquires the read lock if the context holds no lock yet.
    pub fn value(&mut self) -> Result<Option<Vec<u8>>, ShmapError> {
        if self.guard.state() == LocalLockState::Unlocked {
            self.guard.read_lock()?;
        }
        self.guard
            .map
            .value_in_context(&self.guard, &self.key, self.search_key)
    }

    /// Whether an entry for this context's key is present
    pub fn contains(&mut self) -> Result<bool, ShmapError> {
        Ok(self.value()?.is_some())
    }

    /// Write a value for this context's key, returning the previous value
    pub fn put(&mut self, value: &[u8]) -> Result<Option<Vec<u8>>, ShmapError> {
        let map = self.guard.map;
        map.put_in_context(
            &mut self.guard,
            &self.key,
            self.search_key,
            value,
            PutMode::Upsert,
        )
    }

    /// Remove the entry for this context's key, returning the previous value
    pub fn remove(&mut self) -> Result<Option<Vec<u8>>, ShmapError> {
        let map = self.guard.map;
        map.remove_in_context(&mut self.guard, &self.key, self.search_key)
    }

    /// Apply a remote modification through this context, see
    /// [`Shmap::remote_apply`](crate::Shmap::remote_apply)
    pub fn remote_apply(
        &mut self,
        op: RemoteOp,
        remote_ts: u64,
        remote_id: u8,
    ) -> Result<crate::AcceptanceDecision, ShmapError> {
        let map = self.guard.map;
        map.remote_apply_in_context(
            &mut self.guard,
            &self.key,
            self.search_key,
            op,
            remote_ts,
            remote_id,
        )
    }

    /// Release one lock level, see the module documentation
    pub fn unlock(&mut self) -> Result<(), ShmapError> {
        self.guard.unlock()
    }
}
