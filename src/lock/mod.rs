// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The inter-process read/update/write lock protecting one segment.
//!
//! The whole lock state lives in a single 64 bit word inside the segment
//! header, so that any thread in any process mapping the file can transition
//! it with compare-and-swap:
//!
//! ```text
//! ┌──────────────┬───────────────┬──────┬──────┬──────────────────────┐
//! │     ----     │    WAITERS    │WRITE │UPDATE│      READ COUNT      │
//! │              │               │      │      │                      │
//! │    16 bit    │    16 bit     │1 bit │1 bit │        30 bit        │
//! │              │               │      │      │                      │
//! │63          48│47           32│  31  │  30  │29                   0│
//! └──────────────┴───────────────┴──────┴──────┴──────────────────────┘
//! ```
//!
//! Levels compose as follows: any number of readers may hold the lock at
//! once; a single updater may hold it alongside the readers; the writer is
//! exclusive. A writer is always admitted through the update level first, so
//! the update holder is the unique upgrade candidate and writer admission
//! never deadlocks against another upgrader. The upgrade sets the write bit
//! (shutting out new readers) and then waits for the read count to drain.
//!
//! Contended acquisition spins briefly, then yields, then sleeps with the
//! sleep doubling up to a millisecond. Every wait is bounded: when the
//! deadline passes the acquisition gives up and reports it, so a lost lock
//! holder in another process surfaces as a detectable failure instead of a
//! hang. The waiter field is maintained only for diagnostics.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A mask to get the reader count from the lock word
pub(crate) const READ_COUNT_MASK: u64 = 0x3FFF_FFFF;
/// Set while an updater holds the lock
pub(crate) const UPDATE_BIT: u64 = 1 << 30;
/// Set while a writer holds the lock, or while the updater drains readers
pub(crate) const WRITE_BIT: u64 = 1 << 31;
/// One waiter, for the diagnostic waiter count
const WAIT_ONE: u64 = 1 << 32;
/// A mask to get the waiter count from the lock word
const WAIT_MASK: u64 = 0xFFFF << 32;

const SPIN_ROUNDS: u32 = 6;
const YIELD_ROUNDS: u32 = 16;
const SLEEP_BASE: Duration = Duration::from_micros(50);
const SLEEP_CAP: Duration = Duration::from_millis(1);

/// Outcome of a bounded lock acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Acquire {
    Acquired,
    TimedOut,
    Interrupted,
}

/// Cancellation handle for interruptible lock acquisition. Cloned tokens
/// share the flag, so one thread can interrupt another thread's wait.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt any lock wait polling this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Bound and cancellation for one contended acquisition.
#[derive(Clone, Copy)]
pub(crate) struct Wait<'a> {
    deadline: Instant,
    cancel: Option<&'a CancelToken>,
}

impl<'a> Wait<'a> {
    pub fn new(timeout: Duration, cancel: Option<&'a CancelToken>) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }
}

/// Spin, then yield, then sleep with the sleep doubling up to the cap.
struct Backoff {
    round: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { round: 0 }
    }

    fn snooze(&mut self) {
        if self.round < SPIN_ROUNDS {
            for _ in 0..(1 << self.round) {
                core::hint::spin_loop();
            }
        } else if self.round < YIELD_ROUNDS {
            std::thread::yield_now();
        } else {
            let exp = (self.round - YIELD_ROUNDS).min(8);
            let sleep = SLEEP_BASE.saturating_mul(1u32 << exp).min(SLEEP_CAP);
            std::thread::sleep(sleep);
        }
        self.round = self.round.saturating_add(1);
    }
}

/// A view of one segment's shared lock word.
#[derive(Clone, Copy)]
pub(crate) struct SegmentLock {
    word: *mut u8,
}

impl SegmentLock {
    /// # Safety
    ///
    /// `word` must point at the 8 byte aligned lock word of a segment header
    /// inside a live mapping.
    pub unsafe fn from_ptr(word: *mut u8) -> Self {
        Self { word }
    }

    #[inline]
    fn word(&self) -> &AtomicU64 {
        unsafe { &*(self.word as *const AtomicU64) }
    }

    /// Raw lock word, for diagnostics
    pub fn state(&self) -> u64 {
        self.word().load(Ordering::Relaxed)
    }

    /// Threads currently waiting on this lock, for diagnostics
    pub fn waiters(&self) -> u64 {
        (self.state() & WAIT_MASK) >> 32
    }

    fn acquire(&self, wait: &Wait, try_acquire: impl Fn(&Self) -> bool) -> Acquire {
        if try_acquire(self) {
            return Acquire::Acquired;
        }
        self.word().fetch_add(WAIT_ONE, Ordering::Relaxed);
        let mut backoff = Backoff::new();
        let outcome = loop {
            if let Some(cancel) = wait.cancel {
                if cancel.is_cancelled() {
                    break Acquire::Interrupted;
                }
            }
            if try_acquire(self) {
                break Acquire::Acquired;
            }
            if Instant::now() >= wait.deadline {
                break Acquire::TimedOut;
            }
            backoff.snooze();
        };
        self.word().fetch_sub(WAIT_ONE, Ordering::Relaxed);
        outcome
    }

    /// Register a reader unless a writer holds or is draining the lock.
    pub fn try_read_lock(&self) -> bool {
        let mut state = self.word().load(Ordering::Relaxed);
        loop {
            if state & WRITE_BIT != 0 {
                return false;
            }
            debug_assert!(state & READ_COUNT_MASK < READ_COUNT_MASK);
            match self.word().compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    pub fn read_lock(&self, wait: &Wait) -> Acquire {
        self.acquire(wait, Self::try_read_lock)
    }

    pub fn read_unlock(&self) {
        let prev = self.word().fetch_sub(1, Ordering::Release);
        debug_assert!(prev & READ_COUNT_MASK > 0);
    }

    /// Claim the single update slot. Readers are unaffected.
    pub fn try_update_lock(&self) -> bool {
        let mut state = self.word().load(Ordering::Relaxed);
        loop {
            if state & (UPDATE_BIT | WRITE_BIT) != 0 {
                return false;
            }
            match self.word().compare_exchange_weak(
                state,
                state | UPDATE_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => state = current,
            }
        }
    }

    pub fn update_lock(&self, wait: &Wait) -> Acquire {
        self.acquire(wait, Self::try_update_lock)
    }

    pub fn update_unlock(&self) {
        let prev = self.word().fetch_and(!UPDATE_BIT, Ordering::Release);
        debug_assert!(prev & UPDATE_BIT != 0);
        debug_assert!(prev & WRITE_BIT == 0);
    }

    /// Upgrade the held update lock to write: set the write bit to shut out
    /// new readers, then wait for current readers to drain. On failure the
    /// write bit is rolled back and the update lock remains held.
    pub fn upgrade_update_to_write(&self, wait: &Wait) -> Acquire {
        let prev = self.word().fetch_or(WRITE_BIT, Ordering::Acquire);
        debug_assert!(prev & UPDATE_BIT != 0);
        debug_assert!(prev & WRITE_BIT == 0);
        let outcome = self.acquire(wait, |lock| {
            lock.word().load(Ordering::Acquire) & READ_COUNT_MASK == 0
        });
        if outcome != Acquire::Acquired {
            self.word().fetch_and(!WRITE_BIT, Ordering::Release);
        }
        outcome
    }

    pub fn try_upgrade_update_to_write(&self) -> bool {
        let prev = self.word().fetch_or(WRITE_BIT, Ordering::Acquire);
        debug_assert!(prev & UPDATE_BIT != 0);
        if prev & READ_COUNT_MASK == 0 {
            true
        } else {
            self.word().fetch_and(!WRITE_BIT, Ordering::Release);
            false
        }
    }

    /// Acquire the write lock from unlocked: admission goes through the
    /// update level so there is never more than one upgrade candidate.
    pub fn write_lock(&self, wait: &Wait) -> Acquire {
        match self.update_lock(wait) {
            Acquire::Acquired => {}
            other => return other,
        }
        let outcome = self.upgrade_update_to_write(wait);
        if outcome != Acquire::Acquired {
            self.update_unlock();
        }
        outcome
    }

    pub fn try_write_lock(&self) -> bool {
        if !self.try_update_lock() {
            return false;
        }
        if self.try_upgrade_update_to_write() {
            true
        } else {
            self.update_unlock();
            false
        }
    }

    pub fn write_unlock(&self) {
        let prev = self
            .word()
            .fetch_and(!(WRITE_BIT | UPDATE_BIT), Ordering::Release);
        debug_assert!(prev & WRITE_BIT != 0);
    }

    pub fn downgrade_write_to_update(&self) {
        let prev = self.word().fetch_and(!WRITE_BIT, Ordering::Release);
        debug_assert!(prev & WRITE_BIT != 0);
    }

    pub fn downgrade_write_to_read(&self) {
        let mut state = self.word().load(Ordering::Relaxed);
        loop {
            debug_assert!(state & WRITE_BIT != 0);
            let next = (state & !(WRITE_BIT | UPDATE_BIT)) + 1;
            match self
                .word()
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => state = current,
            }
        }
    }

    pub fn downgrade_update_to_read(&self) {
        let mut state = self.word().load(Ordering::Relaxed);
        loop {
            debug_assert!(state & UPDATE_BIT != 0);
            let next = (state & !UPDATE_BIT) + 1;
            match self
                .word()
                .compare_exchange_weak(state, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => state = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_word() -> Box<AtomicU64> {
        Box::new(AtomicU64::new(0))
    }

    fn lock(word: &AtomicU64) -> SegmentLock {
        unsafe { SegmentLock::from_ptr(word as *const AtomicU64 as *mut u8) }
    }

    fn wait() -> Wait<'static> {
        Wait::new(Duration::from_secs(1), None)
    }

    #[test]
    fn readers_share() {
        let word = lock_word();
        let l = lock(&word);
        assert!(l.try_read_lock());
        assert!(l.try_read_lock());
        assert_eq!(l.state() & READ_COUNT_MASK, 2);
        l.read_unlock();
        l.read_unlock();
        assert_eq!(l.state(), 0);
    }

    #[test]
    fn update_admits_readers_but_not_updaters() {
        let word = lock_word();
        let l = lock(&word);
        assert!(l.try_update_lock());
        assert!(l.try_read_lock());
        assert!(!l.try_update_lock());
        assert!(!l.try_write_lock());
        l.read_unlock();
        l.update_unlock();
        assert_eq!(l.state(), 0);
    }

    #[test]
    fn write_excludes_everyone() {
        let word = lock_word();
        let l = lock(&word);
        assert!(l.try_write_lock());
        assert!(!l.try_read_lock());
        assert!(!l.try_update_lock());
        l.write_unlock();
        assert_eq!(l.state(), 0);
    }

    #[test]
    fn upgrade_waits_for_readers() {
        let word = lock_word();
        let l = lock(&word);
        assert!(l.try_read_lock());
        assert!(l.try_update_lock());
        // a reader is outstanding, upgrade must not succeed immediately
        assert!(!l.try_upgrade_update_to_write());
        l.read_unlock();
        assert!(l.try_upgrade_update_to_write());
        l.write_unlock();
        assert_eq!(l.state(), 0);
    }

    #[test]
    fn upgrade_timeout_rolls_back_write_bit() {
        let word = lock_word();
        let l = lock(&word);
        assert!(l.try_read_lock());
        assert!(l.try_update_lock());
        let outcome = l.upgrade_update_to_write(&Wait::new(Duration::from_millis(10), None));
        assert_eq!(outcome, Acquire::TimedOut);
        // readers must still be admitted after the failed upgrade
        assert!(l.try_read_lock());
        l.read_unlock();
        l.read_unlock();
        l.update_unlock();
        assert_eq!(l.state(), 0);
    }

    #[test]
    fn cancellation_interrupts_wait() {
        let word = lock_word();
        let l = lock(&word);
        assert!(l.try_write_lock());
        let token = CancelToken::new();
        token.cancel();
        let wait = Wait::new(Duration::from_secs(10), Some(&token));
        assert_eq!(l.read_lock(&wait), Acquire::Interrupted);
        l.write_unlock();
    }

    #[test]
    fn downgrades() {
        let word = lock_word();
        let l = lock(&word);
        assert!(l.try_write_lock());
        l.downgrade_write_to_update();
        assert!(l.try_read_lock());
        l.downgrade_update_to_read();
        assert_eq!(l.state() & READ_COUNT_MASK, 2);
        assert!(l.try_update_lock());
        l.update_unlock();
        l.read_unlock();
        l.read_unlock();
        assert_eq!(l.state(), 0);
    }

    #[test]
    fn contended_read_acquires_after_writer_leaves() {
        let word: &'static AtomicU64 = Box::leak(lock_word());
        let l = lock(word);
        assert!(l.try_write_lock());
        let handle = std::thread::spawn(move || {
            let l = lock(word);
            l.read_lock(&Wait::new(Duration::from_secs(5), None))
        });
        std::thread::sleep(Duration::from_millis(20));
        l.write_unlock();
        assert_eq!(handle.join().unwrap(), Acquire::Acquired);
        l.read_unlock();
        assert_eq!(l.state(), 0);
    }

    #[test]
    fn waiter_count_returns_to_zero() {
        let word = lock_word();
        let l = lock(&word);
        assert!(l.try_write_lock());
        assert_eq!(
            l.read_lock(&Wait::new(Duration::from_millis(5), None)),
            Acquire::TimedOut
        );
        assert_eq!(l.waiters(), 0);
        l.write_unlock();
    }
}
