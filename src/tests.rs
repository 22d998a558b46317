// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::*;
use crate::entry::ENTRY_HDR_SIZE;
use crate::layout::{GLOBAL_HEADER_SIZE, SEG_HEADER_SIZE, TIER_HEADER_SIZE};

use std::sync::Barrier;
use std::time::Duration;

fn fixed_clock() -> u64 {
    100
}

#[test]
fn sizes() {
    assert_eq!(ENTRY_HDR_SIZE, 24);
    assert_eq!(SEG_HEADER_SIZE, 64);
    assert_eq!(TIER_HEADER_SIZE, 64);
    assert_eq!(GLOBAL_HEADER_SIZE, 4096);
}

#[test]
fn init() {
    let map = Shmap::builder()
        .segments(4)
        .tier_slots(64)
        .build()
        .expect("failed to create map");
    assert_eq!(map.len(), 0);
    assert!(map.is_empty());
}

#[test]
fn get_put() {
    let map = Shmap::builder()
        .segments(4)
        .tier_slots(64)
        .build()
        .expect("failed to create map");
    assert!(map.get(b"coffee").unwrap().is_none());
    assert_eq!(map.put(b"coffee", b"strong").unwrap(), None);
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"strong"[..]));
    assert!(map.contains_key(b"coffee").unwrap());
    assert!(!map.contains_key(b"tea").unwrap());
}

#[test]
fn overwrite_returns_previous() {
    let map = Shmap::builder().build().expect("failed to create map");
    assert_eq!(map.put(b"drink", b"coffee").unwrap(), None);
    assert_eq!(
        map.put(b"drink", b"whisky").unwrap().as_deref(),
        Some(&b"coffee"[..])
    );
    assert_eq!(map.get(b"drink").unwrap().as_deref(), Some(&b"whisky"[..]));
    // overwrites do not change the count
    assert_eq!(map.len(), 1);
}

#[test]
fn put_if_absent_and_replace() {
    let map = Shmap::builder().build().expect("failed to create map");

    // replace of an absent key is a no-op
    assert_eq!(map.replace(b"drink", b"coffee").unwrap(), None);
    assert!(map.get(b"drink").unwrap().is_none());

    assert_eq!(map.put_if_absent(b"drink", b"coffee").unwrap(), None);
    assert_eq!(
        map.put_if_absent(b"drink", b"whisky").unwrap().as_deref(),
        Some(&b"coffee"[..])
    );
    assert_eq!(map.get(b"drink").unwrap().as_deref(), Some(&b"coffee"[..]));

    assert_eq!(
        map.replace(b"drink", b"whisky").unwrap().as_deref(),
        Some(&b"coffee"[..])
    );
    assert_eq!(map.get(b"drink").unwrap().as_deref(), Some(&b"whisky"[..]));
    assert_eq!(map.len(), 1);
}

#[test]
fn remove_is_idempotent() {
    let map = Shmap::builder().build().expect("failed to create map");
    map.put(b"coffee", b"strong").unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(
        map.remove(b"coffee").unwrap().as_deref(),
        Some(&b"strong"[..])
    );
    assert_eq!(map.len(), 0);
    assert!(map.get(b"coffee").unwrap().is_none());
    // the second remove misses and leaves the count unchanged
    assert_eq!(map.remove(b"coffee").unwrap(), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn fills_multiple_segments() {
    let map = Shmap::builder()
        .segments(8)
        .tier_slots(64)
        .build()
        .expect("failed to create map");
    for i in 0..100u32 {
        let key = format!("key-{}", i);
        let value = format!("value-{}", i);
        map.put(key.as_bytes(), value.as_bytes()).unwrap();
    }
    assert_eq!(map.len(), 100);
    for i in 0..100u32 {
        let key = format!("key-{}", i);
        let value = format!("value-{}", i);
        assert_eq!(
            map.get(key.as_bytes()).unwrap().as_deref(),
            Some(value.as_bytes())
        );
    }
    map.check_integrity().unwrap();
}

#[test]
fn insert_overflows_into_chained_tier() {
    // a single segment with 4 hash slots holds 3 entries per tier, so the
    // 4th insert must chain an overflow tier
    let map = Shmap::builder()
        .segments(1)
        .tier_slots(4)
        .build()
        .expect("failed to create map");

    for i in 0..5u32 {
        let key = format!("key-{}", i);
        map.put(key.as_bytes(), b"value").unwrap();
    }

    let chain = map.tier_chain(0);
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.iter().map(|(_, live)| live).sum::<u64>(), 5);
    assert_eq!(map.len(), 5);

    // every key is still retrievable across the chain
    for i in 0..5u32 {
        let key = format!("key-{}", i);
        assert_eq!(
            map.get(key.as_bytes()).unwrap().as_deref(),
            Some(&b"value"[..])
        );
    }
    map.check_integrity().unwrap();
}

#[test]
fn removes_keep_survivors_findable_in_chain() {
    let map = Shmap::builder()
        .segments(1)
        .tier_slots(4)
        .build()
        .expect("failed to create map");

    for i in 0..6u32 {
        let key = format!("key-{}", i);
        map.put(key.as_bytes(), key.as_bytes()).unwrap();
    }
    for i in (0..6u32).step_by(2) {
        let key = format!("key-{}", i);
        assert!(map.remove(key.as_bytes()).unwrap().is_some());
    }
    assert_eq!(map.len(), 3);
    for i in 0..6u32 {
        let key = format!("key-{}", i);
        let got = map.get(key.as_bytes()).unwrap();
        if i % 2 == 0 {
            assert!(got.is_none());
        } else {
            assert_eq!(got.as_deref(), Some(key.as_bytes()));
        }
    }
    map.check_integrity().unwrap();
}

#[test]
fn randomized_insert_remove_keeps_present_keys_findable() {
    use rand::prelude::*;

    let mut rng = rand::rngs::StdRng::seed_from_u64(0xdecaf);
    let map = Shmap::builder()
        .segments(1)
        .tier_slots(64)
        .build()
        .expect("failed to create map");

    let mut live: Vec<u32> = Vec::new();
    let mut next = 0u32;
    for _ in 0..500 {
        if live.len() < 40 && (live.is_empty() || rng.gen_bool(0.6)) {
            let key = format!("key-{}", next);
            map.put(key.as_bytes(), key.as_bytes()).unwrap();
            live.push(next);
            next += 1;
        } else {
            let idx = rng.gen_range(0..live.len());
            let id = live.swap_remove(idx);
            let key = format!("key-{}", id);
            assert!(map.remove(key.as_bytes()).unwrap().is_some());
        }
        assert_eq!(map.len(), live.len());
        for id in &live {
            let key = format!("key-{}", id);
            assert_eq!(
                map.get(key.as_bytes()).unwrap().as_deref(),
                Some(key.as_bytes())
            );
        }
    }
    map.check_integrity().unwrap();
}

#[test]
fn entry_oversized() {
    let map = Shmap::builder()
        .entry_size(64)
        .build()
        .expect("failed to create map");
    // header (24) + key (6) + value (64) exceeds the 64 byte entry slot
    let value = [0x42u8; 64];
    assert!(matches!(
        map.put(b"coffee", &value),
        Err(ShmapError::EntryOversized { .. })
    ));
    // nothing was published
    assert!(map.get(b"coffee").unwrap().is_none());
    assert_eq!(map.len(), 0);
}

#[test]
fn exhausted_tier_pool() {
    let map = Shmap::builder()
        .segments(1)
        .tier_slots(2)
        .overflow_tiers(0)
        .build()
        .expect("failed to create map");
    // one entry per tier and no overflow pool
    map.put(b"a", b"1").unwrap();
    assert!(matches!(
        map.put(b"b", b"2"),
        Err(ShmapError::NoFreeTiers)
    ));
    // the failed insert is fully rolled back
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(b"a").unwrap().as_deref(), Some(&b"1"[..]));
    assert!(map.get(b"b").unwrap().is_none());
}

#[test]
fn checksums_round_trip() {
    let map = Shmap::builder()
        .checksums(true)
        .build()
        .expect("failed to create map");
    map.put(b"coffee", b"strong").unwrap();
    map.put(b"coffee", b"stronger").unwrap();
    assert_eq!(
        map.get(b"coffee").unwrap().as_deref(),
        Some(&b"stronger"[..])
    );
    map.remove(b"coffee").unwrap();
    assert!(map.get(b"coffee").unwrap().is_none());
}

#[test]
fn query_context_reads() {
    let map = Shmap::builder().build().expect("failed to create map");
    map.put(b"coffee", b"strong").unwrap();

    let mut ctx = map.query_context(b"coffee");
    ctx.read_lock().unwrap();
    // re-entrant read
    ctx.read_lock().unwrap();
    assert_eq!(ctx.value().unwrap().as_deref(), Some(&b"strong"[..]));
    assert!(ctx.contains().unwrap());
    ctx.unlock().unwrap();
    ctx.unlock().unwrap();
    // unlock without a matching lock is an error
    assert!(matches!(
        ctx.unlock(),
        Err(ShmapError::IllegalMonitorState { .. })
    ));
}

#[test]
fn update_context_mutates() {
    let map = Shmap::builder().build().expect("failed to create map");

    let mut ctx = map.update_context(b"coffee");
    ctx.update_lock().unwrap();
    assert!(ctx.value().unwrap().is_none());
    assert_eq!(ctx.put(b"strong").unwrap(), None);
    assert_eq!(ctx.value().unwrap().as_deref(), Some(&b"strong"[..]));
    assert_eq!(ctx.remove().unwrap().as_deref(), Some(&b"strong"[..]));
    assert!(ctx.value().unwrap().is_none());
    drop(ctx);

    assert!(map.get(b"coffee").unwrap().is_none());
    assert_eq!(map.len(), 0);
}

#[test]
fn forbidden_upgrade_within_context() {
    let map = Shmap::builder().build().expect("failed to create map");
    let mut ctx = map.update_context(b"coffee");
    ctx.read_lock().unwrap();
    assert!(matches!(
        ctx.update_lock(),
        Err(ShmapError::ForbiddenUpgrade { .. })
    ));
    assert!(matches!(
        ctx.write_lock(),
        Err(ShmapError::ForbiddenUpgrade { .. })
    ));
    // the read lock is untouched and the map still works after the failure
    assert!(ctx.value().unwrap().is_none());
    drop(ctx);
    map.put(b"coffee", b"strong").unwrap();
}

#[test]
fn forbidden_upgrade_across_contexts() {
    // with a single segment both keys land in the same segment, so an inner
    // update lock under an outer read lock is an upgrade in disguise
    let map = Shmap::builder()
        .segments(1)
        .build()
        .expect("failed to create map");
    map.put(b"coffee", b"strong").unwrap();

    let mut outer = map.query_context(b"coffee");
    outer.read_lock().unwrap();

    let mut inner = map.update_context(b"tea");
    assert!(matches!(
        inner.update_lock(),
        Err(ShmapError::OuterContextReadLocked { .. })
    ));
    assert!(matches!(
        inner.write_lock(),
        Err(ShmapError::OuterContextReadLocked { .. })
    ));
    drop(inner);

    // the outer context still holds its read lock
    assert_eq!(outer.value().unwrap().as_deref(), Some(&b"strong"[..]));
    drop(outer);

    // with the outer context closed the update lock is acquirable again
    let mut ctx = map.update_context(b"tea");
    ctx.update_lock().unwrap();
}

#[test]
fn try_locks_return_immediately() {
    let map = Shmap::builder()
        .segments(1)
        .build()
        .expect("failed to create map");

    let mut holder = map.update_context(b"coffee");
    holder.update_lock().unwrap();

    let mut contender = map.update_context(b"tea");
    // the update slot is taken: both variants fail without waiting
    assert_eq!(contender.try_update_lock().unwrap(), false);
    assert_eq!(
        contender.try_update_lock_for(Duration::ZERO).unwrap(),
        false
    );
    // reads are still admitted alongside the update holder
    assert!(contender.try_read_lock());
    contender.unlock().unwrap();

    // unlock downgrades the holder to read level: the update slot itself is
    // free, but taking it on this thread would be an upgrade in disguise
    holder.unlock().unwrap();
    assert!(matches!(
        contender.try_update_lock(),
        Err(ShmapError::OuterContextReadLocked { .. })
    ));

    // fully closing the holder frees the segment for this thread
    drop(holder);
    assert_eq!(contender.try_update_lock().unwrap(), true);
}

#[test]
fn deadlock_detection_reports_contexts() {
    let map = Shmap::builder()
        .segments(1)
        .lock_timeout(Duration::from_millis(50))
        .build()
        .expect("failed to create map");
    map.put(b"coffee", b"strong").unwrap();

    let barrier = Barrier::new(2);
    std::thread::scope(|s| {
        s.spawn(|| {
            let mut ctx = map.update_context(b"coffee");
            ctx.write_lock().unwrap();
            barrier.wait();
            std::thread::sleep(Duration::from_millis(400));
            drop(ctx);
        });
        barrier.wait();
        // the writer parks on the segment; our bounded wait must fail with
        // a diagnostic rather than hang
        match map.get(b"coffee") {
            Err(ShmapError::DeadLockDetected { snapshot, .. }) => {
                assert!(snapshot.contains("WriteLocked"));
            }
            other => panic!("expected deadlock detection, got {:?}", other),
        }
    });

    // after the writer releases, reads succeed again
    assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"strong"[..]));
}

#[test]
fn interruptible_lock_waits() {
    let map = Shmap::builder()
        .segments(1)
        .lock_timeout(Duration::from_secs(5))
        .build()
        .expect("failed to create map");

    // a pre-cancelled token interrupts before any wait
    let token = CancelToken::new();
    token.cancel();
    let mut ctx = map.query_context(b"coffee");
    assert!(matches!(
        ctx.read_lock_interruptibly(&token),
        Err(ShmapError::Interrupted)
    ));
    drop(ctx);

    // cancelling from another thread interrupts a parked waiter promptly
    let token = CancelToken::new();
    let barrier = Barrier::new(2);
    std::thread::scope(|s| {
        s.spawn(|| {
            let mut writer = map.update_context(b"coffee");
            writer.write_lock().unwrap();
            barrier.wait();
            std::thread::sleep(Duration::from_millis(300));
            drop(writer);
        });
        {
            let token = token.clone();
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                token.cancel();
            });
        }
        barrier.wait();
        let mut reader = map.query_context(b"coffee");
        let start = std::time::Instant::now();
        assert!(matches!(
            reader.read_lock_interruptibly(&token),
            Err(ShmapError::Interrupted)
        ));
        // interrupted well before the writer released
        assert!(start.elapsed() < Duration::from_millis(250));
    });
}

#[test]
fn concurrent_readers_see_whole_values() {
    let map = Shmap::builder()
        .segments(4)
        .entry_size(128)
        .build()
        .expect("failed to create map");
    map.put(b"coffee", &[b'a'; 64]).unwrap();

    std::thread::scope(|s| {
        s.spawn(|| {
            for i in 0..200 {
                let fill = if i % 2 == 0 { b'b' } else { b'a' };
                map.put(b"coffee", &[fill; 64]).unwrap();
            }
        });
        for _ in 0..2 {
            s.spawn(|| {
                for _ in 0..200 {
                    let value = map.get(b"coffee").unwrap().expect("key must stay present");
                    assert_eq!(value.len(), 64);
                    // a reader may see the old or the new value, never a mix
                    assert!(
                        value.iter().all(|b| *b == value[0]),
                        "torn read: {:?}",
                        value
                    );
                }
            });
        }
    });
}

#[test]
fn concurrent_distinct_keys() {
    let map = Shmap::builder()
        .segments(8)
        .tier_slots(256)
        .build()
        .expect("failed to create map");

    std::thread::scope(|s| {
        for t in 0..4u32 {
            let map = &map;
            s.spawn(move || {
                for i in 0..100u32 {
                    let key = format!("key-{}-{}", t, i);
                    map.put(key.as_bytes(), key.as_bytes()).unwrap();
                    assert_eq!(
                        map.get(key.as_bytes()).unwrap().as_deref(),
                        Some(key.as_bytes())
                    );
                }
            });
        }
    });
    assert_eq!(map.len(), 400);
}

#[test]
fn replicated_local_removal_leaves_tombstone() {
    let map = Shmap::builder()
        .replicated(7)
        .timestamp_source(fixed_clock)
        .build()
        .expect("failed to create map");

    map.put(b"coffee", b"strong").unwrap();
    assert_eq!(map.len(), 1);
    assert_eq!(
        map.remove(b"coffee").unwrap().as_deref(),
        Some(&b"strong"[..])
    );
    // the entry is gone from the read path
    assert!(map.get(b"coffee").unwrap().is_none());
    assert_eq!(map.len(), 0);

    // but its origin survives: a remote write older than the removal loses
    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"stale"), 99, 3)
            .unwrap(),
        AcceptanceDecision::Discard
    );
    assert!(map.get(b"coffee").unwrap().is_none());

    // and a newer remote write resurrects the key
    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"fresh"), 200, 3)
            .unwrap(),
        AcceptanceDecision::Accept
    );
    assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"fresh"[..]));
    assert_eq!(map.len(), 1);
    map.check_integrity().unwrap();
}

#[test]
fn replicated_local_writes_advance_past_the_clock() {
    let map = Shmap::builder()
        .replicated(7)
        .timestamp_source(fixed_clock)
        .build()
        .expect("failed to create map");

    // both writes happen at clock reading 100; the second must stamp 101 so
    // the origin tuple of the entry never moves backwards
    map.put(b"coffee", b"v1").unwrap();
    map.put(b"coffee", b"v2").unwrap();

    // a remote write at 100 from a lower node would beat a (100, 7) entry,
    // but loses against the advanced (101, 7) stamp
    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"remote"), 100, 2)
            .unwrap(),
        AcceptanceDecision::Discard
    );
    assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"v2"[..]));
}

#[test]
fn replicated_tie_breaks() {
    // identical tuple is discarded on its origin node
    let map = Shmap::builder()
        .replicated(7)
        .timestamp_source(fixed_clock)
        .build()
        .expect("failed to create map");
    map.put(b"coffee", b"local").unwrap();
    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"replayed"), 100, 7)
            .unwrap(),
        AcceptanceDecision::Discard
    );
    assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"local"[..]));

    // the same replay is accepted on a different node
    let other = Shmap::builder()
        .replicated(3)
        .timestamp_source(fixed_clock)
        .build()
        .expect("failed to create map");
    assert_eq!(
        other
            .remote_apply(b"coffee", RemoteOp::Put(b"replayed"), 100, 7)
            .unwrap(),
        AcceptanceDecision::Accept
    );
    assert_eq!(
        other
            .remote_apply(b"coffee", RemoteOp::Put(b"replayed"), 100, 7)
            .unwrap(),
        AcceptanceDecision::Accept
    );

    // lower node id wins a timestamp tie
    let map = Shmap::builder()
        .replicated(9)
        .timestamp_source(fixed_clock)
        .build()
        .expect("failed to create map");
    map.put(b"coffee", b"local").unwrap();
    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"remote"), 100, 2)
            .unwrap(),
        AcceptanceDecision::Accept
    );
    assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"remote"[..]));

    // a strictly newer remote write always wins
    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"newest"), 101, 9)
            .unwrap(),
        AcceptanceDecision::Accept
    );
    assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"newest"[..]));
}

#[test]
fn remote_remove_of_unknown_key_blocks_stale_write() {
    let map = Shmap::builder()
        .replicated(7)
        .timestamp_source(fixed_clock)
        .build()
        .expect("failed to create map");

    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Remove, 150, 3).unwrap(),
        AcceptanceDecision::Accept
    );
    assert!(map.get(b"coffee").unwrap().is_none());
    assert_eq!(map.len(), 0);

    // a write which raced with the removal cannot resurrect the key
    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"stale"), 140, 2)
            .unwrap(),
        AcceptanceDecision::Discard
    );
    assert!(map.get(b"coffee").unwrap().is_none());

    assert_eq!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"fresh"), 160, 2)
            .unwrap(),
        AcceptanceDecision::Accept
    );
    assert_eq!(map.get(b"coffee").unwrap().as_deref(), Some(&b"fresh"[..]));
}

#[test]
fn remote_apply_requires_replication() {
    let map = Shmap::builder().build().expect("failed to create map");
    assert!(matches!(
        map.remote_apply(b"coffee", RemoteOp::Put(b"strong"), 100, 2),
        Err(ShmapError::ReplicationDisabled)
    ));
}
