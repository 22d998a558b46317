// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A builder for configuring a new [`Shmap`] instance.

use crate::clock::{wall_clock_micros, TimestampSource};
use crate::context::ContextRegistry;
use crate::datapool::{Datapool, File, Memory};
use crate::error::ShmapError;
use crate::hashlookup::{HashLookup, MAX_ARENA_CAP};
use crate::layout::{read_header, write_header, Geometry, HeaderParams};
use crate::segment::{SegmentHeader, Tier};
use crate::shmap::{hash_builder, Replication, Shmap};

use std::path::{Path, PathBuf};
use std::time::Duration;

/// A builder that is used to construct a new [`Shmap`] instance.
pub struct Builder {
    segments: usize,
    tier_slots: usize,
    entry_size: usize,
    overflow_tiers: usize,
    datapool_path: Option<PathBuf>,
    node: Option<u8>,
    checksums: bool,
    lock_timeout: Duration,
    schema_digest: [u8; 16],
    clock: TimestampSource,
}

// Defines the default parameters
impl Default for Builder {
    fn default() -> Self {
        Self {
            segments: 64,
            tier_slots: 128,
            entry_size: 256,
            overflow_tiers: 64,
            datapool_path: None,
            node: None,
            checksums: false,
            lock_timeout: Duration::from_secs(2),
            schema_digest: [0; 16],
            clock: wall_clock_micros,
        }
    }
}

impl Builder {
    /// Specify the number of segments. Each segment is an independently
    /// lockable shard, so more segments means more write parallelism at the
    /// cost of per-segment memory overheads. The segment for a key is chosen
    /// by its hash; the count cannot change for the life of the file.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// // a small map with 4 lockable shards
    /// let map = Shmap::builder().segments(4).build().unwrap();
    /// ```
    pub fn segments(mut self, count: usize) -> Self {
        assert!(count > 0, "must have at least one segment");
        self.segments = count;
        self
    }

    /// Specify the number of hash slots per tier. Must be a power of two.
    /// Each tier holds an entry arena sized to three quarters of the slot
    /// count, so that a linear probe always terminates within the tier.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// // tiers with 256 slots hold up to 192 entries each
    /// let map = Shmap::builder().tier_slots(256).build().unwrap();
    /// ```
    pub fn tier_slots(mut self, slots: usize) -> Self {
        assert!(
            slots.is_power_of_two() && slots >= 2,
            "tier slots must be a power of two and at least 2"
        );
        self.tier_slots = slots;
        self
    }

    /// Specify the size of one entry slot in bytes, which bounds the largest
    /// storable entry: a 24 byte header plus key plus value must fit. Must
    /// be a multiple of 8.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// // allow entries up to 1KB
    /// let map = Shmap::builder().entry_size(1024).build().unwrap();
    /// ```
    pub fn entry_size(mut self, bytes: usize) -> Self {
        self.entry_size = bytes;
        self
    }

    /// Specify how many overflow tiers the shared pool holds. A segment
    /// whose resident tier fills up chains tiers from this pool. Once the
    /// pool is exhausted, inserts into full segments fail with
    /// `NoFreeTiers`.
    pub fn overflow_tiers(mut self, count: usize) -> Self {
        self.overflow_tiers = count;
        self
    }

    /// Specify a backing file for the map. If provided, the map is persisted
    /// and can be shared by every process mapping the same file. A file
    /// created by an earlier run is reopened, keeping its contents; its
    /// recorded geometry must match this builder's.
    ///
    /// Without a path the map lives in anonymous memory and is private to
    /// this process.
    pub fn datapool_path<T: AsRef<Path>>(mut self, path: Option<T>) -> Self {
        self.datapool_path = path.map(|p| p.as_ref().to_owned());
        self
    }

    /// Enable replication and set this node's identifier. Entries gain an
    /// origin timestamp and identifier, removals leave tombstones, and
    /// [`Shmap::remote_apply`] becomes available for applying modifications
    /// shipped from other nodes.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder().replicated(3).build().unwrap();
    /// ```
    pub fn replicated(mut self, node_id: u8) -> Self {
        self.node = Some(node_id);
        self
    }

    /// Enable per-entry checksums. Mutations compute the checksum lazily
    /// when their lock session downgrades; reads verify it and fail with
    /// `ChecksumMismatch` on corrupted entries.
    pub fn checksums(mut self, enable: bool) -> Self {
        self.checksums = enable;
        self
    }

    /// Specify the bound on every contended lock wait. A lock acquisition
    /// which cannot make progress within this budget fails with
    /// `DeadLockDetected` carrying a snapshot of the process's live
    /// contexts.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Record a digest of the key/value schema in the file header. Reopening
    /// a file whose digest differs fails, which keeps processes with
    /// incompatible serialization from sharing a map.
    pub fn schema_digest(mut self, digest: [u8; 16]) -> Self {
        self.schema_digest = digest;
        self
    }

    /// Substitute the origin timestamp source used by replicated maps.
    /// Defaults to the system wall clock in microseconds.
    pub fn timestamp_source(mut self, clock: TimestampSource) -> Self {
        self.clock = clock;
        self
    }

    /// Consumes the builder and returns a fully-allocated `Shmap` instance,
    /// creating or reopening the backing file when one is configured.
    ///
    /// ```
    /// use shmap::Shmap;
    ///
    /// let map = Shmap::builder()
    ///     .segments(16)
    ///     .tier_slots(512)
    ///     .entry_size(512)
    ///     .build()
    ///     .expect("failed to create map");
    /// ```
    pub fn build(self) -> Result<Shmap, ShmapError> {
        // three quarters of the slots, so a probe always finds an empty slot
        let arena_cap = ((self.tier_slots * 3 / 4).max(1))
            .min(self.tier_slots - 1)
            .min(MAX_ARENA_CAP);

        let geometry = Geometry {
            nseg: self.segments as u64,
            tier_slots: self.tier_slots as u64,
            arena_cap: arena_cap as u64,
            entry_size: self.entry_size as u64,
            total_tiers: (self.segments + self.overflow_tiers) as u64,
        };
        geometry.validate()?;
        let size = geometry.file_size();

        debug!(
            "map geometry: {} segments, {} tiers of {} slots / {} entries, {} byte file",
            geometry.nseg, geometry.total_tiers, geometry.tier_slots, geometry.arena_cap, size
        );

        let (mut pool, fresh, identity): (Box<dyn Datapool>, bool, String) =
            match &self.datapool_path {
                Some(path) => {
                    let pool = File::create(path, size, true)?;
                    let fresh = pool.newly_created();
                    (Box::new(pool), fresh, path.display().to_string())
                }
                None => (
                    Box::new(Memory::create(size, true)),
                    true,
                    "<anonymous>".to_string(),
                ),
            };
        debug_assert_eq!(pool.size(), size);
        let base = pool.base_ptr();

        let hl = HashLookup::new(geometry.tier_slots);
        if fresh {
            // initialize the resident tier of every segment, then commit the
            // header; the magic word is the last write
            for seg in 0..geometry.nseg {
                let header = unsafe { SegmentHeader::new(base, &geometry, seg) };
                header.set_chain_tail(seg);
                let tier = unsafe { Tier::new(base, &geometry, seg) };
                tier.reset(&hl);
            }
            unsafe {
                write_header(
                    base,
                    &HeaderParams {
                        geometry,
                        node: self.node,
                        schema_digest: self.schema_digest,
                    },
                )
            };
        } else {
            let header = unsafe { read_header(base as *const u8, size) }?;
            if header.geometry != geometry {
                return Err(ShmapError::BadHeader {
                    reason: format!(
                        "file geometry {:?} does not match the configured {:?}",
                        header.geometry, geometry
                    ),
                });
            }
            if header.schema_digest != self.schema_digest {
                return Err(ShmapError::BadHeader {
                    reason: "schema digest mismatch".to_string(),
                });
            }
            if header.node != self.node {
                return Err(ShmapError::BadHeader {
                    reason: format!(
                        "replication identity {:?} does not match the configured {:?}",
                        header.node, self.node
                    ),
                });
            }
            debug!("reopened existing map at {}", identity);
        }

        Ok(Shmap {
            pool,
            base,
            geometry,
            hl,
            hash_builder: Box::new(hash_builder()),
            identity,
            replication: self.node.map(|node_id| Replication {
                node_id,
                clock: self.clock,
            }),
            checksums: self.checksums,
            lock_timeout: self.lock_timeout,
            registry: ContextRegistry::new(),
        })
    }
}
