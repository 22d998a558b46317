// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Datapools are the contiguous byte regions backing a map.
//!
//! The map addresses segment headers, lock words, slots, and arenas at
//! offsets computed from the geometry, and touches shared words through
//! atomics. A datapool therefore hands out one stable base pointer for the
//! life of the mapping instead of lending out slices: a slice borrow would
//! claim exclusive access to bytes which other threads and processes are
//! concurrently reading and writing under the lock protocol.
//!
//! Implementations differ only in where the bytes live: anonymous heap
//! memory private to the process, or a memory mapped file shared between
//! processes.

mod file;
mod memory;

pub use file::File;
pub use memory::Memory;

/// A contiguous allocation backing a map.
pub trait Datapool: Send {
    /// Base pointer of the region, 8 byte aligned. The pointer stays valid
    /// and unchanged until the datapool is dropped; all access to the region
    /// goes through it at computed offsets.
    fn base_ptr(&mut self) -> *mut u8;

    /// Size of the region in bytes
    fn size(&self) -> usize;

    /// Persist the region to the backing store. This may be a no-op for
    /// datapools which cannot persist data.
    fn flush(&self) -> Result<(), std::io::Error>;
}
