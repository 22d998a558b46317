// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A simple memory backed datapool, heap-allocated and private to the
//! process. Used for maps without a backing file, and throughout the tests.
//!
//! The allocation is made in 64 bit words: lock words, hash slots, and
//! counters are atomics at 8 byte aligned offsets, and a plain byte
//! allocation does not guarantee the base alignment the trait requires.

use crate::datapool::Datapool;

/// A contiguous allocation of bytes in main memory
pub struct Memory {
    data: Box<[u64]>,
    size: usize,
}

impl Memory {
    /// Create a new `Memory` datapool with the specified size (in bytes)
    pub fn create(size: usize, prefault: bool) -> Self {
        let words = (size + 7) / 8;

        // We allow slow vector initialization here because it is necessary
        // for prefaulting the vector. If we use just the macro, the memory
        // region is allocated but will not become resident.
        #[allow(clippy::slow_vector_initialization)]
        let data = if prefault {
            let mut data = Vec::with_capacity(words);
            data.resize(words, 0);
            data
        } else {
            vec![0; words]
        };

        let data = data.into_boxed_slice();

        Self { data, size }
    }
}

impl Datapool for Memory {
    fn base_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr() as *mut u8
    }

    fn size(&self) -> usize {
        self.size
    }

    fn flush(&self) -> Result<(), std::io::Error> {
        Ok(())
    }
}
