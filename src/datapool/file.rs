// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A file backed datapool implemented by memory mapping the file. This is
//! what makes a map persistent and lets several processes share it: every
//! process mapping the same file sees the same bytes.

use crate::datapool::Datapool;
use memmap2::{MmapMut, MmapOptions};

use std::fs::OpenOptions;
use std::io::{Error, ErrorKind};
use std::path::Path;

const PAGE_SIZE: usize = 4096;

/// A datapool over a memory mapped file.
pub struct File {
    mmap: MmapMut,
    size: usize,
    created: bool,
}

impl File {
    /// Open the file at `path` as a datapool of exactly `size` bytes,
    /// creating it when it does not exist. An existing file of any other
    /// size is rejected rather than resized, since its layout was computed
    /// from a different geometry. [`Self::newly_created`] reports which case
    /// happened, so the caller knows whether to initialize the region or
    /// validate what it finds there.
    pub fn create<T: AsRef<Path>>(path: T, size: usize, prefault: bool) -> Result<Self, Error> {
        match std::fs::metadata(&path) {
            Ok(meta) if meta.len() != size as u64 => Err(Error::new(
                ErrorKind::Other,
                "existing file has wrong size",
            )),
            Ok(_) => Self::open_existing(path.as_ref(), size),
            Err(_) => Self::create_new(path.as_ref(), size, prefault),
        }
    }

    fn open_existing(path: &Path, size: usize) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
        Ok(Self {
            mmap,
            size,
            created: false,
        })
    }

    fn create_new(path: &Path, size: usize, prefault: bool) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(size as u64)?;

        let mut mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
        if prefault {
            // touch one byte per page so the whole file is resident up front
            for page in mmap.chunks_mut(PAGE_SIZE) {
                page[0] = 0;
            }
            mmap.flush()?;
        }

        Ok(Self {
            mmap,
            size,
            created: true,
        })
    }

    /// True when this call created the backing file, false when an existing
    /// file of the right size was opened.
    pub fn newly_created(&self) -> bool {
        self.created
    }
}

impl Datapool for File {
    fn base_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn flush(&self) -> Result<(), Error> {
        self.mmap.flush()
    }
}
