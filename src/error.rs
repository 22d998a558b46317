// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Top-level errors that will be returned to a caller of this library.

use thiserror::Error;

#[derive(Error, Debug)]
/// Possible errors returned by the top-level API
pub enum ShmapError {
    #[error("{identity}: lock acquisition failed within the wait budget\n{snapshot}")]
    DeadLockDetected { identity: String, snapshot: String },
    #[error("{identity}: cannot upgrade from read to update or write lock")]
    ForbiddenUpgrade { identity: String },
    #[error(
        "{identity}: cannot acquire update or write lock, because an outer context \
         holds the read lock; acquire the update lock in the outer context up front"
    )]
    OuterContextReadLocked { identity: String },
    #[error("{identity}: unlock without a matching lock")]
    IllegalMonitorState { identity: String },
    #[error("{identity}: hash lookup overflow should never occur")]
    HashLookupOverflow { identity: String },
    #[error("lock wait interrupted")]
    Interrupted,
    #[error("lock wait timed out")]
    Timeout,
    #[error("entry oversized ({size} bytes, entry slots hold {max})")]
    EntryOversized { size: usize, max: usize },
    #[error("no free tiers in the overflow pool")]
    NoFreeTiers,
    #[error("bad map header: {reason}")]
    BadHeader { reason: String },
    #[error("{identity}: entry checksum mismatch, data corruption detected")]
    ChecksumMismatch { identity: String },
    #[error("{identity}: data corruption detected")]
    DataCorrupted { identity: String },
    #[error("map was not built with replication enabled")]
    ReplicationDisabled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
