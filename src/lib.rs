// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! This crate is a persistent, memory-mapped hash map shared between
//! processes.
//!
//! The map lives entirely inside one backing file. It is partitioned into
//! independently lockable segments, each guarded by a three-level
//! read/update/write lock whose state word sits in shared memory, so any
//! number of threads across any number of processes can operate on the same
//! file concurrently. Entries are found through compact open-addressed hash
//! slot arrays; a segment that outgrows its resident tier chains overflow
//! tiers from a shared pool.
//!
//! Maps can optionally be replicated between nodes under a last-write-wins
//! eventual consistency policy: entries carry an origin timestamp and node
//! identifier, removals leave tombstones, and a deterministic acceptance
//! rule decides whether a modification shipped from another node is applied
//! or discarded.
//!
//! Goals:
//! * concurrent access from multiple processes over one mapped file
//! * bounded lock waits with actionable diagnostics
//! * deterministic convergence for replicated deployments
//!
//! Non-goals:
//! * strong consistency or transactions across keys
//! * resizing the segment or tier geometry of an existing file
//!

// macro includes
#[macro_use]
extern crate log;

// submodules
mod builder;
mod clock;
mod context;
mod datapool;
mod entry;
mod error;
mod hashlookup;
mod layout;
mod lock;
mod replication;
mod segment;
mod shmap;

// tests
#[cfg(test)]
mod tests;

// publicly exported items from submodules
pub use crate::shmap::Shmap;
pub use builder::Builder;
pub use clock::TimestampSource;
pub use context::{QueryContext, UpdateContext};
pub use error::ShmapError;
pub use lock::CancelToken;
pub use replication::{AcceptanceDecision, RemoteOp};
