// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Origin timestamp source for replicated maps.
//!
//! Timestamps must be comparable across nodes, so they are wall-clock
//! microseconds since the unix epoch rather than a process-local monotonic
//! clock. The source is injectable through the builder so that tests (and
//! deployments with their own time service) can substitute a deterministic
//! clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Signature of a timestamp source: microseconds since the unix epoch.
pub type TimestampSource = fn() -> u64;

/// The default timestamp source, reading the system wall clock.
pub fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
