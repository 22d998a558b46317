// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Eventual consistency for replicated maps: last write wins. If two writes
//! to a single entry occurred simultaneously on different nodes, the write
//! from the node with the lower identifier wins.
//!
//! The decision function is stateless, total, and deterministic, so every
//! node presented with the same local entry and remote modification reaches
//! the same decision and the replica set converges.

use crate::entry::OriginMeta;

/// Decision made about a remote modification operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptanceDecision {
    /// The remote modification is applied to the local map state.
    Accept,
    /// The remote modification is rejected.
    Discard,
}

/// A modification shipped from a remote node.
#[derive(Clone, Copy, Debug)]
pub enum RemoteOp<'a> {
    /// The remote node wrote this value
    Put(&'a [u8]),
    /// The remote node removed the entry
    Remove,
}

/// Decide whether a remote modification stamped `(remote_ts, remote_id)`
/// should be applied over the local entry carrying `origin`. `current_node`
/// is the identifier of the node making the decision.
pub(crate) fn decide_on_remote_modification(
    origin: OriginMeta,
    remote_ts: u64,
    remote_id: u8,
    current_node: u8,
) -> AcceptanceDecision {
    use AcceptanceDecision::*;

    // last write wins
    if remote_ts > origin.ts {
        return Accept;
    }
    if remote_ts < origin.ts {
        return Discard;
    }
    // identical timestamps: lower identifier wins
    if remote_id < origin.id {
        return Accept;
    }
    if remote_id > origin.id {
        return Discard;
    }
    // The whole tuple is equal. This happens when the entry is bootstrapped
    // back to its origin node (the update is redundant there), or when the
    // node with this identifier was lost and restarted with a clock that
    // collides with an entry it already holds. Discarding on the origin node
    // and accepting everywhere else lets the restarted node's fresh writes
    // win locally and still propagate through the rest of the replica set.
    if origin.id == current_node {
        Discard
    } else {
        Accept
    }
}
