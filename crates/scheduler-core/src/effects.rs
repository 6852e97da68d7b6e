// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Outbound effects produced by the transition engine.
//!
//! Transitions, placement, and stimulus handlers never perform I/O directly (§4.3,
//! §5): they accumulate `Effect`s describing what should be sent to which peer, and
//! the caller enacts them via its outbox queues once the transition closure
//! finishes. This keeps the closure itself synchronous and observably atomic.

use smallvec::SmallVec;

/// One message to send to a worker or client as a side effect of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send `compute-task` to `worker` for `key` (§6).
    ComputeTask {
        worker: String,
        key: String,
        duration_estimate_secs: f64,
    },
    /// Send `release-task` to `worker`: it computed a result nobody tracked anymore.
    ReleaseTask { worker: String, key: String },
    /// Send `delete-data` to `worker` for the given keys (§6, rebalance/memory->released).
    DeleteData { worker: String, keys: Vec<String> },
    /// Send `close` to `worker` (adaptive scale-down, §4.7).
    Close { worker: String },
    /// Ask `worker` to `gather` `key` from `from`, as part of replicate/rebalance (§4.6).
    Gather {
        worker: String,
        key: String,
        from: String,
    },
    /// Notify a client its desired key reached memory (§6).
    KeyInMemory { client: String, key: String },
    /// Notify a client that a task it wanted failed terminally (§6, §7).
    TaskErred {
        client: String,
        key: String,
        exception: Vec<u8>,
        traceback: Vec<u8>,
    },
    /// Notify a client that one of its keys was cancelled (§6).
    CancelledKey { client: String, key: String },
}

/// Accumulator for effects produced while applying a closure of transitions.
/// Most closures produce only a handful of effects (one `compute-task`, maybe a
/// notification or two), so they live inline rather than behind a heap `Vec` in
/// the common case.
#[derive(Debug, Clone, Default)]
pub struct Effects(pub SmallVec<[Effect; 4]>);

impl Effects {
    #[must_use]
    pub fn new() -> Self {
        Self(SmallVec::new())
    }

    pub fn push(&mut self, effect: Effect) {
        self.0.push(effect);
    }

    pub fn extend(&mut self, other: Effects) {
        self.0.extend(other.0);
    }
}
