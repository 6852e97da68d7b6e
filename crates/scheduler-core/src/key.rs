// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Internal arena keys.
//!
//! Tasks, workers, and clients are addressed externally by opaque string keys
//! (task key, worker address, client id) but internally by `slotmap` indices so that
//! cross-entity references (dependencies, `who_has`, `processing_on`, ...) are O(1)
//! hops instead of string hashing, and so that removing an entity invalidates every
//! reference to it rather than leaving a dangling string around.

use slotmap::new_key_type;

new_key_type! {
    /// Stable index of a [`crate::task::Task`] in the scheduler's task arena.
    pub struct TaskKey;
}

new_key_type! {
    /// Stable index of a [`crate::worker::Worker`] in the scheduler's worker arena.
    pub struct WorkerKey;
}

new_key_type! {
    /// Stable index of a [`crate::client::Client`] in the scheduler's client arena.
    pub struct ClientKey;
}
