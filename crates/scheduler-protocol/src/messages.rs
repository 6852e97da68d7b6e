// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Message enums for the worker and client peer channels (§6).
//!
//! Every variant here corresponds to exactly one named message in §6's interface
//! tables. Payloads carry opaque `Vec<u8>` for task specs, exceptions, and
//! tracebacks: this crate, like the core, never introspects them (§9, "Exceptions
//! as data").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messages a worker sends to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// First message on a new worker connection.
    Register {
        address: String,
        ncores: usize,
        host: String,
        services: HashMap<String, String>,
        resources: HashMap<String, f64>,
        /// Keys the worker already holds in memory from a prior connection (§4.3 `add_worker`).
        nbytes_known: Vec<(String, i64)>,
    },
    /// Periodic liveness signal; cadence is a function of cluster size (§6).
    Heartbeat { address: String },
    /// A task this worker was assigned completed successfully.
    TaskFinished {
        address: String,
        key: String,
        nbytes: i64,
    },
    /// A task this worker was assigned raised an exception.
    TaskErred {
        address: String,
        key: String,
        exception: Vec<u8>,
        traceback: Vec<u8>,
    },
    /// The worker could not fetch a dependency it expected a peer to hold.
    MissingData { cause_key: String, reporting_worker: String },
    /// A task has been running long enough to report an observed duration without
    /// having finished (§4.3 `long_running`).
    LongRunning { address: String, key: String, compute_duration_secs: f64 },
    /// The worker evicted some keys from its own memory (LRU pressure, explicit
    /// release) without being told to.
    ReleaseWorkerData { address: String, keys: Vec<String> },
    /// The worker observed extra in-memory keys the scheduler did not assign it
    /// (e.g. received via gather for a since-cancelled rebalance).
    AddKeys { address: String, keys: Vec<(String, i64)> },
    /// The worker asks to be re-registered after an internal restart.
    Reschedule { address: String },
    /// Graceful disconnect notice, distinct from a dropped connection.
    Unregister { address: String, safe: bool },
}

/// Messages the scheduler sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerToWorker {
    /// Acknowledges registration and tells the worker how often to heartbeat,
    /// a function of cluster size (§6 "Heartbeat cadence").
    Registered { heartbeat_interval_secs: f64 },
    /// Assigns `key` to run on this worker.
    ComputeTask {
        key: String,
        run_spec: Vec<u8>,
        priority: (u64, f64),
        duration_estimate_secs: f64,
        /// For each dependency: its key, the workers known to hold it, and its byte size.
        dependencies: Vec<(String, Vec<String>, i64)>,
        resource_restrictions: HashMap<String, f64>,
    },
    /// The worker computed `key` but nobody wants it anymore; drop it without reporting.
    ReleaseTask { key: String },
    /// Evict the given keys from this worker's memory.
    DeleteData { keys: Vec<String> },
    /// Graceful shutdown request (adaptive scale-down, explicit admin action).
    Close,
    /// Fetch `key` from `from` as part of a rebalance/replicate operation.
    Gather { key: String, from: String },
}

/// Messages a client sends to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Submits (a fragment of) a computation graph.
    UpdateGraph {
        client_id: String,
        tasks: Vec<GraphTask>,
        /// Keys the client wants kept and notified about; others are intermediate.
        keys: Vec<String>,
        /// Key of the already-running task this graph was submitted from, if any
        /// (a task calling back into the client from a worker). New tasks inherit
        /// priority just ahead of this task rather than starting a fresh generation.
        submitted_by: Option<String>,
    },
    /// Declares continued interest in already-submitted keys.
    ClientDesiresKeys { client_id: String, keys: Vec<String> },
    /// Withdraws interest in keys this client previously wanted.
    ClientReleasesKeys { client_id: String, keys: Vec<String> },
    /// Requests cancellation of keys, optionally overriding other clients' interest.
    Cancel { client_id: String, keys: Vec<String>, force: bool },
    /// Requests every worker be restarted (drops all in-memory state, §4.8).
    Restart,
    /// Injects already-computed data directly into memory on one or more workers.
    Scatter { client_id: String, data: Vec<(String, i64)>, workers: Option<Vec<String>> },
    /// Requests the current bytes of one or more in-memory keys be returned inline.
    Gather { keys: Vec<String> },
    /// Subscribes to a named feed of scheduler events.
    Feed { client_id: String, name: String },
    /// Requests a rebalance of in-memory data across `workers` (all connected
    /// workers if `None`), restricted to `keys` (all in-memory tasks if `None`).
    Rebalance { keys: Option<Vec<String>>, workers: Option<Vec<String>> },
    /// Requests each of `keys` be replicated to at least `n` holders (§4.6).
    Replicate { keys: Vec<String>, n: usize, branching_factor: usize, delete: bool },
}

/// One task description inside an `UpdateGraph` message (§6, §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphTask {
    pub key: String,
    /// `None` for pure-data tasks (already-scattered inputs).
    pub run_spec: Option<Vec<u8>>,
    pub dependencies: Vec<String>,
    pub host_restrictions: Vec<String>,
    pub worker_restrictions: Vec<String>,
    pub loose_restrictions: bool,
    pub resource_restrictions: HashMap<String, f64>,
    pub retries: u32,
    /// Explicit order within this graph generation; `None` uses submission order.
    pub priority_order: Option<f64>,
}

/// Messages the scheduler sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerToClient {
    /// Acknowledges a new client connection and assigns it an id.
    StreamStart { client_id: String },
    /// A key the client wants reached `memory`.
    KeyInMemory { key: String, nbytes: i64 },
    /// A key the client wants failed terminally.
    TaskErred { key: String, exception: Vec<u8>, traceback: Vec<u8> },
    /// A key the client wanted was cancelled before completion.
    CancelledKey { key: String },
    /// Notifies the client a cluster-wide restart occurred.
    Restart,
    /// The client's stream is closing (scheduler shutdown or explicit disconnect).
    StreamClosed,
}

/// A batch of sub-messages delivered as one unit, preserving order (§5, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch<M> {
    pub messages: Vec<M>,
}

impl<M> Batch<M> {
    #[must_use]
    pub fn new(messages: Vec<M>) -> Self {
        Self { messages }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
