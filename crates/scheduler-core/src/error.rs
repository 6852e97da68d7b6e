// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the scheduler core (§7).
//!
//! Stimulus handlers never raise these to the caller's event loop: they catch,
//! log, and translate the failure into either a state transition or a dropped
//! message (§7, "Propagation policy"). `Error` surfaces only from APIs where the
//! caller genuinely needs to decide what to do next (e.g. `transition` rejecting
//! an illegal edge), and is typed so call sites can match on it rather than
//! string-match a message.

use crate::task::TaskState;

/// Errors that can occur while driving the task state machine.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A worker reported an exception while executing a task. Retried up to
    /// `retries` times before becoming terminal.
    #[error("task {key} failed on worker {worker}: {exception_summary}")]
    TaskComputationError {
        /// The task that failed.
        key: String,
        /// The worker that reported the failure.
        worker: String,
        /// Short, non-opaque summary for logs; the exception payload itself is never
        /// introspected by the core.
        exception_summary: String,
    },

    /// `suspicious > allowed_failures`; the task is poisoned and will not be retried.
    #[error("task {key} poisoned after {suspicious} failures (last worker: {last_worker})")]
    PoisonedTaskError {
        /// The poisoned task.
        key: String,
        /// Number of observed failures.
        suspicious: u32,
        /// The worker whose failure crossed the threshold.
        last_worker: String,
    },

    /// The peer channel to a worker closed, or its heartbeat was missed.
    #[error("worker {address} lost")]
    WorkerLost {
        /// The lost worker's address.
        address: String,
    },

    /// A client's peer channel closed.
    #[error("client {id} disconnected")]
    ClientDisconnected {
        /// The disconnected client's id.
        id: String,
    },

    /// A task's restrictions cannot be satisfied by any currently registered worker.
    /// Non-fatal: the task sits in `no-worker` until cluster topology changes.
    #[error("task {key} has no valid worker given current restrictions")]
    BadRestriction {
        /// The affected task.
        key: String,
    },

    /// A message from a peer could not be parsed. The message is dropped; the peer
    /// connection is kept.
    #[error("protocol error from {peer}: {details}")]
    ProtocolError {
        /// The offending peer.
        peer: String,
        /// Description of the parse failure.
        details: String,
    },

    /// Fatal at startup only.
    #[error("configuration error: {details}")]
    ConfigurationError {
        /// Description of the invalid configuration.
        details: String,
    },

    /// The adaptive control loop's resource-manager call failed persistently after
    /// retries. The loop stops; the scheduler otherwise keeps running.
    #[error("adaptive control loop failed: {details}")]
    AdaptiveError {
        /// Description of the failure.
        details: String,
    },

    /// Attempted an edge the transition engine does not define (§4.1, §8 P2).
    #[error("illegal transition for task {key}: {from} -> {to}")]
    IllegalTransition {
        /// The task the caller tried to transition.
        key: String,
        /// The task's current state.
        from: TaskState,
        /// The requested target state.
        to: TaskState,
    },

    /// Referenced a task/worker/client key that is not in the relevant table.
    #[error("unknown {kind} key: {key}")]
    UnknownKey {
        /// Which table was searched (`"task"`, `"worker"`, `"client"`).
        kind: &'static str,
        /// The key that was not found.
        key: String,
    },
}
