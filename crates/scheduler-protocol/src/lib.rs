// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Wire messages and framing for the scheduler's worker/client peer channels (§6).
//!
//! This crate owns only the shapes on the wire and the batched-send contract
//! (§5): it never touches scheduler state. A peer channel is a duplex stream of
//! length-prefixed binary frames; each frame decodes to a [`Batch`] of one or
//! more [`WorkerMessage`]/[`ClientMessage`] (received side) or
//! [`SchedulerToWorker`]/[`SchedulerToClient`] (sent side).

/// Message shapes exchanged on worker and client peer channels.
pub mod messages;
/// Length-prefixed framing and the interval-batched outgoing queue.
pub mod framing;

pub use messages::{ClientMessage, SchedulerToClient, SchedulerToWorker, WorkerMessage};
