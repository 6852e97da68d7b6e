// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Core scheduling engine: the task/worker/client state store, the transition
//! engine that drives the task state machine, the placement and occupancy
//! trackers that feed it, and the stimulus handlers, work-stealing, rebalancing,
//! and adaptive control loop built on top of it.
//!
//! This crate has no network or async dependency: every public entry point is a
//! synchronous function over `SchedulerState` that returns the `Effect`s its
//! caller should enact. See `effects` for why.

pub mod adaptive;
pub mod client;
pub mod effects;
pub mod error;
pub mod key;
pub mod occupancy;
pub mod placement;
pub mod rebalance;
pub mod stealing;
pub mod stimuli;
pub mod store;
pub mod task;
pub mod transition;
pub mod worker;

pub use client::Client;
pub use effects::{Effect, Effects};
pub use error::Error;
pub use key::{ClientKey, TaskKey, WorkerKey};
pub use store::SchedulerState;
pub use task::{Task, TaskState};
pub use transition::{transition, transitions, Recommendation, TransitionArgs};
pub use worker::{Worker, WorkerStatus};
