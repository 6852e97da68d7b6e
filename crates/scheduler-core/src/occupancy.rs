// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The occupancy tracker (§4.4).

use crate::key::{TaskKey, WorkerKey};
use crate::store::SchedulerState;
use crate::worker::OccupancyClass;

/// Estimated wall-clock seconds for `task` to run on `worker`: the prefix's EWMA
/// mean duration, inflated by `worker`'s share of the task's input transfer (§4.2
/// step 3 already prices comm time into placement; this is the pure compute estimate
/// recorded on `processing` and folded into `occupancy`).
#[must_use]
pub fn duration_estimate(state: &SchedulerState, task_key: TaskKey, _worker_key: WorkerKey) -> f64 {
    let prefix = &state.tasks[task_key].prefix;
    state.mean_duration(prefix)
}

/// Reclassifies `worker` as idle, saturated, or neither, and updates the
/// `idle`/`saturated` index sets accordingly (§4.4):
///
/// - idle iff `p < nc` or `occupancy / nc < avg / 2`
/// - saturated iff `p > nc` and `pending_per_core > 0.4` and `pending_per_core > 1.9 * avg`
///
/// where `p` is the number of tasks processing on the worker, `nc` its core count,
/// `avg` the cluster-wide mean occupancy per core, and
/// `pending_per_core = occupancy * (p - nc) / (p * nc)`.
pub fn check_idle_saturated(state: &mut SchedulerState, worker_key: WorkerKey) {
    let class = classify(state, worker_key);
    match class {
        OccupancyClass::Idle => {
            state.idle.insert(worker_key);
            state.saturated.remove(&worker_key);
        }
        OccupancyClass::Saturated => {
            state.saturated.insert(worker_key);
            state.idle.remove(&worker_key);
        }
        OccupancyClass::Neither => {
            state.idle.remove(&worker_key);
            state.saturated.remove(&worker_key);
        }
    }
}

fn classify(state: &SchedulerState, worker_key: WorkerKey) -> OccupancyClass {
    let worker = &state.workers[worker_key];
    let p = worker.processing.len();
    let nc = worker.ncores.max(1);
    let occupancy = worker.occupancy;
    let avg = average_occupancy_per_core(state);

    if p < nc || (occupancy / nc as f64) < avg / 2.0 {
        return OccupancyClass::Idle;
    }

    if p > nc {
        let pending_per_core = occupancy * (p as f64 - nc as f64) / (p as f64 * nc as f64);
        if pending_per_core > 0.4 && pending_per_core > 1.9 * avg {
            return OccupancyClass::Saturated;
        }
    }

    OccupancyClass::Neither
}

fn average_occupancy_per_core(state: &SchedulerState) -> f64 {
    if state.total_ncores == 0 {
        return 0.0;
    }
    state.total_occupancy / state.total_ncores as f64
}
