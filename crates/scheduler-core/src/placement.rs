// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The placement engine (§4.2).

use crate::key::{TaskKey, WorkerKey};
use crate::store::SchedulerState;
use std::collections::HashSet;

/// Computes the set of workers satisfying a task's worker/host/resource
/// restrictions (§4.2 step 1). Returns `None` when the task has `loose_restrictions`
/// and no worker qualifies but *some* worker exists to fall back to; returns
/// `Some(empty)` when restrictions are hard and unsatisfiable (the caller should
/// treat that as "no valid worker" => `no-worker`).
#[must_use]
pub fn valid_workers(state: &SchedulerState, task_key: TaskKey) -> Option<HashSet<WorkerKey>> {
    let task = &state.tasks[task_key];
    let all_connected: HashSet<WorkerKey> = state.connected_workers().collect();
    if all_connected.is_empty() {
        return Some(HashSet::new());
    }

    let mut candidates = all_connected.clone();

    if !task.worker_restrictions.is_empty() {
        let by_address: HashSet<WorkerKey> = candidates
            .iter()
            .copied()
            .filter(|w| task.worker_restrictions.contains(&state.workers[*w].address))
            .collect();
        candidates = by_address;
    }

    if !task.host_restrictions.is_empty() {
        let mut by_host = HashSet::new();
        for host in &task.host_restrictions {
            if let Some(workers) = state.host_index.get(host) {
                by_host.extend(workers.iter().copied());
            }
        }
        candidates.retain(|w| by_host.contains(w));
    }

    for (resource, qty) in &task.resource_restrictions {
        candidates.retain(|w| state.workers[*w].has_resource(resource, *qty));
    }

    if candidates.is_empty() && !task.loose_restrictions {
        return Some(HashSet::new());
    }
    if candidates.is_empty() && task.loose_restrictions {
        // Loose restrictions: fall back to any connected worker rather than stall.
        return Some(all_connected);
    }

    Some(candidates)
}

/// Picks a worker for a runnable task, or `None` if none is valid (§4.2).
#[must_use]
pub fn decide_worker(state: &mut SchedulerState, task_key: TaskKey) -> Option<WorkerKey> {
    let valid = valid_workers(state, task_key)?;
    if valid.is_empty() {
        return None;
    }

    let candidates = candidate_set(state, task_key, &valid);
    if candidates.is_empty() {
        return None;
    }

    if candidates.len() == 1 {
        return candidates.into_iter().next();
    }

    best_by_objective(state, task_key, &candidates)
}

/// §4.2 step 2: narrows `valid` down to the candidates worth ranking.
fn candidate_set(state: &mut SchedulerState, task_key: TaskKey, valid: &HashSet<WorkerKey>) -> HashSet<WorkerKey> {
    let task = &state.tasks[task_key];
    if !task.dependencies.is_empty() {
        let mut freq: std::collections::HashMap<WorkerKey, u32> = std::collections::HashMap::new();
        for dep in &task.dependencies {
            for holder in &state.tasks[*dep].who_has {
                if valid.contains(holder) {
                    *freq.entry(*holder).or_insert(0) += 1;
                }
            }
        }
        if let Some(&max) = freq.values().max() {
            return freq
                .into_iter()
                .filter(|(_, count)| *count == max)
                .map(|(w, _)| w)
                .collect();
        }
        // No dependency holder is in the valid set; fall through to idle/least-loaded.
    }

    let idle_valid: Vec<WorkerKey> = state.idle.iter().copied().filter(|w| valid.contains(w)).collect();
    if !idle_valid.is_empty() {
        return round_robin_pick(state, &idle_valid).into_iter().collect();
    }

    least_occupied(state, valid).into_iter().collect()
}

/// Round-robins through `idle_valid` using a cursor carried on the state: a linear
/// scan when there are few idle workers, a modulo index when there are many (§4.2).
fn round_robin_pick(state: &mut SchedulerState, idle_valid: &[WorkerKey]) -> Option<WorkerKey> {
    if idle_valid.is_empty() {
        return None;
    }
    let idx = state.idle_round_robin_cursor % idle_valid.len();
    state.idle_round_robin_cursor = state.idle_round_robin_cursor.wrapping_add(1);
    Some(idle_valid[idx])
}

fn least_occupied(state: &SchedulerState, valid: &HashSet<WorkerKey>) -> Option<WorkerKey> {
    valid
        .iter()
        .copied()
        .min_by(|a, b| {
            state.workers[*a]
                .occupancy
                .partial_cmp(&state.workers[*b].occupancy)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Bytes of `task`'s dependencies not already resident on `worker`.
#[must_use]
pub fn comm_bytes(state: &SchedulerState, task_key: TaskKey, worker: WorkerKey) -> i64 {
    state.tasks[task_key]
        .dependencies
        .iter()
        .filter(|dep| !state.tasks[**dep].who_has.contains(&worker))
        .map(|dep| state.tasks[*dep].nbytes.max(0))
        .sum()
}

/// `start_time = comm_bytes/BANDWIDTH + occupancy/ncores` (§4.2 step 3).
#[must_use]
pub fn start_time_estimate(state: &SchedulerState, task_key: TaskKey, worker: WorkerKey) -> f64 {
    let bytes = comm_bytes(state, task_key, worker) as f64;
    let w = &state.workers[worker];
    let ncores = w.ncores.max(1) as f64;
    bytes / state.config.bandwidth + w.occupancy / ncores
}

fn best_by_objective(state: &SchedulerState, task_key: TaskKey, candidates: &HashSet<WorkerKey>) -> Option<WorkerKey> {
    candidates
        .iter()
        .copied()
        .min_by(|a, b| {
            let obj_a = (start_time_estimate(state, task_key, *a), state.workers[*a].nbytes);
            let obj_b = (start_time_estimate(state, task_key, *b), state.workers[*b].nbytes);
            obj_a
                .0
                .partial_cmp(&obj_b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(obj_a.1.cmp(&obj_b.1))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use scheduler_config::SchedulingConfig;

    #[test]
    fn valid_workers_respects_resource_restrictions() {
        let mut state = SchedulerState::new(SchedulingConfig::default());
        let w1 = state.insert_worker(Worker::new("w1", 2, "h1"));
        let mut gpu_worker = Worker::new("w2", 2, "h2");
        gpu_worker.resources.insert("GPU".to_string(), 1.0);
        let w2 = state.insert_worker(gpu_worker);

        let task = state.get_or_create_task("t");
        state
            .tasks
            .get_mut(task)
            .unwrap()
            .resource_restrictions
            .insert("GPU".to_string(), 1.0);

        let valid = valid_workers(&state, task).unwrap();
        assert!(!valid.contains(&w1));
        assert!(valid.contains(&w2));
    }

    #[test]
    fn no_worker_when_restrictions_unsatisfiable_and_strict() {
        let mut state = SchedulerState::new(SchedulingConfig::default());
        state.insert_worker(Worker::new("w1", 2, "h1"));
        let task = state.get_or_create_task("t");
        state
            .tasks
            .get_mut(task)
            .unwrap()
            .worker_restrictions
            .insert("tcp://nonexistent".to_string());

        assert_eq!(decide_worker(&mut state, task), None);
    }

    #[test]
    fn prefers_worker_holding_dependency() {
        let mut state = SchedulerState::new(SchedulingConfig::default());
        let w1 = state.insert_worker(Worker::new("w1", 2, "h1"));
        let w2 = state.insert_worker(Worker::new("w2", 2, "h2"));

        let dep = state.get_or_create_task("dep");
        state.tasks.get_mut(dep).unwrap().who_has.insert(w1);
        state.tasks.get_mut(dep).unwrap().nbytes = 100;

        let task = state.get_or_create_task("t");
        state.tasks.get_mut(task).unwrap().dependencies.insert(dep);

        assert_eq!(decide_worker(&mut state, task), Some(w1));
        let _ = w2;
    }
}
