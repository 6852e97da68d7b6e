// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Work-stealing extension (§4.5).
//!
//! Queued (processing-but-not-yet-started-in-earnest) tasks on a saturated worker
//! are candidates to migrate to an idle one. A steal is only proposed, never
//! applied outright: the victim must confirm before the task's bookkeeping moves,
//! mirroring the real RPC round-trip this synchronous core does not itself make.

use crate::key::{TaskKey, WorkerKey};
use crate::occupancy;
use crate::placement;
use crate::store::SchedulerState;
use crate::task::TaskState;
use std::collections::HashMap;

/// A proposed migration of `task` from `victim` to `thief`, pending confirmation.
#[derive(Debug, Clone)]
pub struct StealAttempt {
    pub sequence: u64,
    pub task: TaskKey,
    pub victim: WorkerKey,
    pub thief: WorkerKey,
}

/// Tracks in-flight steal attempts so a task is never proposed twice concurrently.
#[derive(Debug, Default)]
pub struct StealingState {
    next_sequence: u64,
    in_flight: HashMap<TaskKey, StealAttempt>,
}

impl StealingState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_in_flight(&self, task: TaskKey) -> bool {
        self.in_flight.contains_key(&task)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Buckets a duration estimate into a latency level: a power-of-two bucket over
/// expected duration, used to group tasks of comparable cost for stealing (§4.5).
#[must_use]
pub fn latency_level(duration_secs: f64) -> i32 {
    if duration_secs <= 0.0 {
        return i32::MIN;
    }
    duration_secs.log2().floor() as i32
}

/// One pass of the stealing tick (§4.5): for every saturated worker, bucket its
/// queued tasks by `latency_level` and try to migrate the costliest one (ties
/// broken by raw duration) to whichever idle worker can run it fastest, provided
/// that's strictly cheaper than the queued wait it would otherwise incur on the
/// victim.
pub fn propose_steals(state: &SchedulerState, stealing: &mut StealingState) -> Vec<StealAttempt> {
    let mut proposals = Vec::new();

    let idle: Vec<WorkerKey> = state.idle.iter().copied().collect();
    if idle.is_empty() {
        return proposals;
    }

    let mut saturated: Vec<WorkerKey> = state.saturated.iter().copied().collect();
    saturated.sort_by(|a, b| {
        queued_wait_secs(state, *b)
            .partial_cmp(&queued_wait_secs(state, *a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for victim in saturated {
        let queued_wait = queued_wait_secs(state, victim);
        if queued_wait <= 0.0 {
            continue;
        }

        let mut candidates: Vec<(TaskKey, f64)> = state.workers[victim]
            .processing
            .iter()
            .filter(|(task, _)| !stealing.in_flight.contains_key(task))
            .filter(|(task, _)| state.tasks[**task].state == TaskState::Processing)
            .map(|(task, duration)| (*task, *duration))
            .collect();
        candidates.sort_by(|a, b| {
            latency_level(b.1)
                .cmp(&latency_level(a.1))
                .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });

        for (task, _duration) in candidates {
            let Some(thief) = best_thief(state, task, victim, &idle) else {
                continue;
            };
            let migration_cost = placement::start_time_estimate(state, task, thief);
            if migration_cost < queued_wait {
                let sequence = stealing.next_sequence;
                stealing.next_sequence += 1;
                let attempt = StealAttempt {
                    sequence,
                    task,
                    victim,
                    thief,
                };
                stealing.in_flight.insert(task, attempt.clone());
                proposals.push(attempt);
            }
        }
    }

    proposals
}

fn queued_wait_secs(state: &SchedulerState, worker: WorkerKey) -> f64 {
    let w = &state.workers[worker];
    let nc = w.ncores.max(1) as f64;
    let p = w.processing.len() as f64;
    if p <= nc {
        return 0.0;
    }
    w.occupancy * (p - nc) / (p * nc)
}

fn best_thief(state: &SchedulerState, task: TaskKey, victim: WorkerKey, idle: &[WorkerKey]) -> Option<WorkerKey> {
    let valid = placement::valid_workers(state, task)?;
    idle.iter()
        .copied()
        .filter(|w| *w != victim && valid.contains(w))
        .min_by(|a, b| {
            placement::start_time_estimate(state, task, *a)
                .partial_cmp(&placement::start_time_estimate(state, task, *b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// The victim's verdict on a proposed steal (§4.5). On acceptance, the task's
/// occupancy bookkeeping moves to `thief`. On rejection, the in-flight record is
/// simply dropped — the task stays exactly where it was.
pub fn resolve_steal(state: &mut SchedulerState, stealing: &mut StealingState, task: TaskKey, accepted: bool) {
    let Some(attempt) = stealing.in_flight.remove(&task) else {
        return;
    };
    if !accepted {
        return;
    }
    if state.tasks.get(task).map(|t| t.state) != Some(TaskState::Processing) {
        return;
    }
    if state.tasks[task].processing_on != Some(attempt.victim) {
        return;
    }

    let duration = state
        .workers
        .get_mut(attempt.victim)
        .and_then(|w| w.processing.remove(&task))
        .unwrap_or(0.0);
    if let Some(victim) = state.workers.get_mut(attempt.victim) {
        victim.occupancy -= duration;
    }
    state.total_occupancy -= duration;

    if let Some(thief) = state.workers.get_mut(attempt.thief) {
        thief.processing.insert(task, duration);
        thief.occupancy += duration;
    }
    state.total_occupancy += duration;
    if let Some(task) = state.tasks.get_mut(task) {
        task.processing_on = Some(attempt.thief);
    }

    occupancy::check_idle_saturated(state, attempt.victim);
    occupancy::check_idle_saturated(state, attempt.thief);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use scheduler_config::SchedulingConfig;

    #[test]
    fn proposes_and_applies_a_steal_from_saturated_to_idle() {
        let mut state = SchedulerState::new(SchedulingConfig::default());
        let victim = state.insert_worker(Worker::new("victim", 1, "h1"));
        let thief = state.insert_worker(Worker::new("thief", 1, "h2"));

        for i in 0..3 {
            let task = state.get_or_create_task(&format!("t{i}"));
            state.tasks.get_mut(task).unwrap().state = TaskState::Processing;
            state.tasks.get_mut(task).unwrap().processing_on = Some(victim);
            state.workers.get_mut(victim).unwrap().processing.insert(task, 10.0);
            state.workers.get_mut(victim).unwrap().occupancy += 10.0;
            state.total_occupancy += 10.0;
        }
        occupancy::check_idle_saturated(&mut state, victim);
        occupancy::check_idle_saturated(&mut state, thief);
        assert!(state.saturated.contains(&victim));
        assert!(state.idle.contains(&thief));

        let mut stealing = StealingState::new();
        let proposals = propose_steals(&state, &mut stealing);
        assert!(!proposals.is_empty());

        let attempt = proposals[0].clone();
        resolve_steal(&mut state, &mut stealing, attempt.task, true);
        assert_eq!(state.tasks[attempt.task].processing_on, Some(thief));
        assert!(state.workers[thief].processing.contains_key(&attempt.task));
        assert!(!state.workers[victim].processing.contains_key(&attempt.task));
    }

    #[test]
    fn rejected_steal_leaves_task_in_place() {
        let mut state = SchedulerState::new(SchedulingConfig::default());
        let victim = state.insert_worker(Worker::new("victim", 1, "h1"));
        let _thief = state.insert_worker(Worker::new("thief", 1, "h2"));
        let task = state.get_or_create_task("t0");
        state.tasks.get_mut(task).unwrap().state = TaskState::Processing;
        state.tasks.get_mut(task).unwrap().processing_on = Some(victim);
        state.workers.get_mut(victim).unwrap().processing.insert(task, 10.0);

        let mut stealing = StealingState::new();
        stealing.in_flight.insert(
            task,
            StealAttempt {
                sequence: 0,
                task,
                victim,
                thief: _thief,
            },
        );
        resolve_steal(&mut state, &mut stealing, task, false);
        assert_eq!(state.tasks[task].processing_on, Some(victim));
        assert!(!stealing.is_in_flight(task));
    }
}
