// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The transition engine (§4.1).
//!
//! `transition` applies a single edge of the task state graph and returns the
//! follow-up recommendations it produces. `transitions` drains an initial set of
//! recommendations to a fixed point using a LIFO work stack, so that from the
//! outside a whole cascade (e.g. one `task_finished` unlocking a chain of
//! dependents) appears as a single atomic step (§5).

use crate::effects::{Effect, Effects};
use crate::error::Error;
use crate::key::{TaskKey, WorkerKey};
use crate::occupancy;
use crate::placement;
use crate::store::{SchedulerState, TransitionRecord};
use crate::task::TaskState;
use tracing::{debug, warn};

/// Extra data an edge needs beyond the target state, carried by a `Recommendation`.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionArgs {
    None,
    /// `processing -> memory`: the worker that finished the task and its result size.
    Finished { worker: WorkerKey, nbytes: i64 },
    /// `processing -> erred`: the worker that reported the failure and its payload.
    Erred {
        worker: WorkerKey,
        exception: Vec<u8>,
        traceback: Vec<u8>,
    },
}

/// A pending transition: apply `target` to `task`, started by whatever produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub task: TaskKey,
    pub target: TaskState,
    pub args: TransitionArgs,
}

impl Recommendation {
    #[must_use]
    pub fn new(task: TaskKey, target: TaskState) -> Self {
        Self {
            task,
            target,
            args: TransitionArgs::None,
        }
    }

    #[must_use]
    pub fn with_args(task: TaskKey, target: TaskState, args: TransitionArgs) -> Self {
        Self { task, target, args }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Drains `initial` to a fixed point, applying each transition that still advances
/// its task's state, and collecting every outbound effect produced along the way
/// (§4.1, §5).
///
/// Recommendations are resolved against the task's *current* recorded state, not
/// the state the recommendation was computed against: by the time a stale entry
/// reaches the front of the stack, `transition` either still finds a legal edge
/// from wherever the task has since moved to (and applies it), or finds none and
/// drops it (logged). This is what makes duplicate or backward-looking
/// recommendations for the same key collapse correctly — including legitimate
/// backward edges like `processing -> released` — without a separate rank check
/// that would reject those edges outright.
pub fn transitions(state: &mut SchedulerState, initial: Vec<Recommendation>) -> Effects {
    let mut effects = Effects::new();
    let mut stack = initial;

    while let Some(rec) = stack.pop() {
        if !state.tasks.contains_key(rec.task) {
            // Forgotten mid-closure (e.g. a dependent of a task just erased); stale.
            continue;
        }
        if rec.target == state.tasks[rec.task].state {
            continue;
        }

        match transition(state, rec.task, rec.target, rec.args) {
            Ok((follow_ups, step_effects)) => {
                effects.extend(step_effects);
                stack.extend(follow_ups);
            }
            Err(err) => {
                warn!(error = %err, "transition rejected");
            }
        }
    }

    effects
}

/// Applies one edge, recording it to the transition log and returning both the
/// recommendations and the outbound effects it produced.
pub fn transition(
    state: &mut SchedulerState,
    task_key: TaskKey,
    target: TaskState,
    args: TransitionArgs,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    let from = state.tasks[task_key].state;
    let key_str = state.tasks[task_key].key.clone();

    let (recs, effects) = match (from, target) {
        (TaskState::Released, TaskState::Waiting) => released_to_waiting(state, task_key)?,
        (TaskState::Erred, TaskState::Waiting) => erred_to_waiting(state, task_key)?,
        (TaskState::NoWorker, TaskState::Waiting) => no_worker_to_waiting(state, task_key)?,
        (TaskState::Waiting, TaskState::Processing) => waiting_to_processing(state, task_key)?,
        (TaskState::Waiting, TaskState::NoWorker) => waiting_to_no_worker(state, task_key)?,
        (TaskState::Processing, TaskState::Memory) => {
            processing_to_memory(state, task_key, args)?
        }
        (TaskState::Processing, TaskState::Released) => {
            processing_to_released(state, task_key)?
        }
        (TaskState::Processing, TaskState::Erred) => processing_to_erred(state, task_key, args)?,
        (TaskState::Memory, TaskState::Released) => memory_to_released(state, task_key)?,
        (_, TaskState::Forgotten) => (to_forgotten(state, task_key)?, Effects::new()),
        _ => {
            return Err(Error::IllegalTransition {
                key: key_str,
                from,
                to: target,
            });
        }
    };

    let new_state = state.tasks[task_key].state;
    state.record_transition(TransitionRecord {
        key: key_str,
        from,
        to: new_state,
        recommendations: recs
            .iter()
            .map(|r| (state.tasks[r.task].key.clone(), r.target))
            .collect(),
        timestamp_ms: now_ms(),
    });

    Ok((recs, effects))
}

fn released_to_waiting(
    state: &mut SchedulerState,
    task_key: TaskKey,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    if state.tasks[task_key].run_spec.is_none() {
        debug!(key = %state.tasks[task_key].key, "released->waiting skipped: no run_spec");
        return Ok((Vec::new(), Effects::new()));
    }

    let deps: Vec<TaskKey> = state.tasks[task_key].dependencies.iter().copied().collect();
    let mut waiting_on = std::collections::HashSet::new();
    for dep in &deps {
        let Some(dep_task) = state.tasks.get_mut(*dep) else {
            continue;
        };
        if dep_task.state != TaskState::Memory {
            waiting_on.insert(*dep);
            dep_task.waiters.insert(task_key);
        }
    }

    let runnable = waiting_on.is_empty();
    {
        let task = state.task_mut(task_key)?;
        task.waiting_on = waiting_on;
        task.state = TaskState::Waiting;
    }

    let recs = if runnable {
        vec![Recommendation::new(task_key, TaskState::Processing)]
    } else {
        Vec::new()
    };
    Ok((recs, Effects::new()))
}

fn erred_to_waiting(
    state: &mut SchedulerState,
    task_key: TaskKey,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    {
        let task = state.task_mut(task_key)?;
        task.exception_blame = None;
        task.exception = None;
        task.traceback = None;
        task.state = TaskState::Released;
    }
    released_to_waiting(state, task_key)
}

fn no_worker_to_waiting(
    state: &mut SchedulerState,
    task_key: TaskKey,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    state.unrunnable.remove(&task_key);
    state.task_mut(task_key)?.state = TaskState::Waiting;
    Ok((
        vec![Recommendation::new(task_key, TaskState::Processing)],
        Effects::new(),
    ))
}

fn waiting_to_processing(
    state: &mut SchedulerState,
    task_key: TaskKey,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    if !state.tasks[task_key].waiting_on.is_empty() {
        // Not actually runnable; stay in waiting.
        return Ok((Vec::new(), Effects::new()));
    }

    let Some(worker_key) = placement::decide_worker(state, task_key) else {
        return waiting_to_no_worker(state, task_key);
    };

    let duration = occupancy::duration_estimate(state, task_key, worker_key);
    let address = state.workers[worker_key].address.clone();
    let task_key_str = state.tasks[task_key].key.clone();

    {
        let task = state.task_mut(task_key)?;
        task.state = TaskState::Processing;
        task.processing_on = Some(worker_key);
    }
    {
        let worker = state.worker_mut(worker_key)?;
        worker.processing.insert(task_key, duration);
        worker.occupancy += duration;
        for (resource, qty) in state.tasks[task_key].resource_restrictions.clone() {
            *worker.used_resources.entry(resource).or_insert(0.0) += qty;
        }
    }
    state.total_occupancy += duration;

    occupancy::check_idle_saturated(state, worker_key);

    let mut effects = Effects::new();
    effects.push(Effect::ComputeTask {
        worker: address,
        key: task_key_str,
        duration_estimate_secs: duration,
    });
    Ok((Vec::new(), effects))
}

fn waiting_to_no_worker(
    state: &mut SchedulerState,
    task_key: TaskKey,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    state.task_mut(task_key)?.state = TaskState::NoWorker;
    state.unrunnable.insert(task_key);
    Ok((Vec::new(), Effects::new()))
}

fn processing_to_memory(
    state: &mut SchedulerState,
    task_key: TaskKey,
    args: TransitionArgs,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    let TransitionArgs::Finished { worker, nbytes } = args else {
        return Err(Error::IllegalTransition {
            key: state.tasks[task_key].key.clone(),
            from: TaskState::Processing,
            to: TaskState::Memory,
        });
    };

    // Capture what was charged at placement time before `vacate_worker_slot` removes
    // it; the core has no wall-clock task start/finish timestamps of its own, so this
    // estimate (duration estimate at dispatch) stands in for the observed runtime fed
    // into the prefix's EWMA (§4.4).
    let prefix = state.tasks[task_key].prefix.clone();
    let charged = state.workers[worker]
        .processing
        .get(&task_key)
        .copied()
        .unwrap_or_else(|| state.mean_duration(&prefix));

    vacate_worker_slot(state, task_key, worker);
    state.observe_duration(&prefix, charged);

    {
        let task = state.task_mut(task_key)?;
        task.state = TaskState::Memory;
        task.processing_on = None;
        task.who_has.insert(worker);
        task.nbytes = nbytes;
    }
    state.worker_mut(worker)?.has_what.insert(task_key);
    if nbytes > 0 {
        state.worker_mut(worker)?.nbytes += nbytes as u64;
    }

    let mut recs = Vec::new();
    let waiters: Vec<TaskKey> = state.tasks[task_key].waiters.iter().copied().collect();
    for dependent in waiters {
        if let Some(dep_task) = state.tasks.get_mut(dependent) {
            dep_task.waiting_on.remove(&task_key);
            if dep_task.waiting_on.is_empty() && dep_task.state == TaskState::Waiting {
                recs.push(Recommendation::new(dependent, TaskState::Processing));
            }
        }
    }
    state.task_mut(task_key)?.waiters.clear();

    let mut effects = Effects::new();
    let key_str = state.tasks[task_key].key.clone();
    for client in &state.tasks[task_key].who_wants {
        effects.push(Effect::KeyInMemory {
            client: state.clients[*client].id.clone(),
            key: key_str.clone(),
        });
    }

    Ok((recs, effects))
}

fn processing_to_released(
    state: &mut SchedulerState,
    task_key: TaskKey,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    if let Some(worker) = state.tasks[task_key].processing_on {
        vacate_worker_slot(state, task_key, worker);
    }
    state.task_mut(task_key)?.state = TaskState::Released;

    // Worker loss / retry: still wanted, so re-enter the state graph to be
    // recomputed. Cancellation: no longer wanted, so proceed straight to forgotten
    // rather than resurrecting it (§3 lifecycle).
    let target = if state.tasks[task_key].is_wanted() {
        TaskState::Waiting
    } else {
        TaskState::Forgotten
    };
    Ok((vec![Recommendation::new(task_key, target)], Effects::new()))
}

fn processing_to_erred(
    state: &mut SchedulerState,
    task_key: TaskKey,
    args: TransitionArgs,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    let TransitionArgs::Erred {
        worker,
        exception,
        traceback,
    } = args
    else {
        return Err(Error::IllegalTransition {
            key: state.tasks[task_key].key.clone(),
            from: TaskState::Processing,
            to: TaskState::Erred,
        });
    };

    vacate_worker_slot(state, task_key, worker);

    {
        let task = state.task_mut(task_key)?;
        task.state = TaskState::Erred;
        task.processing_on = None;
        task.exception = Some(exception.clone());
        task.traceback = Some(traceback.clone());
        task.exception_blame = Some(task_key);
    }

    let mut effects = Effects::new();
    let key_str = state.tasks[task_key].key.clone();
    for client in &state.tasks[task_key].who_wants {
        effects.push(Effect::TaskErred {
            client: state.clients[*client].id.clone(),
            key: key_str.clone(),
            exception: exception.clone(),
            traceback: traceback.clone(),
        });
    }

    propagate_blame(state, task_key, task_key, &mut effects);
    Ok((Vec::new(), effects))
}

/// Recursively propagates `blame` to every live dependent of `task_key` (§4.1, §8 P10).
///
/// This is a side effect of the root's single `processing -> erred` transition
/// (glossary: "Transition... with its side effects on neighbors"), not a chain of
/// independently logged edges, so dependents are mutated directly rather than routed
/// back through `transitions`'s recommendation stack.
fn propagate_blame(state: &mut SchedulerState, task_key: TaskKey, blame: TaskKey, effects: &mut Effects) {
    let dependents: Vec<TaskKey> = state.tasks[task_key].dependents.iter().copied().collect();
    for dependent in dependents {
        let Some(dep_task) = state.tasks.get_mut(dependent) else {
            continue;
        };
        if dep_task.state == TaskState::Erred || dep_task.state == TaskState::Forgotten {
            continue;
        }
        dep_task.exception_blame = Some(blame);
        dep_task.state = TaskState::Erred;
        let key_str = dep_task.key.clone();
        let exception = state.tasks[blame].exception.clone().unwrap_or_default();
        let traceback = state.tasks[blame].traceback.clone().unwrap_or_default();
        for client in state.tasks[dependent].who_wants.clone() {
            effects.push(Effect::TaskErred {
                client: state.clients[client].id.clone(),
                key: key_str.clone(),
                exception: exception.clone(),
                traceback: traceback.clone(),
            });
        }
        propagate_blame(state, dependent, blame, effects);
    }
}

fn memory_to_released(
    state: &mut SchedulerState,
    task_key: TaskKey,
) -> Result<(Vec<Recommendation>, Effects), Error> {
    if state.tasks[task_key].is_wanted() {
        return Ok((Vec::new(), Effects::new()));
    }

    let holders: Vec<WorkerKey> = state.tasks[task_key].who_has.iter().copied().collect();
    let key_str = state.tasks[task_key].key.clone();
    let mut effects = Effects::new();
    for holder in &holders {
        let Some(worker) = state.workers.get_mut(*holder) else {
            continue;
        };
        worker.has_what.remove(&task_key);
        let nbytes = state.tasks[task_key].nbytes.max(0) as u64;
        let worker = state.worker_mut(*holder)?;
        worker.nbytes = worker.nbytes.saturating_sub(nbytes);
        effects.push(Effect::DeleteData {
            worker: worker.address.clone(),
            keys: vec![key_str.clone()],
        });
    }
    {
        let task = state.task_mut(task_key)?;
        task.who_has.clear();
        task.state = TaskState::Released;
        task.nbytes = -1;
    }

    // Reaching here already means `!is_wanted()` (the guard above returned early
    // otherwise), so there is nothing left to recompute it for.
    let recs = vec![Recommendation::new(task_key, TaskState::Forgotten)];
    Ok((recs, effects))
}

fn to_forgotten(state: &mut SchedulerState, task_key: TaskKey) -> Result<Vec<Recommendation>, Error> {
    if state.tasks[task_key].is_wanted() {
        return Ok(Vec::new());
    }

    let deps: Vec<TaskKey> = state.tasks[task_key].dependencies.iter().copied().collect();
    for dep in &deps {
        if let Some(dep_task) = state.tasks.get_mut(*dep) {
            dep_task.dependents.remove(&task_key);
            dep_task.waiters.remove(&task_key);
        }
    }

    for holder in state.tasks[task_key].who_has.clone() {
        if let Some(worker) = state.workers.get_mut(holder) {
            worker.has_what.remove(&task_key);
        }
    }

    state.forget_task(task_key);

    let mut recs = Vec::new();
    for dep in deps {
        if !state.tasks.contains_key(dep) || state.tasks[dep].is_wanted() {
            continue;
        }
        // A dependency that just lost its last dependent may still be running or
        // hold a result; forgetting it outright would leak its worker-side state.
        // Route it through released first, same as an explicit cancel, and let a
        // later `memory/processing -> released -> forgotten` chain finish the job.
        match state.tasks[dep].state {
            TaskState::Processing | TaskState::Memory => {
                recs.push(Recommendation::new(dep, TaskState::Released));
            }
            TaskState::Erred | TaskState::Forgotten => {}
            TaskState::Waiting | TaskState::NoWorker | TaskState::Released => {
                recs.push(Recommendation::new(dep, TaskState::Forgotten));
            }
        }
    }
    Ok(recs)
}

/// Removes `task_key` from `worker`'s `processing` map and un-counts its occupancy
/// contribution, re-evaluating the worker's idle/saturated classification.
fn vacate_worker_slot(state: &mut SchedulerState, task_key: TaskKey, worker: WorkerKey) {
    let Some(worker_mut) = state.workers.get_mut(worker) else {
        return;
    };
    if let Some(duration) = worker_mut.processing.remove(&task_key) {
        worker_mut.occupancy -= duration;
        state.total_occupancy -= duration;
    }
    for (resource, qty) in state.tasks[task_key].resource_restrictions.clone() {
        if let Some(used) = state.workers[worker].used_resources.get(&resource).copied() {
            if let Some(worker_mut) = state.workers.get_mut(worker) {
                worker_mut.used_resources.insert(resource, (used - qty).max(0.0));
            }
        }
    }
    occupancy::check_idle_saturated(state, worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use scheduler_config::SchedulingConfig;

    fn fresh_state() -> SchedulerState {
        SchedulerState::new(SchedulingConfig::default())
    }

    #[test]
    fn linear_chain_runs_to_memory() {
        let mut state = fresh_state();
        let w = state.insert_worker(Worker::new("w1", 2, "h1"));

        let a = state.get_or_create_task("a");
        state.tasks.get_mut(a).unwrap().run_spec = Some(vec![1]);
        let b = state.get_or_create_task("b");
        state.tasks.get_mut(b).unwrap().run_spec = Some(vec![1]);
        state.tasks.get_mut(b).unwrap().dependencies.insert(a);
        state.tasks.get_mut(a).unwrap().dependents.insert(b);

        let client = state.insert_client("c1");
        state.clients.get_mut(client).unwrap().wants_what.insert(b);
        state.tasks.get_mut(b).unwrap().who_wants.insert(client);

        let effects = transitions(&mut state, vec![Recommendation::new(a, TaskState::Waiting)]);
        assert_eq!(state.tasks[a].state, TaskState::Processing);
        assert!(matches!(effects.0[0], Effect::ComputeTask { .. }));

        let effects = transitions(
            &mut state,
            vec![Recommendation::with_args(
                a,
                TaskState::Memory,
                TransitionArgs::Finished { worker: w, nbytes: 10 },
            )],
        );
        assert_eq!(state.tasks[a].state, TaskState::Memory);
        assert_eq!(state.tasks[b].state, TaskState::Processing);
        assert!(effects.0.is_empty());

        let effects = transitions(
            &mut state,
            vec![Recommendation::with_args(
                b,
                TaskState::Memory,
                TransitionArgs::Finished { worker: w, nbytes: 10 },
            )],
        );
        assert_eq!(state.tasks[b].state, TaskState::Memory);
        assert!(matches!(effects.0[0], Effect::KeyInMemory { .. }));
    }

    #[test]
    fn erred_blame_propagates_to_dependents() {
        let mut state = fresh_state();
        let w = state.insert_worker(Worker::new("w1", 2, "h1"));
        let a = state.get_or_create_task("a");
        state.tasks.get_mut(a).unwrap().run_spec = Some(vec![1]);
        let b = state.get_or_create_task("b");
        state.tasks.get_mut(b).unwrap().run_spec = Some(vec![1]);
        state.tasks.get_mut(b).unwrap().dependencies.insert(a);
        state.tasks.get_mut(a).unwrap().dependents.insert(b);

        transitions(&mut state, vec![Recommendation::new(a, TaskState::Waiting)]);
        transitions(
            &mut state,
            vec![Recommendation::with_args(
                a,
                TaskState::Erred,
                TransitionArgs::Erred {
                    worker: w,
                    exception: b"boom".to_vec(),
                    traceback: b"tb".to_vec(),
                },
            )],
        );

        assert_eq!(state.tasks[a].state, TaskState::Erred);
        assert_eq!(state.tasks[b].state, TaskState::Erred);
        assert_eq!(state.tasks[b].exception_blame, Some(a));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut state = fresh_state();
        let a = state.get_or_create_task("a");
        let err = transition(&mut state, a, TaskState::Memory, TransitionArgs::None).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }
}
