// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Stimulus handlers (§4.3).
//!
//! Each handler is a pure function over `SchedulerState`: it never performs I/O
//! itself, only mutates state and produces `Recommendation`s that `transitions`
//! drains to a fixed point, returning the accumulated `Effects` for the caller to
//! enact (§5).

use crate::effects::{Effect, Effects};
use crate::key::{ClientKey, TaskKey, WorkerKey};
use crate::occupancy;
use crate::placement;
use crate::store::{SchedulerState, TransitionRecord};
use crate::task::{Priority, TaskState};
use crate::transition::{transitions, Recommendation, TransitionArgs};
use crate::worker::Worker;
use std::collections::{HashMap, HashSet};

/// One node of a graph submitted via `update_graph`.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub key: String,
    pub run_spec: Option<Vec<u8>>,
    pub dependencies: Vec<String>,
    pub host_restrictions: HashSet<String>,
    pub worker_restrictions: HashSet<String>,
    pub loose_restrictions: bool,
    pub resource_restrictions: HashMap<String, f64>,
    pub retries: u32,
    /// Explicit order within the graph's generation; `None` uses submission index.
    pub priority_order: Option<f64>,
}

impl NewTask {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            run_spec: None,
            dependencies: Vec::new(),
            host_restrictions: HashSet::new(),
            worker_restrictions: HashSet::new(),
            loose_restrictions: false,
            resource_restrictions: HashMap::new(),
            retries: 0,
            priority_order: None,
        }
    }
}

/// A worker registers, optionally already holding results from a prior session.
pub fn add_worker(
    state: &mut SchedulerState,
    address: impl Into<String>,
    ncores: usize,
    host: impl Into<String>,
    services: HashMap<String, String>,
    resources: HashMap<String, f64>,
    nbytes_known: Vec<(String, i64)>,
) -> Effects {
    let address = address.into();
    let worker_key = match state.worker_key(&address) {
        Some(existing) => existing,
        None => {
            let mut worker = Worker::new(address, ncores, host);
            worker.services = services;
            worker.resources = resources;
            state.insert_worker(worker)
        }
    };
    occupancy::check_idle_saturated(state, worker_key);

    let mut recs = Vec::new();
    for (key, nbytes) in nbytes_known {
        let task_key = state.get_or_create_task(&key);
        if state.tasks[task_key].state == TaskState::Memory {
            if let Some(task) = state.tasks.get_mut(task_key) {
                task.who_has.insert(worker_key);
            }
            if let Some(worker) = state.workers.get_mut(worker_key) {
                worker.has_what.insert(task_key);
            }
        } else {
            attach_known_result(state, task_key, worker_key, nbytes, &mut recs);
        }
    }

    let unrunnable: Vec<TaskKey> = state.unrunnable.iter().copied().collect();
    for task_key in unrunnable {
        let has_valid_worker = placement::valid_workers(state, task_key)
            .map(|workers| !workers.is_empty())
            .unwrap_or(false);
        if has_valid_worker {
            recs.push(Recommendation::new(task_key, TaskState::Waiting));
        }
    }

    transitions(state, recs)
}

/// Attaches a result a worker already holds (e.g. reported at registration) to a
/// task that isn't yet in memory, mirroring `processing_to_memory`'s dependent
/// bookkeeping without requiring the task to have gone through `processing` here.
fn attach_known_result(
    state: &mut SchedulerState,
    task_key: TaskKey,
    worker_key: WorkerKey,
    nbytes: i64,
    recs: &mut Vec<Recommendation>,
) {
    let from = state.tasks[task_key].state;
    let Some(task) = state.tasks.get_mut(task_key) else {
        return;
    };
    task.state = TaskState::Memory;
    task.who_has.insert(worker_key);
    task.nbytes = nbytes;
    if let Some(worker) = state.workers.get_mut(worker_key) {
        worker.has_what.insert(task_key);
        if nbytes > 0 {
            worker.nbytes += nbytes as u64;
        }
    }

    let key_str = state.tasks[task_key].key.clone();
    state.record_transition(TransitionRecord {
        key: key_str,
        from,
        to: TaskState::Memory,
        recommendations: Vec::new(),
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    });

    let waiters: Vec<TaskKey> = state.tasks[task_key].waiters.iter().copied().collect();
    for dependent in waiters {
        if let Some(dep_task) = state.tasks.get_mut(dependent) {
            dep_task.waiting_on.remove(&task_key);
            if dep_task.waiting_on.is_empty() && dep_task.state == TaskState::Waiting {
                recs.push(Recommendation::new(dependent, TaskState::Processing));
            }
        }
    }
    if let Some(task) = state.tasks.get_mut(task_key) {
        task.waiters.clear();
    }
}

/// A worker disconnects or fails its heartbeat (§3 lifecycle, §4.3, §4.8).
pub fn remove_worker(state: &mut SchedulerState, address: &str, safe: bool) -> Effects {
    let Some(worker_key) = state.worker_key(address) else {
        return Effects::new();
    };

    let processing: Vec<TaskKey> = state.workers[worker_key].processing.keys().copied().collect();
    let has_what: Vec<TaskKey> = state.workers[worker_key].has_what.iter().copied().collect();

    let mut recs = Vec::new();
    for task_key in processing {
        if !state.tasks.contains_key(task_key) {
            continue;
        }
        if !safe {
            if let Some(task) = state.tasks.get_mut(task_key) {
                task.suspicious += 1;
            }
        }
        let suspicious = state.tasks[task_key].suspicious;
        if suspicious > state.config.allowed_failures {
            let key_str = state.tasks[task_key].key.clone();
            let exception = format!("KilledWorker({key_str}, {address})").into_bytes();
            recs.push(Recommendation::with_args(
                task_key,
                TaskState::Erred,
                TransitionArgs::Erred {
                    worker: worker_key,
                    exception,
                    traceback: Vec::new(),
                },
            ));
        } else {
            recs.push(Recommendation::new(task_key, TaskState::Released));
        }
    }

    for task_key in has_what {
        if !state.tasks.contains_key(task_key) {
            continue;
        }
        let Some((empty, has_run_spec)) = state.tasks.get_mut(task_key).map(|task| {
            task.who_has.remove(&worker_key);
            (task.who_has.is_empty(), task.run_spec.is_some())
        }) else {
            continue;
        };
        if empty {
            if has_run_spec {
                recs.push(Recommendation::new(task_key, TaskState::Released));
            } else {
                recs.push(Recommendation::new(task_key, TaskState::Forgotten));
            }
        }
    }

    state.remove_worker(worker_key);
    transitions(state, recs)
}

/// Priority offset between a task spawned from within an already-running task
/// and the task it was spawned from (§4.3, `Priority::child_of`). Multiplied by
/// a task's index within the batch so siblings stay strictly ordered.
const CHILD_PRIORITY_EPSILON: f64 = 1e-6;

/// A client submits (part of) a computation graph (§4.3). `submitted_by`, if
/// given, names an already-running task this graph was submitted on behalf of
/// (a worker task calling back into the client); new tasks then inherit
/// priority just ahead of that task instead of starting a fresh generation.
pub fn update_graph(
    state: &mut SchedulerState,
    client_id: &str,
    tasks: Vec<NewTask>,
    root_keys: Vec<String>,
    submitted_by: Option<&str>,
) -> Effects {
    let parent_priority = submitted_by
        .and_then(|key| state.task_key(key))
        .and_then(|task_key| state.tasks.get(task_key))
        .map(|task| task.priority);

    let generation = match parent_priority {
        Some(parent) => parent.generation,
        None => {
            state.generation += 1;
            state.generation
        }
    };

    for (index, spec) in tasks.iter().enumerate() {
        let task_key = state.get_or_create_task(&spec.key);
        let priority = match (spec.priority_order, parent_priority) {
            (Some(order), _) => Priority::new(generation, order),
            (None, Some(parent)) => Priority::child_of(parent, (index + 1) as f64 * CHILD_PRIORITY_EPSILON),
            (None, None) => Priority::new(generation, index as f64),
        };
        let Some(task) = state.tasks.get_mut(task_key) else {
            continue;
        };
        task.run_spec = spec.run_spec.clone();
        task.priority = priority;
        task.host_restrictions = spec.host_restrictions.clone();
        task.worker_restrictions = spec.worker_restrictions.clone();
        task.loose_restrictions = spec.loose_restrictions;
        task.resource_restrictions = spec.resource_restrictions.clone();
        task.retries = spec.retries;
    }

    for spec in &tasks {
        let Some(task_key) = state.task_key(&spec.key) else {
            continue;
        };
        for dep_key_str in &spec.dependencies {
            let dep_key = state.get_or_create_task(dep_key_str);
            if let Some(task) = state.tasks.get_mut(task_key) {
                task.dependencies.insert(dep_key);
            }
            if let Some(dep_task) = state.tasks.get_mut(dep_key) {
                dep_task.dependents.insert(task_key);
            }
        }
    }

    let client_key = state.client_key(client_id).unwrap_or_else(|| state.insert_client(client_id));
    let mut recs = Vec::new();
    for root in &root_keys {
        let task_key = state.get_or_create_task(root);
        if let Some(client) = state.clients.get_mut(client_key) {
            client.wants_what.insert(task_key);
        }
        let Some(task) = state.tasks.get_mut(task_key) else {
            continue;
        };
        task.who_wants.insert(client_key);
        if task.state == TaskState::Released {
            recs.push(Recommendation::new(task_key, TaskState::Waiting));
        }
    }

    transitions(state, recs)
}

/// A worker reports a task finished (§4.3).
pub fn task_finished(state: &mut SchedulerState, key: &str, worker_address: &str, nbytes: i64) -> Effects {
    let Some(task_key) = state.task_key(key) else {
        return Effects::new();
    };
    let Some(worker_key) = state.worker_key(worker_address) else {
        return Effects::new();
    };

    if state.tasks[task_key].state == TaskState::Processing {
        transitions(
            state,
            vec![Recommendation::with_args(
                task_key,
                TaskState::Memory,
                TransitionArgs::Finished { worker: worker_key, nbytes },
            )],
        )
    } else if !state.tasks[task_key].who_has.contains(&worker_key) {
        let mut effects = Effects::new();
        effects.push(Effect::ReleaseTask {
            worker: worker_address.to_string(),
            key: key.to_string(),
        });
        effects
    } else {
        Effects::new()
    }
}

/// A worker reports a task raised an exception (§4.3).
pub fn task_erred(
    state: &mut SchedulerState,
    key: &str,
    worker_address: &str,
    exception: Vec<u8>,
    traceback: Vec<u8>,
) -> Effects {
    let Some(task_key) = state.task_key(key) else {
        return Effects::new();
    };
    let Some(worker_key) = state.worker_key(worker_address) else {
        return Effects::new();
    };

    if state.tasks[task_key].retries > 0 {
        if let Some(task) = state.tasks.get_mut(task_key) {
            task.retries -= 1;
        }
        transitions(state, vec![Recommendation::new(task_key, TaskState::Released)])
    } else {
        transitions(
            state,
            vec![Recommendation::with_args(
                task_key,
                TaskState::Erred,
                TransitionArgs::Erred {
                    worker: worker_key,
                    exception,
                    traceback,
                },
            )],
        )
    }
}

/// A worker reports it could not find a dependency's data on the peer it expected
/// (§4.3, §9 open question). Follows the conservative variant: every holder of
/// `cause_key` is dropped, not only the reporting worker, because a worker that
/// reported missing data cannot distinguish "that one replica rotted" from "the
/// whole result is gone" without asking every other holder, which is another RPC
/// round this handler does not have.
pub fn missing_data(state: &mut SchedulerState, cause_key: &str, errant_worker_address: &str) -> Effects {
    let _ = errant_worker_address;
    let Some(task_key) = state.task_key(cause_key) else {
        return Effects::new();
    };

    let mut effects = Effects::new();
    let holders: Vec<WorkerKey> = state.tasks[task_key].who_has.iter().copied().collect();
    let key_str = state.tasks[task_key].key.clone();
    for holder in holders {
        if let Some(worker) = state.workers.get_mut(holder) {
            worker.has_what.remove(&task_key);
            effects.push(Effect::DeleteData {
                worker: worker.address.clone(),
                keys: vec![key_str.clone()],
            });
        }
    }

    let follow_up = force_recompute_or_forget(state, task_key);
    effects.extend(transitions(state, follow_up));
    effects
}

/// A task has seceded from its worker's thread pool via a long-running marker
/// (§4.3, §4.4): it no longer counts against the worker's occupancy or the
/// stealable set, and its observed duration still feeds the prefix's EWMA.
pub fn long_running(state: &mut SchedulerState, key: &str, compute_duration_secs: f64) -> Effects {
    let Some(task_key) = state.task_key(key) else {
        return Effects::new();
    };

    let prefix = state.tasks[task_key].prefix.clone();
    state.observe_duration(&prefix, compute_duration_secs);

    if let Some(worker_key) = state.tasks[task_key].processing_on {
        let mut removed = 0.0;
        if let Some(worker) = state.workers.get_mut(worker_key) {
            if let Some(duration) = worker.processing.get_mut(&task_key) {
                removed = *duration;
                *duration = 0.0;
            }
        }
        if removed > 0.0 {
            if let Some(worker) = state.workers.get_mut(worker_key) {
                worker.occupancy -= removed;
            }
            state.total_occupancy -= removed;
        }
        occupancy::check_idle_saturated(state, worker_key);
    }

    Effects::new()
}

/// A worker proactively evicts keys from its memory, e.g. under local memory
/// pressure (§4.3).
pub fn release_worker_data(state: &mut SchedulerState, keys: &[String], worker_address: &str) -> Effects {
    let Some(worker_key) = state.worker_key(worker_address) else {
        return Effects::new();
    };

    let mut follow_up = Vec::new();
    for key in keys {
        let Some(task_key) = state.task_key(key) else {
            continue;
        };
        if let Some(task) = state.tasks.get_mut(task_key) {
            task.who_has.remove(&worker_key);
        }
        if let Some(worker) = state.workers.get_mut(worker_key) {
            worker.has_what.remove(&task_key);
        }
        if state.tasks[task_key].who_has.is_empty() {
            follow_up.extend(force_recompute_or_forget(state, task_key));
        }
    }

    transitions(state, follow_up)
}

/// Forces a task with no remaining holders back to released (or straight to
/// forgotten if it has no `run_spec` to recompute from), regardless of whether it
/// is still wanted. Used by `missing_data` and `release_worker_data`: both react to
/// data that is already gone, so the ordinary `memory -> released` edge's "nobody
/// wants it" precondition does not apply — leaving the task in `memory` with an
/// empty `who_has` would violate invariant 2 (§3).
fn force_recompute_or_forget(state: &mut SchedulerState, task_key: TaskKey) -> Vec<Recommendation> {
    let from = state.tasks[task_key].state;
    let key_str = state.tasks[task_key].key.clone();
    let has_run_spec = state.tasks[task_key].run_spec.is_some();
    let to = if has_run_spec {
        TaskState::Released
    } else {
        TaskState::Forgotten
    };

    if let Some(task) = state.tasks.get_mut(task_key) {
        task.who_has.clear();
        task.nbytes = -1;
        task.state = to;
    }
    state.record_transition(TransitionRecord {
        key: key_str,
        from,
        to,
        recommendations: Vec::new(),
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    });

    if has_run_spec {
        vec![Recommendation::new(task_key, TaskState::Waiting)]
    } else {
        vec![Recommendation::new(task_key, TaskState::Forgotten)]
    }
}

/// A client asks to cancel keys it (or, with `force`, anyone) desires (§4.3, §8 P6).
pub fn cancel(state: &mut SchedulerState, keys: &[String], client_id: &str, force: bool) -> Effects {
    let Some(client_key) = state.client_key(client_id) else {
        return Effects::new();
    };

    let mut recs = Vec::new();
    let mut effects = Effects::new();
    for key in keys {
        if let Some(task_key) = state.task_key(key) {
            cancel_one(state, task_key, client_key, force, &mut recs, &mut effects);
        }
    }
    effects.extend(transitions(state, recs));
    effects
}

/// Removes `client_key`'s interest in `task_key` (and, recursively, its
/// dependents), notifying every client whose want is dropped along the way with
/// `Effect::CancelledKey` (§4.3, §6 `CancelledKey`).
fn cancel_one(
    state: &mut SchedulerState,
    task_key: TaskKey,
    client_key: ClientKey,
    force: bool,
    recs: &mut Vec<Recommendation>,
    effects: &mut Effects,
) {
    if !state.tasks.contains_key(task_key) {
        return;
    }
    let key_str = state.tasks[task_key].key.clone();

    let removed = state
        .tasks
        .get_mut(task_key)
        .map(|task| task.who_wants.remove(&client_key))
        .unwrap_or(false);
    if let Some(client) = state.clients.get_mut(client_key) {
        client.wants_what.remove(&task_key);
    }
    if removed {
        if let Some(client) = state.clients.get(client_key) {
            effects.push(Effect::CancelledKey {
                client: client.id.clone(),
                key: key_str.clone(),
            });
        }
    }

    let proceed = force || state.tasks[task_key].who_wants.is_empty();
    if !proceed {
        return;
    }

    if force {
        let other_wanters: Vec<ClientKey> = state.tasks[task_key].who_wants.iter().copied().collect();
        for other in other_wanters {
            if let Some(task) = state.tasks.get_mut(task_key) {
                task.who_wants.remove(&other);
            }
            if let Some(client) = state.clients.get_mut(other) {
                client.wants_what.remove(&task_key);
                effects.push(Effect::CancelledKey {
                    client: client.id.clone(),
                    key: key_str.clone(),
                });
            }
        }
    }

    let dependents: Vec<TaskKey> = state.tasks[task_key].dependents.iter().copied().collect();
    for dependent in dependents {
        cancel_one(state, dependent, client_key, force, recs, effects);
    }

    if state.tasks.contains_key(task_key) && !state.tasks[task_key].is_wanted() {
        match state.tasks[task_key].state {
            TaskState::Memory | TaskState::Processing => {
                recs.push(Recommendation::new(task_key, TaskState::Released));
            }
            TaskState::Waiting | TaskState::NoWorker | TaskState::Released => {
                recs.push(Recommendation::new(task_key, TaskState::Forgotten));
            }
            TaskState::Erred | TaskState::Forgotten => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_config::SchedulingConfig;

    fn fresh_state() -> SchedulerState {
        SchedulerState::new(SchedulingConfig::default())
    }

    #[test]
    fn update_graph_then_task_finished_delivers_key_in_memory() {
        let mut state = fresh_state();
        let w = add_worker(&mut state, "w1", 2, "h1", HashMap::new(), HashMap::new(), Vec::new());

        let mut a = NewTask::new("a");
        a.run_spec = Some(vec![1]);
        let effects = update_graph(&mut state, "client-1", vec![a], vec!["a".to_string()], None);
        assert!(matches!(effects.0[0], Effect::ComputeTask { .. }));

        let worker_key = state.worker_key("w1").unwrap();
        let _ = worker_key;
        let effects = task_finished(&mut state, "a", "w1", 10);
        assert!(matches!(effects.0[0], Effect::KeyInMemory { .. }));
        let _ = w;
    }

    #[test]
    fn repeated_worker_loss_poisons_task_and_notifies_client() {
        let mut config = SchedulingConfig::default();
        config.allowed_failures = 1;
        let mut state = SchedulerState::new(config);

        let client = state.insert_client("c1");
        let task = state.get_or_create_task("t");
        state.tasks.get_mut(task).unwrap().run_spec = Some(vec![1]);
        state.tasks.get_mut(task).unwrap().who_wants.insert(client);
        state.clients.get_mut(client).unwrap().wants_what.insert(task);

        add_worker(&mut state, "w1", 1, "h1", HashMap::new(), HashMap::new(), Vec::new());
        transitions(&mut state, vec![Recommendation::new(task, TaskState::Waiting)]);
        assert_eq!(state.tasks[task].state, TaskState::Processing);

        remove_worker(&mut state, "w1", false);
        assert_eq!(state.tasks[task].suspicious, 1);
        assert_eq!(state.tasks[task].state, TaskState::NoWorker);

        add_worker(&mut state, "w2", 1, "h2", HashMap::new(), HashMap::new(), Vec::new());
        assert_eq!(state.tasks[task].state, TaskState::Processing);

        let effects = remove_worker(&mut state, "w2", false);
        assert_eq!(state.tasks[task].suspicious, 2);
        assert_eq!(state.tasks[task].state, TaskState::Erred);
        assert!(effects.0.iter().any(|e| matches!(e, Effect::TaskErred { .. })));
    }

    #[test]
    fn cancel_cascades_to_unwanted_dependents() {
        let mut state = fresh_state();
        state.insert_worker(Worker::new("w1", 2, "h1"));

        let mut a = NewTask::new("a");
        a.run_spec = Some(vec![1]);
        let mut b = NewTask::new("b");
        b.run_spec = Some(vec![1]);
        b.dependencies = vec!["a".to_string()];
        update_graph(&mut state, "c1", vec![a, b], vec!["b".to_string()], None);

        let a_key = state.task_key("a").unwrap();
        let b_key = state.task_key("b").unwrap();
        assert_eq!(state.tasks[a_key].state, TaskState::Processing);
        assert_eq!(state.tasks[b_key].state, TaskState::Waiting);

        cancel(&mut state, &["b".to_string()], "c1", false);
        assert!(!state.tasks.contains_key(b_key));
        assert!(!state.tasks.contains_key(a_key));
    }

    #[test]
    fn cancel_notifies_every_client_whose_want_is_dropped() {
        let mut state = fresh_state();
        state.insert_worker(Worker::new("w1", 2, "h1"));

        let mut a = NewTask::new("a");
        a.run_spec = Some(vec![1]);
        update_graph(&mut state, "c1", vec![a], vec!["a".to_string()], None);

        // c2 also wants "a"; a forced cancel by c1 should evict c2 too.
        let a_key = state.task_key("a").unwrap();
        let c2 = state.insert_client("c2");
        if let Some(task) = state.tasks.get_mut(a_key) {
            task.who_wants.insert(c2);
        }
        if let Some(client) = state.clients.get_mut(c2) {
            client.wants_what.insert(a_key);
        }

        let effects = cancel(&mut state, &["a".to_string()], "c1", true);
        let cancelled: Vec<(&str, &str)> = effects
            .0
            .iter()
            .filter_map(|e| match e {
                Effect::CancelledKey { client, key } => Some((client.as_str(), key.as_str())),
                _ => None,
            })
            .collect();
        assert!(cancelled.contains(&("c1", "a")));
        assert!(cancelled.contains(&("c2", "a")));
        assert!(!state.tasks.contains_key(a_key));
    }
}
