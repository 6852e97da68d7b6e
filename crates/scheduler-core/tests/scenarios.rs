// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios and randomized-stimulus invariant checks (§8).

use scheduler_config::SchedulingConfig;
use scheduler_core::effects::Effect;
use scheduler_core::stimuli::{self, NewTask};
use scheduler_core::store::SchedulerState;
use scheduler_core::task::TaskState;
use std::collections::HashMap;

fn fresh_state() -> SchedulerState {
    SchedulerState::new(SchedulingConfig::default())
}

fn add_worker(state: &mut SchedulerState, address: &str, ncores: usize) {
    let effects = stimuli::add_worker(state, address, ncores, "host", HashMap::new(), HashMap::new(), Vec::new());
    assert!(effects.0.is_empty(), "registering an empty worker should never itself produce effects");
}

/// Checks every invariant of §3 against the current state. Panics with the
/// violated invariant's number on the first failure.
fn assert_invariants(state: &SchedulerState) {
    for (task_key, task) in state.tasks.iter() {
        match task.state {
            TaskState::Processing => {
                let worker_key = task.processing_on.expect("I1: processing task has no processing_on");
                assert!(
                    state.workers[worker_key].processing.contains_key(&task_key),
                    "I1: {} not in its worker's processing map",
                    task.key
                );
            }
            TaskState::Memory => {
                assert!(!task.who_has.is_empty(), "I2: {} in memory with empty who_has", task.key);
                for w in &task.who_has {
                    assert!(
                        state.workers[*w].has_what.contains(&task_key),
                        "I2: {} not reciprocated in worker {}'s has_what",
                        task.key,
                        state.workers[*w].address
                    );
                }
            }
            TaskState::Waiting => {
                for dep in &task.waiting_on {
                    assert!(task.dependencies.contains(dep), "I3: waiting_on not a subset of dependencies for {}", task.key);
                    assert_ne!(state.tasks[*dep].state, TaskState::Memory, "I3: {} waits on an in-memory dependency", task.key);
                }
            }
            TaskState::NoWorker => {
                assert!(state.unrunnable.contains(&task_key), "I4: {} is no-worker but not in unrunnable", task.key);
            }
            _ => {}
        }

        for dependent in &task.waiters {
            let dep_task = &state.tasks[*dependent];
            assert!(
                matches!(dep_task.state, TaskState::Waiting | TaskState::Processing),
                "I5: {} waits on {} but is in state {}",
                dep_task.key,
                task.key,
                dep_task.state
            );
        }

        for client_key in &task.who_wants {
            assert!(
                state.clients[*client_key].wants_what.contains(&task_key),
                "I6: {} wanted by a client that doesn't list it back",
                task.key
            );
        }
    }

    for (_, worker) in state.workers.iter() {
        let expected_nbytes: i64 = worker.has_what.iter().map(|t| state.tasks[*t].nbytes.max(0)).sum();
        assert_eq!(worker.nbytes as i64, expected_nbytes, "I7: worker {} nbytes mismatch", worker.address);
        let expected_occupancy: f64 = worker.processing.values().sum();
        assert!(
            (worker.occupancy - expected_occupancy).abs() < 1e-6,
            "I7: worker {} occupancy mismatch ({} vs {})",
            worker.address,
            worker.occupancy,
            expected_occupancy
        );
    }

    let sum_occupancy: f64 = state.workers.iter().map(|(_, w)| w.occupancy).sum();
    assert!((state.total_occupancy - sum_occupancy).abs() < 1e-6, "I8: total_occupancy mismatch");
    let sum_ncores: usize = state.workers.iter().map(|(_, w)| w.ncores).sum();
    assert_eq!(state.total_ncores, sum_ncores, "I8: total_ncores mismatch");
}

#[test]
fn scenario_linear_chain() {
    let mut state = fresh_state();
    add_worker(&mut state, "w1", 2);
    add_worker(&mut state, "w2", 2);

    let mut a = NewTask::new("a");
    a.run_spec = Some(vec![1]);
    let mut b = NewTask::new("b");
    b.run_spec = Some(vec![2]);
    b.dependencies = vec!["a".to_string()];
    let mut c = NewTask::new("c");
    c.run_spec = Some(vec![3]);
    c.dependencies = vec!["b".to_string()];

    let effects = stimuli::update_graph(&mut state, "client-1", vec![a, b, c], vec!["c".to_string()], None);
    assert!(effects.0.iter().any(|e| matches!(e, Effect::ComputeTask { key, .. } if key == "a")));
    assert_invariants(&state);

    let effects = stimuli::task_finished(&mut state, "a", "w1", 10);
    assert!(effects.0.iter().any(|e| matches!(e, Effect::ComputeTask { key, .. } if key == "b")));
    assert_invariants(&state);

    let effects = stimuli::task_finished(&mut state, "b", "w1", 10);
    assert!(effects.0.iter().any(|e| matches!(e, Effect::ComputeTask { key, .. } if key == "c")));
    assert_invariants(&state);

    let effects = stimuli::task_finished(&mut state, "c", "w2", 10);
    let key_in_memory: Vec<_> = effects
        .0
        .iter()
        .filter(|e| matches!(e, Effect::KeyInMemory { key, .. } if key == "c"))
        .collect();
    assert_eq!(key_in_memory.len(), 1, "exactly one key-in-memory for c");

    let c_key = state.task_key("c").unwrap();
    assert_eq!(state.tasks[c_key].state, TaskState::Memory);
    assert_invariants(&state);
}

#[test]
fn scenario_single_retry() {
    let mut state = fresh_state();
    add_worker(&mut state, "w1", 2);

    let mut x = NewTask::new("x");
    x.run_spec = Some(vec![1]);
    x.retries = 1;
    stimuli::update_graph(&mut state, "client-1", vec![x], vec!["x".to_string()], None);

    let effects = stimuli::task_erred(&mut state, "x", "w1", b"boom".to_vec(), Vec::new());
    assert!(effects.0.iter().any(|e| matches!(e, Effect::ComputeTask { key, .. } if key == "x")), "should be rescheduled, not failed");
    assert!(!effects.0.iter().any(|e| matches!(e, Effect::TaskErred { .. })));

    let effects = stimuli::task_finished(&mut state, "x", "w1", 5);
    assert!(effects.0.iter().any(|e| matches!(e, Effect::KeyInMemory { key, .. } if key == "x")));
    assert!(!effects.0.iter().any(|e| matches!(e, Effect::TaskErred { .. })), "no client task-erred expected");

    let x_key = state.task_key("x").unwrap();
    assert_eq!(state.tasks[x_key].state, TaskState::Memory);
    assert_invariants(&state);
}

#[test]
fn scenario_poisoning() {
    let mut config = SchedulingConfig::default();
    config.allowed_failures = 3;
    let mut state = SchedulerState::new(config);
    for i in 0..4 {
        add_worker(&mut state, &format!("w{i}"), 1);
    }

    let mut y = NewTask::new("y");
    y.run_spec = Some(vec![1]);
    stimuli::update_graph(&mut state, "client-1", vec![y], vec!["y".to_string()], None);

    for i in 0..3 {
        let effects = stimuli::task_erred(&mut state, "y", &format!("w{i}"), b"err".to_vec(), Vec::new());
        assert!(!effects.0.iter().any(|e| matches!(e, Effect::TaskErred { .. })), "failure {i} should not yet poison");
        assert_invariants(&state);
    }

    let effects = stimuli::task_erred(&mut state, "y", "w3", b"err".to_vec(), Vec::new());
    assert_eq!(effects.0.iter().filter(|e| matches!(e, Effect::TaskErred { .. })).count(), 1);

    let y_key = state.task_key("y").unwrap();
    assert_eq!(state.tasks[y_key].state, TaskState::Erred);
    assert_invariants(&state);
}

#[test]
fn scenario_worker_loss_mid_execution() {
    let mut state = fresh_state();
    add_worker(&mut state, "w1", 1);
    add_worker(&mut state, "w2", 1);

    let mut x = NewTask::new("slow");
    x.run_spec = Some(vec![1]);
    stimuli::update_graph(&mut state, "client-1", vec![x], vec!["slow".to_string()], None);

    let x_key = state.task_key("slow").unwrap();
    assert_eq!(state.tasks[x_key].state, TaskState::Processing);
    let assigned_worker = state.tasks[x_key].processing_on.expect("should be assigned");
    let assigned_address = state.workers[assigned_worker].address.clone();

    let effects = stimuli::remove_worker(&mut state, &assigned_address, false);
    assert!(
        effects.0.iter().any(|e| matches!(e, Effect::ComputeTask { key, .. } if key == "slow")),
        "should be reassigned to the surviving worker"
    );
    assert!(!effects.0.iter().any(|e| matches!(e, Effect::TaskErred { .. })), "no client error expected on a single loss");

    let x_key = state.task_key("slow").unwrap();
    assert_eq!(state.tasks[x_key].suspicious, 1);

    let surviving_address = if assigned_address == "w1" { "w2" } else { "w1" };
    let effects = stimuli::task_finished(&mut state, "slow", surviving_address, 7);
    assert!(effects.0.iter().any(|e| matches!(e, Effect::KeyInMemory { key, .. } if key == "slow")));
    assert_eq!(state.tasks[x_key].state, TaskState::Memory);
    assert_invariants(&state);
}

#[test]
fn scenario_cascade_release() {
    let mut state = fresh_state();
    add_worker(&mut state, "w1", 2);

    let mut a = NewTask::new("a");
    a.run_spec = Some(vec![1]);
    let mut b = NewTask::new("b");
    b.run_spec = Some(vec![2]);
    b.dependencies = vec!["a".to_string()];
    let mut c = NewTask::new("c");
    c.run_spec = Some(vec![3]);
    c.dependencies = vec!["b".to_string()];

    stimuli::update_graph(&mut state, "client-1", vec![a, b, c], vec!["a".to_string()], None);
    stimuli::task_finished(&mut state, "a", "w1", 1);
    stimuli::update_graph(&mut state, "client-1", Vec::new(), vec!["b".to_string(), "c".to_string()], None);

    assert_invariants(&state);

    stimuli::cancel(&mut state, &["a".to_string()], "client-1", false);

    for key in ["a", "b", "c"] {
        assert!(state.task_key(key).is_none(), "{key} should have been forgotten after cascade release");
    }
    for (_, worker) in state.workers.iter() {
        assert!(worker.has_what.is_empty(), "worker still holds a forgotten task");
    }
    assert_invariants(&state);
}

#[test]
fn scenario_adaptive_scale_down() {
    use scheduler_core::adaptive::{self, AdaptiveRecommendation, AdaptiveState};

    let mut state = fresh_state();
    for i in 0..4 {
        add_worker(&mut state, &format!("w{i}"), 2);
    }
    let mut adaptive = AdaptiveState::new();
    for addr in ["w0", "w1", "w2", "w3"] {
        adaptive.observed.insert(addr.to_string());
        adaptive.plan.insert(addr.to_string());
        adaptive.requested.insert(addr.to_string());
    }

    for tick in 0..2 {
        match adaptive::tick(&mut adaptive, &state, 2, 3) {
            AdaptiveRecommendation::Down { workers } => {
                assert!(workers.is_empty(), "no close before the 3rd consecutive idle tick (tick {tick})")
            }
            other => panic!("expected a (still-empty) Down recommendation, got {other:?}"),
        }
    }
    match adaptive::tick(&mut adaptive, &state, 2, 3) {
        AdaptiveRecommendation::Down { workers } => assert_eq!(workers.len(), 2, "should close exactly 2 idle workers"),
        other => panic!("expected Down after 3 consecutive idle ticks, got {other:?}"),
    }
}

/// Drives a bounded number of random well-formed stimuli through a small cluster
/// and checks every invariant of §3 after each one (P1). Seeded so a failure is
/// reproducible: rerun with the same seed to see the exact stimulus sequence.
#[test]
fn randomized_stimuli_preserve_invariants() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut state = fresh_state();
    for i in 0..3 {
        add_worker(&mut state, &format!("w{i}"), 2);
    }

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut next_key = 0usize;
    let mut live_keys: Vec<String> = Vec::new();

    for _ in 0..500 {
        match rng.random_range(0..5) {
            0 => {
                let key = format!("k{next_key}");
                next_key += 1;
                let mut task = NewTask::new(key.clone());
                task.run_spec = Some(vec![1]);
                if let Some(dep) = live_keys.last() {
                    task.dependencies = vec![dep.clone()];
                }
                stimuli::update_graph(&mut state, "client-1", vec![task], vec![key.clone()], None);
                live_keys.push(key);
            }
            1 => {
                if let Some(key) = live_keys.first().cloned() {
                    if let Some(task_key) = state.task_key(&key) {
                        if let Some(worker_key) = state.tasks[task_key].processing_on {
                            let address = state.workers[worker_key].address.clone();
                            stimuli::task_finished(&mut state, &key, &address, 10);
                        }
                    }
                }
            }
            2 => {
                if let Some(key) = live_keys.first().cloned() {
                    if let Some(task_key) = state.task_key(&key) {
                        if let Some(worker_key) = state.tasks[task_key].processing_on {
                            let address = state.workers[worker_key].address.clone();
                            stimuli::task_erred(&mut state, &key, &address, b"x".to_vec(), Vec::new());
                        }
                    }
                }
            }
            3 => {
                if !live_keys.is_empty() {
                    let idx = rng.random_range(0..live_keys.len());
                    let key = live_keys.remove(idx);
                    stimuli::cancel(&mut state, &[key], "client-1", false);
                }
            }
            _ => {
                let address = format!("w{}", rng.random_range(0..3));
                if state.worker_key(&address).is_some() {
                    stimuli::remove_worker(&mut state, &address, false);
                    let _ = stimuli::add_worker(&mut state, address, 2, "host", HashMap::new(), HashMap::new(), Vec::new());
                }
            }
        }
        assert_invariants(&state);
    }
}
