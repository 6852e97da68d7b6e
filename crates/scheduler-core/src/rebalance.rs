// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Rebalance and replicate (§4.6).
//!
//! Both operations redistribute already-computed results across workers rather
//! than scheduling new work. The core has no network of its own, so "gather then
//! delete" is modeled as: compute the move, emit the `Gather`/`DeleteData`
//! effects the caller enacts, and update `who_has`/`has_what` optimistically —
//! the same synchronous-apply convention the transition engine uses elsewhere
//! (§5). A production wire-up would instead wait for the gather's confirmation
//! before mutating `who_has`; that confirmation round-trip lives outside this
//! crate.

use crate::effects::{Effect, Effects};
use crate::key::{TaskKey, WorkerKey};
use crate::store::SchedulerState;
use crate::task::TaskState;
use std::collections::HashSet;

/// One planned move of a task's data from one worker to another.
#[derive(Debug, Clone)]
pub struct RebalanceMove {
    pub task: TaskKey,
    pub from: WorkerKey,
    pub to: WorkerKey,
}

/// Redistributes in-memory results among `workers` (all connected workers if
/// `None`) restricted to `keys` (all in-memory tasks if `None`), shipping the
/// largest replicas off the heaviest workers onto the lightest until both sides
/// cross the average (§4.6, §8 P8).
pub fn rebalance(state: &mut SchedulerState, keys: Option<&[String]>, workers: Option<&[String]>) -> Effects {
    let worker_set: Vec<WorkerKey> = match workers {
        Some(addrs) => addrs.iter().filter_map(|a| state.worker_key(a)).collect(),
        None => state.connected_workers().collect(),
    };
    if worker_set.len() < 2 {
        return Effects::new();
    }

    let relevant: HashSet<TaskKey> = match keys {
        Some(ks) => ks.iter().filter_map(|k| state.task_key(k)).collect(),
        None => state
            .tasks
            .iter()
            .filter(|(_, t)| t.state == TaskState::Memory)
            .map(|(k, _)| k)
            .collect(),
    };

    let total_bytes: f64 = worker_set.iter().map(|w| state.workers[*w].nbytes as f64).sum();
    let average = total_bytes / worker_set.len() as f64;

    let mut senders: Vec<WorkerKey> = worker_set
        .iter()
        .copied()
        .filter(|w| (state.workers[*w].nbytes as f64) > average)
        .collect();
    senders.sort_by_key(|w| std::cmp::Reverse(state.workers[*w].nbytes));

    let mut receivers: Vec<WorkerKey> = worker_set
        .iter()
        .copied()
        .filter(|w| (state.workers[*w].nbytes as f64) < average)
        .collect();
    receivers.sort_by_key(|w| state.workers[*w].nbytes);

    let mut moves = Vec::new();
    let mut recv_idx = 0;

    for sender in senders {
        if recv_idx >= receivers.len() {
            break;
        }
        let mut sender_bytes = state.workers[sender].nbytes as f64;
        let mut candidates: Vec<TaskKey> = state.workers[sender]
            .has_what
            .iter()
            .copied()
            .filter(|t| relevant.contains(t))
            .collect();
        candidates.sort_by_key(|t| std::cmp::Reverse(state.tasks[*t].nbytes));

        for task in candidates {
            if sender_bytes <= average || recv_idx >= receivers.len() {
                break;
            }
            let receiver = receivers[recv_idx];
            if state.tasks[task].who_has.contains(&receiver) {
                continue;
            }
            let nbytes = state.tasks[task].nbytes.max(0) as f64;
            moves.push(RebalanceMove {
                task,
                from: sender,
                to: receiver,
            });
            sender_bytes -= nbytes;
            let receiver_bytes = state.workers[receiver].nbytes as f64 + nbytes;
            if receiver_bytes >= average {
                recv_idx += 1;
            }
        }
    }

    let mut effects = Effects::new();
    for mov in &moves {
        effects.extend(apply_move(state, mov));
    }
    effects
}

fn apply_move(state: &mut SchedulerState, mov: &RebalanceMove) -> Effects {
    let mut effects = Effects::new();
    let key = state.tasks[mov.task].key.clone();
    let from_addr = state.workers[mov.from].address.clone();
    let to_addr = state.workers[mov.to].address.clone();
    let nbytes = state.tasks[mov.task].nbytes.max(0) as u64;

    effects.push(Effect::Gather {
        worker: to_addr,
        key: key.clone(),
        from: from_addr.clone(),
    });

    if let Some(task) = state.tasks.get_mut(mov.task) {
        task.who_has.insert(mov.to);
        task.who_has.remove(&mov.from);
    }
    if let Some(receiver) = state.workers.get_mut(mov.to) {
        receiver.has_what.insert(mov.task);
        receiver.nbytes += nbytes;
    }
    if let Some(sender) = state.workers.get_mut(mov.from) {
        sender.has_what.remove(&mov.task);
        sender.nbytes = sender.nbytes.saturating_sub(nbytes);
    }

    effects.push(Effect::DeleteData {
        worker: from_addr,
        keys: vec![key],
    });
    effects
}

/// Ensures each of `keys` has at least `n` holders among currently connected
/// workers, fetching from an existing holder in rounds bounded by
/// `branching_factor` per round, trimming over-replicated keys first if `delete`
/// (§4.6, §8 P7).
pub fn replicate(state: &mut SchedulerState, keys: &[String], n: usize, branching_factor: usize, delete: bool) -> Effects {
    let mut effects = Effects::new();
    let candidates: Vec<WorkerKey> = state.connected_workers().collect();
    if candidates.is_empty() {
        return effects;
    }

    if delete {
        for key in keys {
            if let Some(task) = state.task_key(key) {
                effects.extend(trim_over_replicated(state, task, n));
            }
        }
    }

    loop {
        let mut progressed = false;
        for key in keys {
            let Some(task) = state.task_key(key) else {
                continue;
            };
            if state.tasks[task].state != TaskState::Memory {
                continue;
            }
            let holders: Vec<WorkerKey> = state.tasks[task].who_has.iter().copied().collect();
            if holders.len() >= n || holders.len() >= candidates.len() {
                continue;
            }
            let need = (n - holders.len()).min(branching_factor.max(1) * holders.len().max(1));
            let non_holders: Vec<WorkerKey> = candidates
                .iter()
                .copied()
                .filter(|w| !holders.contains(w))
                .take(need)
                .collect();
            if non_holders.is_empty() {
                continue;
            }

            let source = holders[0];
            let source_addr = state.workers[source].address.clone();
            let key_str = state.tasks[task].key.clone();
            let nbytes = state.tasks[task].nbytes.max(0) as u64;
            for target in non_holders {
                effects.push(Effect::Gather {
                    worker: state.workers[target].address.clone(),
                    key: key_str.clone(),
                    from: source_addr.clone(),
                });
                if let Some(t) = state.tasks.get_mut(task) {
                    t.who_has.insert(target);
                }
                if let Some(w) = state.workers.get_mut(target) {
                    w.has_what.insert(task);
                    w.nbytes += nbytes;
                }
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    effects
}

fn trim_over_replicated(state: &mut SchedulerState, task: TaskKey, n: usize) -> Effects {
    let mut effects = Effects::new();
    if state.tasks[task].state != TaskState::Memory {
        return effects;
    }
    let mut holders: Vec<WorkerKey> = state.tasks[task].who_has.iter().copied().collect();
    if holders.len() <= n {
        return effects;
    }
    // Drop the copy from the most heavily loaded workers first, freeing them up.
    holders.sort_by_key(|w| std::cmp::Reverse(state.workers[*w].nbytes));
    holders.truncate(holders.len() - n);

    let key_str = state.tasks[task].key.clone();
    let nbytes = state.tasks[task].nbytes.max(0) as u64;
    for holder in holders {
        if let Some(t) = state.tasks.get_mut(task) {
            t.who_has.remove(&holder);
        }
        let Some(worker) = state.workers.get_mut(holder) else {
            continue;
        };
        worker.has_what.remove(&task);
        worker.nbytes = worker.nbytes.saturating_sub(nbytes);
        effects.push(Effect::DeleteData {
            worker: worker.address.clone(),
            keys: vec![key_str.clone()],
        });
    }
    effects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use scheduler_config::SchedulingConfig;

    fn memory_task(state: &mut SchedulerState, key: &str, holder: WorkerKey, nbytes: i64) -> TaskKey {
        let task = state.get_or_create_task(key);
        state.tasks.get_mut(task).unwrap().state = TaskState::Memory;
        state.tasks.get_mut(task).unwrap().nbytes = nbytes;
        state.tasks.get_mut(task).unwrap().who_has.insert(holder);
        state.workers.get_mut(holder).unwrap().has_what.insert(task);
        state.workers.get_mut(holder).unwrap().nbytes += nbytes as u64;
        task
    }

    #[test]
    fn rebalance_moves_data_from_heavy_to_light_worker() {
        let mut state = SchedulerState::new(SchedulingConfig::default());
        let heavy = state.insert_worker(Worker::new("heavy", 2, "h1"));
        let light = state.insert_worker(Worker::new("light", 2, "h2"));
        memory_task(&mut state, "a", heavy, 1000);
        memory_task(&mut state, "b", heavy, 1000);

        let effects = rebalance(&mut state, None, None);
        assert!(!effects.0.is_empty());
        assert!(state.workers[light].nbytes > 0);
        assert!(state.workers[heavy].nbytes < 2000);
    }

    #[test]
    fn replicate_reaches_requested_holder_count() {
        let mut state = SchedulerState::new(SchedulingConfig::default());
        let w1 = state.insert_worker(Worker::new("w1", 2, "h1"));
        state.insert_worker(Worker::new("w2", 2, "h2"));
        state.insert_worker(Worker::new("w3", 2, "h3"));
        let task = memory_task(&mut state, "a", w1, 10);

        let effects = replicate(&mut state, &["a".to_string()], 3, 2, true);
        assert_eq!(state.tasks[task].who_has.len(), 3);
        assert!(!effects.0.is_empty());
    }
}
