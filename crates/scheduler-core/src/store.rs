// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The state store: the authoritative tables for tasks, workers, and clients, plus
//! the auxiliary indexes used by placement and the transition engine (§2, "State
//! store").

use crate::client::Client;
use crate::error::Error;
use crate::key::{ClientKey, TaskKey, WorkerKey};
use crate::task::{Priority, Task, TaskState};
use crate::worker::{Worker, WorkerStatus};
use scheduler_config::SchedulingConfig;
use slotmap::SlotMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// One applied transition, as appended to the bounded ring log (§4.1).
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub key: String,
    pub from: TaskState,
    pub to: TaskState,
    /// Keys recommended for further transition as a side effect of this one.
    pub recommendations: Vec<(String, TaskState)>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Running mean of a prefix's task duration, updated by EWMA on every finish (§4.4).
#[derive(Debug, Clone, Copy)]
pub struct PrefixStats {
    pub mean_duration_secs: f64,
}

/// Seed duration assumed for a prefix that has never finished a task.
pub const DEFAULT_DURATION_SECS: f64 = 0.5;

impl Default for PrefixStats {
    fn default() -> Self {
        Self {
            mean_duration_secs: DEFAULT_DURATION_SECS,
        }
    }
}

impl PrefixStats {
    /// EWMA update with a fixed 0.5 weight (§4.4).
    pub fn observe(&mut self, observed_secs: f64) {
        self.mean_duration_secs = 0.5 * self.mean_duration_secs + 0.5 * observed_secs;
    }
}

/// The authoritative in-memory view of the cluster (§2, §3).
pub struct SchedulerState {
    pub tasks: SlotMap<TaskKey, Task>,
    pub task_index: HashMap<String, TaskKey>,

    pub workers: SlotMap<WorkerKey, Worker>,
    pub worker_index: HashMap<String, WorkerKey>,

    pub clients: SlotMap<ClientKey, Client>,
    pub client_index: HashMap<String, ClientKey>,

    /// Workers classified idle by `check_idle_saturated` (§4.4).
    pub idle: HashSet<WorkerKey>,
    /// Workers classified saturated by `check_idle_saturated` (§4.4).
    pub saturated: HashSet<WorkerKey>,
    /// Runnable tasks with no currently valid worker (§3, invariant 4).
    pub unrunnable: HashSet<TaskKey>,

    /// Host -> workers registered at that host, for `host_restrictions` resolution.
    pub host_index: HashMap<String, HashSet<WorkerKey>>,
    /// Resource name -> workers advertising a nonzero quantity of it.
    pub resource_index: HashMap<String, HashSet<WorkerKey>>,

    pub total_occupancy: f64,
    pub total_ncores: usize,

    /// Bumped on every `update_graph` call; the high half of task priority (§4.3).
    pub generation: u64,

    pub transition_log: VecDeque<TransitionRecord>,
    pub prefixes: HashMap<String, PrefixStats>,

    /// Immutable snapshot taken at construction; changing a key requires a new scheduler.
    pub config: SchedulingConfig,

    /// Round-robin cursor into `idle`, used by `decide_worker` (§4.2).
    pub(crate) idle_round_robin_cursor: usize,
}

impl SchedulerState {
    #[must_use]
    pub fn new(config: SchedulingConfig) -> Self {
        Self {
            tasks: SlotMap::with_key(),
            task_index: HashMap::new(),
            workers: SlotMap::with_key(),
            worker_index: HashMap::new(),
            clients: SlotMap::with_key(),
            client_index: HashMap::new(),
            idle: HashSet::new(),
            saturated: HashSet::new(),
            unrunnable: HashSet::new(),
            host_index: HashMap::new(),
            resource_index: HashMap::new(),
            total_occupancy: 0.0,
            total_ncores: 0,
            generation: 0,
            transition_log: VecDeque::new(),
            prefixes: HashMap::new(),
            config,
            idle_round_robin_cursor: 0,
        }
    }

    /// Returns the internal key for a task, if it exists.
    #[must_use]
    pub fn task_key(&self, key: &str) -> Option<TaskKey> {
        self.task_index.get(key).copied()
    }

    /// Returns the internal key for a worker, if it exists.
    #[must_use]
    pub fn worker_key(&self, address: &str) -> Option<WorkerKey> {
        self.worker_index.get(address).copied()
    }

    /// Returns the internal key for a client, if it exists.
    #[must_use]
    pub fn client_key(&self, id: &str) -> Option<ClientKey> {
        self.client_index.get(id).copied()
    }

    /// Gets or creates a released task for `key`, returning its internal key.
    pub fn get_or_create_task(&mut self, key: &str) -> TaskKey {
        if let Some(existing) = self.task_index.get(key) {
            return *existing;
        }
        let priority = Priority::new(self.generation, 0.0);
        let task_key = self.tasks.insert(Task::new(key, priority));
        self.task_index.insert(key.to_string(), task_key);
        task_key
    }

    /// Registers a new worker, returning its internal key. Callers must follow up
    /// with `check_idle_saturated` once the worker's initial occupancy is known.
    pub fn insert_worker(&mut self, worker: Worker) -> WorkerKey {
        let address = worker.address.clone();
        let host = worker.host.clone();
        let ncores = worker.ncores;
        let resources: Vec<String> = worker.resources.keys().cloned().collect();

        let worker_key = self.workers.insert(worker);
        self.worker_index.insert(address, worker_key);
        self.host_index.entry(host).or_default().insert(worker_key);
        for resource in resources {
            self.resource_index.entry(resource).or_default().insert(worker_key);
        }
        self.total_ncores += ncores;
        self.idle.insert(worker_key);
        worker_key
    }

    /// Removes a worker from every table and index (§3, destruction semantics; §8 P9).
    /// Does not touch tasks; callers apply the `remove_worker` stimulus first.
    pub fn remove_worker(&mut self, worker_key: WorkerKey) -> Option<Worker> {
        let worker = self.workers.remove(worker_key)?;
        self.worker_index.remove(&worker.address);
        if let Some(hosts) = self.host_index.get_mut(&worker.host) {
            hosts.remove(&worker_key);
            if hosts.is_empty() {
                self.host_index.remove(&worker.host);
            }
        }
        for resource in worker.resources.keys() {
            if let Some(workers) = self.resource_index.get_mut(resource) {
                workers.remove(&worker_key);
                if workers.is_empty() {
                    self.resource_index.remove(resource);
                }
            }
        }
        self.total_ncores = self.total_ncores.saturating_sub(worker.ncores);
        self.total_occupancy -= worker.occupancy;
        self.idle.remove(&worker_key);
        self.saturated.remove(&worker_key);
        Some(worker)
    }

    /// Forgets a task: erases it from the tables and indexes (§4.1, `* -> forgotten`).
    pub fn forget_task(&mut self, task_key: TaskKey) -> Option<Task> {
        let task = self.tasks.remove(task_key)?;
        self.task_index.remove(&task.key);
        self.unrunnable.remove(&task_key);
        Some(task)
    }

    /// Registers a new client, returning its internal key.
    pub fn insert_client(&mut self, id: impl Into<String>) -> ClientKey {
        let id = id.into();
        let client_key = self.clients.insert(Client::new(id.clone()));
        self.client_index.insert(id, client_key);
        client_key
    }

    /// Removes a client from the table and index.
    pub fn remove_client(&mut self, client_key: ClientKey) -> Option<Client> {
        let client = self.clients.remove(client_key)?;
        self.client_index.remove(&client.id);
        Some(client)
    }

    /// Appends a transition to the bounded ring log, evicting the oldest entry once
    /// `transition_log_length` is exceeded (§4.1, §6).
    pub fn record_transition(&mut self, record: TransitionRecord) {
        self.transition_log.push_back(record);
        while self.transition_log.len() > self.config.transition_log_length {
            self.transition_log.pop_front();
        }
    }

    /// Current EWMA mean duration for a prefix, or the seed constant if unseen (§4.4).
    #[must_use]
    pub fn mean_duration(&self, prefix: &str) -> f64 {
        self.prefixes
            .get(prefix)
            .map_or(DEFAULT_DURATION_SECS, |s| s.mean_duration_secs)
    }

    /// Records an observed duration for a prefix (§4.4).
    pub fn observe_duration(&mut self, prefix: &str, observed_secs: f64) {
        self.prefixes.entry(prefix.to_string()).or_default().observe(observed_secs);
    }

    /// Workers currently accepting traffic (`Connected`, not mid-close).
    pub fn connected_workers(&self) -> impl Iterator<Item = WorkerKey> + '_ {
        self.workers
            .iter()
            .filter(|(_, w)| w.status == WorkerStatus::Connected)
            .map(|(k, _)| k)
    }

    /// Looks up a task, failing with `UnknownKey` instead of panicking if it was
    /// forgotten out from under a stale reference.
    pub fn task_mut(&mut self, key: TaskKey) -> Result<&mut Task, Error> {
        self.tasks.get_mut(key).ok_or(Error::UnknownKey {
            kind: "task",
            key: format!("{key:?}"),
        })
    }

    /// Looks up a worker, failing with `UnknownKey` instead of panicking if it
    /// disconnected out from under a stale reference.
    pub fn worker_mut(&mut self, key: WorkerKey) -> Result<&mut Worker, Error> {
        self.workers.get_mut(key).ok_or(Error::UnknownKey {
            kind: "worker",
            key: format!("{key:?}"),
        })
    }
}
