// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The scheduler's event loop.
//!
//! Single-threaded cooperative: one `Server` owns the entire `SchedulerState`
//! along with the adaptive control loop and work-stealing state, and one
//! `tokio::select!` loop is the only place that ever mutates it (§5). Socket
//! acceptance and per-connection framing happen on separate tasks (`peer`), but
//! they only ever forward decoded messages through an `mpsc` channel; the state
//! itself never crosses a task boundary.

pub mod admin;
/// Errors returned by server startup and peer-channel plumbing.
pub mod error;
pub mod identity;
pub mod peer;
/// Utilities to spawn async tasks on dedicated threads with graceful shutdown.
pub mod thread_task;

use admin::{AdminLog, Direction};
use error::Error;
use peer::ServerEvent;
use scheduler_config::Config;
use scheduler_core::adaptive::{self, AdaptiveRecommendation, AdaptiveState};
use scheduler_core::effects::Effect;
use scheduler_core::rebalance;
use scheduler_core::stealing::{self, StealingState};
use scheduler_core::stimuli::{self, NewTask};
use scheduler_core::store::SchedulerState;
use scheduler_protocol::framing::BatchedSender;
use scheduler_protocol::messages::{ClientMessage, GraphTask, SchedulerToClient, SchedulerToWorker, WorkerMessage};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How often the work-stealing tick runs; not user-configurable since it has no
/// observable effect beyond latency (§4.5 is best-effort by design).
const STEALING_INTERVAL: Duration = Duration::from_millis(100);

/// How often the heartbeat-liveness sweep runs.
const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A worker missing this many consecutive heartbeat intervals is declared lost.
const HEARTBEAT_MISS_TOLERANCE: f64 = 3.0;

/// Heartbeat cadence (seconds) as a function of cluster size (§6).
fn heartbeat_interval_secs(worker_count: usize) -> f64 {
    if worker_count <= 10 {
        0.5
    } else if worker_count < 50 {
        1.0
    } else if worker_count < 200 {
        2.0
    } else {
        5.0
    }
}

/// Registered worker connection: the batched outbox the event loop drains on
/// every flush tick, plus its paired shutdown state.
struct WorkerHandle {
    outbox: BatchedSender<SchedulerToWorker>,
}

/// Registered client connection.
struct ClientHandle {
    outbox: BatchedSender<SchedulerToClient>,
}

/// Owns the scheduler's full mutable state and drives the event loop.
pub struct Server {
    config: Config,
    state: SchedulerState,
    adaptive: AdaptiveState,
    stealing: StealingState,
    admin: AdminLog,
    workers: HashMap<String, WorkerHandle>,
    clients: HashMap<String, ClientHandle>,
    /// Millisecond clock value of each worker's most recent heartbeat or registration.
    last_heartbeat: HashMap<String, i64>,
}

impl Server {
    #[must_use]
    fn new(config: Config) -> Self {
        let admin = AdminLog::new(config.admin.log_length, config.admin.low_level_log_length);
        let state = SchedulerState::new(config.scheduling.clone());
        Self {
            config,
            state,
            adaptive: AdaptiveState::new(),
            stealing: StealingState::new(),
            admin,
            workers: HashMap::new(),
            clients: HashMap::new(),
            last_heartbeat: HashMap::new(),
        }
    }

    fn now_ms(clock: &mut i64) -> i64 {
        *clock += 1;
        *clock
    }

    fn handle_event(&mut self, event: ServerEvent, clock: &mut i64) {
        match event {
            ServerEvent::WorkerConnected { register, ready } => {
                let address = register.address.clone();
                info!(address = %address, ncores = register.ncores, "worker connected");
                let (outbox, rx) = BatchedSender::new(self.config.comm.batch_interval);
                self.workers.insert(address.clone(), WorkerHandle { outbox });
                self.adaptive.observed.insert(address.clone());
                self.adaptive.plan.insert(address.clone());
                self.last_heartbeat.insert(address.clone(), Self::now_ms(clock));
                let _ = ready.send(rx);

                let effects = stimuli::add_worker(
                    &mut self.state,
                    register.address,
                    register.ncores,
                    register.host,
                    register.services,
                    register.resources,
                    register.nbytes_known,
                );
                self.admin.record_event(Self::now_ms(clock), format!("worker {address} joined"));
                self.send_to_worker(
                    &address,
                    SchedulerToWorker::Registered { heartbeat_interval_secs: heartbeat_interval_secs(self.workers.len()) },
                );
                self.enact(effects);
            }
            ServerEvent::WorkerMessage { address, message } => {
                self.last_heartbeat.insert(address.clone(), Self::now_ms(clock));
                self.admin.record_low_level(Self::now_ms(clock), address.clone(), Direction::Inbound, format!("{message:?}"));
                let effects = self.dispatch_worker_message(&address, message);
                self.enact(effects);
            }
            ServerEvent::WorkerDisconnected { address } => {
                info!(address = %address, "worker disconnected");
                self.workers.remove(&address);
                self.adaptive.observed.remove(&address);
                self.adaptive.plan.remove(&address);
                self.adaptive.requested.remove(&address);
                self.last_heartbeat.remove(&address);
                let effects = stimuli::remove_worker(&mut self.state, &address, false);
                self.admin.record_event(Self::now_ms(clock), format!("worker {address} left"));
                self.enact(effects);
            }
            ServerEvent::ClientConnected { client_id, ready } => {
                info!(client_id = %client_id, "client connected");
                let (outbox, rx) = BatchedSender::new(self.config.comm.batch_interval);
                self.clients.insert(client_id.clone(), ClientHandle { outbox });
                let _ = ready.send(rx);
                self.admin.record_event(Self::now_ms(clock), format!("client {client_id} connected"));
            }
            ServerEvent::ClientMessage { client_id, message } => {
                self.admin
                    .record_low_level(Self::now_ms(clock), client_id.clone(), Direction::Inbound, format!("{message:?}"));
                let effects = self.dispatch_client_message(&client_id, message);
                self.enact(effects);
            }
            ServerEvent::ClientDisconnected { client_id } => {
                info!(client_id = %client_id, "client disconnected");
                self.clients.remove(&client_id);
                if let Some(client_key) = self.state.client_key(&client_id) {
                    self.state.remove_client(client_key);
                }
                self.admin.record_event(Self::now_ms(clock), format!("client {client_id} disconnected"));
            }
        }
    }

    fn dispatch_worker_message(&mut self, address: &str, message: WorkerMessage) -> scheduler_core::Effects {
        match message {
            WorkerMessage::Register { .. } => scheduler_core::Effects::new(),
            WorkerMessage::Heartbeat { .. } => scheduler_core::Effects::new(),
            WorkerMessage::TaskFinished { key, nbytes, .. } => stimuli::task_finished(&mut self.state, &key, address, nbytes),
            WorkerMessage::TaskErred {
                key, exception, traceback, ..
            } => stimuli::task_erred(&mut self.state, &key, address, exception, traceback),
            WorkerMessage::MissingData { cause_key, reporting_worker } => {
                stimuli::missing_data(&mut self.state, &cause_key, &reporting_worker)
            }
            WorkerMessage::LongRunning { key, compute_duration_secs, .. } => {
                stimuli::long_running(&mut self.state, &key, compute_duration_secs)
            }
            WorkerMessage::ReleaseWorkerData { keys, .. } => stimuli::release_worker_data(&mut self.state, &keys, address),
            WorkerMessage::AddKeys { keys, .. } => {
                let mut effects = scheduler_core::Effects::new();
                let Some(worker_key) = self.state.worker_key(address) else {
                    return effects;
                };
                for (key, nbytes) in keys {
                    let task_key = self.state.get_or_create_task(&key);
                    if let Some(task) = self.state.tasks.get_mut(task_key) {
                        task.who_has.insert(worker_key);
                        if task.nbytes < 0 {
                            task.nbytes = nbytes;
                        }
                    }
                    if let Some(worker) = self.state.workers.get_mut(worker_key) {
                        worker.has_what.insert(task_key);
                    }
                }
                effects
            }
            WorkerMessage::Reschedule { address } => stimuli::remove_worker(&mut self.state, &address, true),
            WorkerMessage::Unregister { address, safe } => stimuli::remove_worker(&mut self.state, &address, safe),
        }
    }

    fn dispatch_client_message(&mut self, client_id: &str, message: ClientMessage) -> scheduler_core::Effects {
        match message {
            ClientMessage::UpdateGraph { client_id, tasks, keys, submitted_by } => {
                let tasks = tasks.into_iter().map(Self::graph_task_to_new_task).collect();
                stimuli::update_graph(&mut self.state, &client_id, tasks, keys, submitted_by.as_deref())
            }
            ClientMessage::ClientDesiresKeys { client_id, keys } => {
                let client_key = self
                    .state
                    .client_key(&client_id)
                    .unwrap_or_else(|| self.state.insert_client(client_id.clone()));
                for key in keys {
                    let task_key = self.state.get_or_create_task(&key);
                    if let Some(client) = self.state.clients.get_mut(client_key) {
                        client.wants_what.insert(task_key);
                    }
                    if let Some(task) = self.state.tasks.get_mut(task_key) {
                        task.who_wants.insert(client_key);
                    }
                }
                scheduler_core::Effects::new()
            }
            ClientMessage::ClientReleasesKeys { client_id, keys } => stimuli::cancel(&mut self.state, &keys, &client_id, false),
            ClientMessage::Cancel { client_id, keys, force } => stimuli::cancel(&mut self.state, &keys, &client_id, force),
            ClientMessage::Restart => {
                warn!("restart requested; client-driven restart orchestration is out of scope for this event loop");
                scheduler_core::Effects::new()
            }
            ClientMessage::Scatter { .. } => {
                let _ = client_id;
                scheduler_core::Effects::new()
            }
            ClientMessage::Gather { .. } => scheduler_core::Effects::new(),
            ClientMessage::Feed { .. } => scheduler_core::Effects::new(),
            ClientMessage::Rebalance { keys, workers } => {
                rebalance::rebalance(&mut self.state, keys.as_deref(), workers.as_deref())
            }
            ClientMessage::Replicate { keys, n, branching_factor, delete } => {
                rebalance::replicate(&mut self.state, &keys, n, branching_factor, delete)
            }
        }
    }

    fn graph_task_to_new_task(task: GraphTask) -> NewTask {
        let mut new_task = NewTask::new(task.key);
        new_task.run_spec = task.run_spec;
        new_task.dependencies = task.dependencies;
        new_task.host_restrictions = task.host_restrictions.into_iter().collect();
        new_task.worker_restrictions = task.worker_restrictions.into_iter().collect();
        new_task.loose_restrictions = task.loose_restrictions;
        new_task.resource_restrictions = task.resource_restrictions;
        new_task.retries = task.retries;
        new_task.priority_order = task.priority_order;
        new_task
    }

    /// Translates core `Effect`s into wire messages queued on the relevant peer's
    /// batched outbox (§5). Effects that name a peer with no live connection are
    /// silently dropped: the peer already disconnected and will reconcile state
    /// on reconnection rather than have this delivery retried.
    fn enact(&mut self, effects: scheduler_core::Effects) {
        for effect in effects.0 {
            match effect {
                Effect::ComputeTask { worker, key, duration_estimate_secs } => {
                    let Some(message) = self.build_compute_task(&key, duration_estimate_secs) else {
                        continue;
                    };
                    self.send_to_worker(&worker, message);
                }
                Effect::ReleaseTask { worker, key } => self.send_to_worker(&worker, SchedulerToWorker::ReleaseTask { key }),
                Effect::DeleteData { worker, keys } => self.send_to_worker(&worker, SchedulerToWorker::DeleteData { keys }),
                Effect::Close { worker } => self.send_to_worker(&worker, SchedulerToWorker::Close),
                Effect::Gather { worker, key, from } => self.send_to_worker(&worker, SchedulerToWorker::Gather { key, from }),
                Effect::KeyInMemory { client, key } => {
                    let nbytes = self.state.task_key(&key).map_or(-1, |k| self.state.tasks[k].nbytes);
                    self.send_to_client(&client, SchedulerToClient::KeyInMemory { key, nbytes });
                }
                Effect::TaskErred { client, key, exception, traceback } => {
                    self.send_to_client(&client, SchedulerToClient::TaskErred { key, exception, traceback });
                }
                Effect::CancelledKey { client, key } => {
                    self.send_to_client(&client, SchedulerToClient::CancelledKey { key });
                }
            }
        }
    }

    fn build_compute_task(&self, key: &str, duration_estimate_secs: f64) -> Option<SchedulerToWorker> {
        let task_key = self.state.task_key(key)?;
        let task = &self.state.tasks[task_key];
        let dependencies = task
            .dependencies
            .iter()
            .filter_map(|dep_key| {
                let dep = self.state.tasks.get(*dep_key)?;
                let who_has: Vec<String> = dep
                    .who_has
                    .iter()
                    .filter_map(|w| self.state.workers.get(*w).map(|w| w.address.clone()))
                    .collect();
                Some((dep.key.clone(), who_has, dep.nbytes))
            })
            .collect();
        Some(SchedulerToWorker::ComputeTask {
            key: key.to_string(),
            run_spec: task.run_spec.clone().unwrap_or_default(),
            priority: (task.priority.generation, task.priority.order),
            duration_estimate_secs,
            dependencies,
            resource_restrictions: task.resource_restrictions.clone(),
        })
    }

    fn send_to_worker(&mut self, address: &str, message: SchedulerToWorker) {
        if let Some(handle) = self.workers.get_mut(address) {
            handle.outbox.send(message);
        }
    }

    fn send_to_client(&mut self, client_id: &str, message: SchedulerToClient) {
        if let Some(handle) = self.clients.get_mut(client_id) {
            handle.outbox.send(message);
        }
    }

    fn flush_peers(&mut self) {
        self.workers.retain(|_, handle| handle.outbox.flush());
        self.clients.retain(|_, handle| handle.outbox.flush());
    }

    fn adaptive_tick(&mut self) {
        let raw = adaptive::desired_worker_count(&self.state, self.config.adaptive.target_duration.as_secs_f64());
        let target = raw.max(self.config.adaptive.minimum);
        let target = match self.config.adaptive.maximum {
            Some(maximum) => target.min(maximum),
            None => target,
        };
        let rec = adaptive::tick(&mut self.adaptive, &self.state, target, self.config.adaptive.wait_count);
        match rec {
            AdaptiveRecommendation::Down { workers } => {
                for address in workers {
                    self.adaptive.plan.remove(&address);
                    self.send_to_worker(&address, SchedulerToWorker::Close);
                }
            }
            AdaptiveRecommendation::Up { n } => {
                // No resource manager is wired into this process; plan grows for
                // real once a worker actually registers (`WorkerConnected`).
                info!(target = n, current = self.adaptive.plan.len(), "adaptive scale-up recommended");
            }
            AdaptiveRecommendation::Same => {}
        }
    }

    fn stealing_tick(&mut self) {
        if !self.config.scheduling.work_stealing {
            return;
        }
        let proposals = stealing::propose_steals(&self.state, &mut self.stealing);
        for attempt in proposals {
            stealing::resolve_steal(&mut self.state, &mut self.stealing, attempt.task, true);
        }
    }

    /// Declares any worker silent for longer than its heartbeat tolerance lost
    /// (§4.8 "WorkerLost"), distinct from a dropped TCP connection: the comm
    /// channel is still open, it has simply stopped reporting.
    fn heartbeat_sweep(&mut self, clock: &mut i64) {
        let now = Self::now_ms(clock);
        let interval_ms = (heartbeat_interval_secs(self.workers.len()) * 1000.0) as i64;
        let timeout_ms = (interval_ms as f64 * HEARTBEAT_MISS_TOLERANCE) as i64;
        let stale: Vec<String> = self
            .last_heartbeat
            .iter()
            .filter(|(_, &seen)| now - seen > timeout_ms)
            .map(|(address, _)| address.clone())
            .collect();
        for address in stale {
            warn!(address = %address, "worker missed its heartbeat deadline; treating as lost");
            self.workers.remove(&address);
            self.adaptive.observed.remove(&address);
            self.adaptive.plan.remove(&address);
            self.adaptive.requested.remove(&address);
            self.last_heartbeat.remove(&address);
            let effects = stimuli::remove_worker(&mut self.state, &address, false);
            self.admin.record_event(now, format!("worker {address} declared lost (heartbeat timeout)"));
            self.enact(effects);
        }
    }

    /// Notifies every connected client the stream is closing, without waiting
    /// for the batched-send interval (§5 shutdown semantics).
    fn shutdown_peers(&mut self) {
        for handle in self.clients.values_mut() {
            handle.outbox.send(SchedulerToClient::StreamClosed);
            handle.outbox.flush();
        }
        for handle in self.workers.values_mut() {
            handle.outbox.send(SchedulerToWorker::Close);
            handle.outbox.flush();
        }
    }
}

/// Runs the scheduler's event loop until `shutdown` is cancelled.
///
/// Binds the worker/client comm listener, optionally writes the identity file,
/// then drives the single `tokio::select!` loop that owns all scheduler state
/// until a graceful shutdown is requested.
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<(), Error> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|source| Error::BindError {
            host: config.host.clone(),
            port: config.port,
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| Error::BindError {
        host: config.host.clone(),
        port: config.port,
        source,
    })?;
    let own_address = format!("tcp://{local_addr}");
    info!(address = %own_address, "scheduler listening");

    if let Some(path) = &config.scheduler_file {
        identity::write(
            path,
            &identity::Identity {
                address: own_address.clone(),
                id: uuid::Uuid::new_v4().to_string(),
                services: HashMap::new(),
            },
        )?;
    }

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut server = Server::new(config.clone());
    let mut clock: i64 = 0;

    let mut flush_interval = tokio::time::interval(config.comm.batch_interval);
    let mut adaptive_interval = tokio::time::interval(config.adaptive.interval);
    let mut stealing_interval = tokio::time::interval(STEALING_INTERVAL);
    let mut heartbeat_interval = tokio::time::interval(HEARTBEAT_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer_addr)) => {
                        tokio::spawn(peer::handle_connection(stream, events_tx.clone()));
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }
            Some(event) = events_rx.recv() => {
                server.handle_event(event, &mut clock);
            }
            _ = flush_interval.tick() => {
                server.flush_peers();
            }
            _ = adaptive_interval.tick() => {
                server.adaptive_tick();
            }
            _ = stealing_interval.tick() => {
                server.stealing_tick();
            }
            _ = heartbeat_interval.tick() => {
                server.heartbeat_sweep(&mut clock);
            }
        }
    }

    info!("scheduler shutting down");
    server.shutdown_peers();
    if let Some(path) = &config.scheduler_file {
        identity::remove(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::effects::Effects;

    fn fresh_server() -> Server {
        Server::new(Config::default())
    }

    #[test]
    fn enact_drops_effects_for_disconnected_peers() {
        let mut server = fresh_server();
        let mut effects = Effects::new();
        effects.push(Effect::KeyInMemory {
            client: "ghost-client".to_string(),
            key: "a".to_string(),
        });
        // Should not panic even though no client is registered.
        server.enact(effects);
        assert!(server.clients.is_empty());
    }

    #[test]
    fn build_compute_task_includes_dependency_locations() {
        let mut server = fresh_server();
        let worker_effects = stimuli::add_worker(&mut server.state, "w1", 2, "h1", HashMap::new(), HashMap::new(), Vec::new());
        server.enact(worker_effects);

        let mut a = NewTask::new("a");
        a.run_spec = Some(vec![1]);
        let mut b = NewTask::new("b");
        b.run_spec = Some(vec![2]);
        b.dependencies = vec!["a".to_string()];
        let effects = stimuli::update_graph(&mut server.state, "c1", vec![a, b], vec!["a".to_string(), "b".to_string()], None);
        server.enact(effects);

        let a_key = server.state.task_key("a").unwrap();
        assert_eq!(server.state.tasks[a_key].state, scheduler_core::TaskState::Processing);

        let effects = stimuli::task_finished(&mut server.state, "a", "w1", 10);
        server.enact(effects);

        let message = server.build_compute_task("b", 0.5).expect("b should resolve");
        match message {
            SchedulerToWorker::ComputeTask { dependencies, .. } => {
                assert_eq!(dependencies.len(), 1);
                assert_eq!(dependencies[0].0, "a");
                assert_eq!(dependencies[0].1, vec!["w1".to_string()]);
                assert_eq!(dependencies[0].2, 10);
            }
            other => panic!("expected ComputeTask, got {other:?}"),
        }
    }
}
