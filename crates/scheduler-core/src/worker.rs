// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The worker entity (§3).

use crate::key::TaskKey;
use std::collections::{HashMap, HashSet};

/// Connection lifecycle of a worker (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Connected,
    Closing,
    Closed,
}

/// Occupancy classification maintained by the occupancy tracker (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccupancyClass {
    Idle,
    Saturated,
    Neither,
}

/// A registered worker process (§3).
#[derive(Debug, Clone)]
pub struct Worker {
    /// Stable external identifier (comm address).
    pub address: String,
    pub ncores: usize,
    pub memory_limit: Option<u64>,
    pub host: String,
    pub name: String,
    /// Auxiliary service addresses, e.g. the worker's nanny.
    pub services: HashMap<String, String>,
    /// Tasks currently processing on this worker, with their estimated duration
    /// contribution to `occupancy`.
    pub processing: HashMap<TaskKey, f64>,
    /// Tasks whose result this worker holds in memory.
    pub has_what: HashSet<TaskKey>,
    /// Sum of `nbytes` for `has_what`.
    pub nbytes: u64,
    pub resources: HashMap<String, f64>,
    pub used_resources: HashMap<String, f64>,
    /// Sum of `processing` duration estimates; the key driver of placement.
    pub occupancy: f64,
    pub status: WorkerStatus,
}

impl Worker {
    /// Registers a new, empty worker.
    #[must_use]
    pub fn new(address: impl Into<String>, ncores: usize, host: impl Into<String>) -> Self {
        let address = address.into();
        let name = address.clone();
        Self {
            address,
            ncores,
            memory_limit: None,
            host: host.into(),
            name,
            services: HashMap::new(),
            processing: HashMap::new(),
            has_what: HashSet::new(),
            nbytes: 0,
            resources: HashMap::new(),
            used_resources: HashMap::new(),
            occupancy: 0.0,
            status: WorkerStatus::Connected,
        }
    }

    /// Whether `resource: quantity` is available after accounting for what's already used.
    #[must_use]
    pub fn has_resource(&self, resource: &str, quantity: f64) -> bool {
        let total = self.resources.get(resource).copied().unwrap_or(0.0);
        let used = self.used_resources.get(resource).copied().unwrap_or(0.0);
        total - used >= quantity
    }
}
