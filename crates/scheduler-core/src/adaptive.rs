// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Adaptive control loop (§4.7).
//!
//! Tracks three sets of worker tokens — `plan` (intended), `requested` (asked of
//! the external resource manager), `observed` (registered with the scheduler) —
//! and on each tick recommends holding steady, scaling up, or closing specific
//! workers. Scale-down has hysteresis: a worker must appear as a close candidate
//! for `wait_count` consecutive ticks before it is actually recommended for
//! closure, so a momentary dip in demand does not thrash the cluster.

use crate::error::Error;
use crate::store::SchedulerState;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// What a tick recommends the caller do.
#[derive(Debug, Clone, PartialEq)]
pub enum AdaptiveRecommendation {
    /// `target == |plan|`; nothing to do.
    Same,
    /// `target > |plan|`; ask the resource manager for `n` total workers.
    Up { n: usize },
    /// `target < |plan|`; these workers have been candidates for `wait_count`
    /// consecutive ticks and should now be closed.
    Down { workers: Vec<String> },
}

/// The three worker-token sets the control loop reasons over (§4.7).
#[derive(Debug, Default)]
pub struct AdaptiveState {
    pub plan: HashSet<String>,
    pub requested: HashSet<String>,
    pub observed: HashSet<String>,
    close_counters: HashMap<String, u32>,
}

impl AdaptiveState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn close_streak(&self, worker: &str) -> u32 {
        self.close_counters.get(worker).copied().unwrap_or(0)
    }
}

/// Estimates how many workers the current workload needs to clear in roughly
/// `target_duration_secs` of wall time, scaled by the average cores a connected
/// worker offers (§4.7 `user_target`). Zero occupancy or zero connected workers
/// yields zero: an idle cluster wants no workers until `minimum` raises it.
#[must_use]
pub fn desired_worker_count(scheduler: &SchedulerState, target_duration_secs: f64) -> usize {
    if target_duration_secs <= 0.0 || scheduler.total_occupancy <= 0.0 {
        return 0;
    }
    let connected = scheduler.connected_workers().count();
    let avg_cores = if connected == 0 {
        1.0
    } else {
        (scheduler.total_ncores as f64 / connected as f64).max(1.0)
    };
    (scheduler.total_occupancy / target_duration_secs / avg_cores).ceil() as usize
}

/// One control-loop tick (§4.7). `target` is the already-clamped desired worker
/// count; clamping against `minimum`/`maximum` is the caller's concern since it
/// depends on a user-supplied policy this crate does not own.
pub fn tick(adaptive: &mut AdaptiveState, scheduler: &SchedulerState, target: usize, wait_count: u32) -> AdaptiveRecommendation {
    let plan_len = adaptive.plan.len();

    if target == plan_len {
        adaptive.close_counters.clear();
        return AdaptiveRecommendation::Same;
    }

    if target > plan_len {
        adaptive.close_counters.clear();
        return AdaptiveRecommendation::Up { n: target };
    }

    let deficit = plan_len - target;
    let mut candidates: Vec<String> = adaptive.requested.difference(&adaptive.observed).cloned().collect();
    candidates.sort();

    if candidates.len() < deficit {
        let mut by_load: Vec<String> = adaptive
            .observed
            .iter()
            .filter(|addr| !candidates.contains(addr))
            .cloned()
            .collect();
        by_load.sort_by(|a, b| {
            let load_a = scheduler.worker_key(a).map_or(0.0, |k| scheduler.workers[k].occupancy);
            let load_b = scheduler.worker_key(b).map_or(0.0, |k| scheduler.workers[k].occupancy);
            load_a.partial_cmp(&load_b).unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.extend(by_load);
    }
    candidates.truncate(deficit);

    let candidate_set: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    for addr in &candidates {
        *adaptive.close_counters.entry(addr.clone()).or_insert(0) += 1;
    }
    adaptive.close_counters.retain(|addr, _| candidate_set.contains(addr.as_str()));

    let ready: Vec<String> = candidates
        .into_iter()
        .filter(|addr| adaptive.close_counters.get(addr).copied().unwrap_or(0) >= wait_count.max(1))
        .collect();

    AdaptiveRecommendation::Down { workers: ready }
}

/// Exponential-backoff guard around a single tick's call into the external
/// resource manager (§4.7, §7 `AdaptiveError`). Pure bookkeeping: it hands back
/// the delay to wait before the next attempt, or a terminal error once
/// `max_attempts` is exceeded; the caller's event loop owns the actual sleep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delay_min: Duration,
    delay_max: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(delay_min: Duration, delay_max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            delay_min,
            delay_max,
            max_attempts,
            attempts: 0,
        }
    }

    /// Call after a failed resource-manager request. Returns the delay to wait
    /// before retrying, or `Err` once the attempt budget is exhausted.
    pub fn record_failure(&mut self) -> Result<Duration, Error> {
        self.attempts += 1;
        if let Some(max) = self.max_attempts {
            if self.attempts > max {
                return Err(Error::AdaptiveError {
                    details: format!("resource manager call failed after {max} retries"),
                });
            }
        }
        let factor = 2u32.saturating_pow(self.attempts.saturating_sub(1));
        let delay = self.delay_min.saturating_mul(factor).min(self.delay_max);
        Ok(delay)
    }

    /// Call after a successful tick to reset the backoff.
    pub fn record_success(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_config::SchedulingConfig;

    #[test]
    fn scale_down_waits_for_consecutive_ticks() {
        let scheduler = SchedulerState::new(SchedulingConfig::default());
        let mut adaptive = AdaptiveState::new();
        for i in 0..4 {
            let addr = format!("w{i}");
            adaptive.plan.insert(addr.clone());
            adaptive.observed.insert(addr);
        }

        for tick_num in 1..3 {
            let rec = tick(&mut adaptive, &scheduler, 2, 3);
            assert_eq!(rec, AdaptiveRecommendation::Down { workers: Vec::new() }, "tick {tick_num}");
        }

        let rec = tick(&mut adaptive, &scheduler, 2, 3);
        match rec {
            AdaptiveRecommendation::Down { workers } => assert_eq!(workers.len(), 2),
            other => panic!("expected Down, got {other:?}"),
        }
    }

    #[test]
    fn same_or_up_clears_close_counters() {
        let scheduler = SchedulerState::new(SchedulingConfig::default());
        let mut adaptive = AdaptiveState::new();
        adaptive.plan.insert("w0".to_string());
        adaptive.observed.insert("w0".to_string());

        tick(&mut adaptive, &scheduler, 0, 3);
        tick(&mut adaptive, &scheduler, 0, 3);
        assert_eq!(adaptive.close_streak("w0"), 2);

        let rec = tick(&mut adaptive, &scheduler, 2, 3);
        assert_eq!(rec, AdaptiveRecommendation::Up { n: 2 });
        assert_eq!(adaptive.close_streak("w0"), 0);
    }

    #[test]
    fn retry_policy_stops_after_max_attempts() {
        let mut policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(30), Some(2));
        assert!(policy.record_failure().is_ok());
        assert!(policy.record_failure().is_ok());
        assert!(policy.record_failure().is_err());
    }
}
