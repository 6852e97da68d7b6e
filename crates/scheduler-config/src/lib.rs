// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Scheduler configuration.
//!
//! The scheduler reads its configuration once, at construction time, and treats it
//! as an immutable snapshot for the remainder of the process lifetime. Changing a
//! configuration key requires building a new scheduler.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod byte_units;
pub mod error;

use error::Error;

/// Top-level scheduler configuration, as read from a TOML file or environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind the worker/client comm listener to.
    pub host: String,
    /// Port to bind the worker/client comm listener to. `0` picks an ephemeral port.
    pub port: u16,
    /// Optional path of a JSON identity file written on start and removed on shutdown.
    pub scheduler_file: Option<String>,
    /// Placement, occupancy, and failure-handling knobs.
    pub scheduling: SchedulingConfig,
    /// Adaptive scaling control loop knobs.
    pub adaptive: AdaptiveConfig,
    /// Diagnostic and transition log retention.
    pub admin: AdminConfig,
    /// Peer-channel batching knobs.
    pub comm: CommConfig,
    /// TLS material for worker/client comm channels.
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8786,
            scheduler_file: None,
            scheduling: SchedulingConfig::default(),
            adaptive: AdaptiveConfig::default(),
            admin: AdminConfig::default(),
            comm: CommConfig::default(),
            tls: None,
        }
    }
}

/// Placement and failure-handling configuration (§6, §4.2, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Assumed network bandwidth in bytes/s, used purely for placement ranking.
    pub bandwidth: f64,
    /// Number of task failures tolerated before a task is poisoned (`KilledWorker`).
    pub allowed_failures: u32,
    /// Number of entries retained in the bounded transition-log ring buffer.
    pub transition_log_length: usize,
    /// Whether the work-stealing extension is enabled.
    pub work_stealing: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            bandwidth: 100.0 * 1_000_000.0,
            allowed_failures: 3,
            transition_log_length: 100_000,
            work_stealing: true,
        }
    }
}

/// Adaptive scaling control loop configuration (§4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Consecutive ticks an idle worker must be nominated before it is actually closed.
    pub wait_count: u32,
    /// Number of retries for a single resource-manager tick before giving up.
    #[serde(with = "humantime_serde::option", default)]
    pub retry_count: Option<u32>,
    /// Minimum backoff delay between retries.
    #[serde(with = "humantime_serde")]
    pub retry_delay_min: Duration,
    /// Maximum backoff delay between retries.
    #[serde(with = "humantime_serde")]
    pub retry_delay_max: Duration,
    /// Interval between adaptive ticks.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Floor on the worker count a tick will ever recommend (§4.7 `clamp`).
    pub minimum: usize,
    /// Ceiling on the worker count a tick will ever recommend; `None` is unbounded.
    pub maximum: Option<usize>,
    /// Target per-task wall time a tick sizes the cluster against: desired worker
    /// count is `total_occupancy / target_duration`, scaled by cores per worker.
    #[serde(with = "humantime_serde")]
    pub target_duration: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            wait_count: 3,
            retry_count: Some(5),
            retry_delay_min: Duration::from_millis(500),
            retry_delay_max: Duration::from_secs(30),
            interval: Duration::from_secs(1),
            minimum: 0,
            maximum: None,
            target_duration: Duration::from_secs(5),
        }
    }
}

/// Diagnostic log and transition log retention (`admin.*`, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Size of the general diagnostic event log.
    pub log_length: usize,
    /// Size of the low-level (per-message) admin log.
    pub low_level_log_length: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            log_length: 10_000,
            low_level_log_length: 1_000,
        }
    }
}

/// Peer-channel batching configuration (§5, "Batched send contract").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Offload (de)serialization of messages above `offload_threshold` bytes to a worker
    /// thread pool. `None` disables offloading.
    pub offload: Option<OffloadConfig>,
    /// Number of recent messages retained per peer for diagnostics.
    pub recent_messages_log_length: usize,
    /// Batching interval: a peer's outgoing queue is flushed at most this often.
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            offload: None,
            recent_messages_log_length: 1_000,
            batch_interval: Duration::from_millis(2),
        }
    }
}

/// Thresholds for offloading message (de)serialization off the event loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Messages at or above this size (bytes) are serialized on a worker thread.
    pub threshold_bytes: u64,
}

/// TLS configuration for the worker/client comm listener (`--tls-*` CLI flags, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain.
    pub cert: String,
    /// Path to the PEM private key.
    pub key: String,
    /// Path to a CA bundle used to verify peer certificates, if mutual TLS is required.
    pub ca_file: Option<String>,
}

impl Config {
    /// Loads configuration from a TOML file on disk, falling back to defaults for any
    /// field the file omits.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::FileReadError {
            path: path.display().to_string(),
            details: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(contents).map_err(|e| Error::DeserializationError {
            format: "TOML".to_string(),
            details: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();

        if self.scheduling.bandwidth <= 0.0 {
            errors.push(Error::InvalidValue {
                key: "scheduling.bandwidth".to_string(),
                details: "must be positive".to_string(),
            });
        }
        if self.adaptive.retry_delay_min > self.adaptive.retry_delay_max {
            errors.push(Error::InvalidValue {
                key: "adaptive.retry_delay_min".to_string(),
                details: "must be <= adaptive.retry_delay_max".to_string(),
            });
        }
        if self.adaptive.wait_count == 0 {
            errors.push(Error::InvalidValue {
                key: "adaptive.wait_count".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        if let Some(maximum) = self.adaptive.maximum {
            if self.adaptive.minimum > maximum {
                errors.push(Error::InvalidValue {
                    key: "adaptive.minimum".to_string(),
                    details: "must be <= adaptive.maximum".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfiguration { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            port = 8000

            [scheduling]
            allowed_failures = 5
            "#,
        )
        .expect("should parse");
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.scheduling.allowed_failures, 5);
        assert_eq!(cfg.scheduling.bandwidth, SchedulingConfig::default().bandwidth);
    }

    #[test]
    fn rejects_non_positive_bandwidth() {
        let err = Config::from_toml_str("[scheduling]\nbandwidth = 0.0\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
    }

    #[test]
    fn rejects_inverted_retry_bounds() {
        let err = Config::from_toml_str(
            r#"
            [adaptive]
            retry_delay_min = "30s"
            retry_delay_max = "1s"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration { .. }));
    }
}
