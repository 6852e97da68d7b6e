// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the server crate: startup and peer-channel failures the core's own
//! error taxonomy (§7) deliberately never raises to the event loop.

use miette::Diagnostic;

/// Errors that can occur while running the scheduler's event loop.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid or inconsistent configuration; fatal at startup (§7 `ConfigurationError`).
    #[error("invalid configuration: {details}")]
    Configuration {
        /// Description of the invalid configuration.
        details: String,
    },

    /// Could not bind the worker/client comm listener.
    #[error("failed to bind {host}:{port}: {source}")]
    BindError {
        /// The host the listener attempted to bind.
        host: String,
        /// The port the listener attempted to bind.
        port: u16,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write or remove the `scheduler-file` identity file (§6 "Persisted state").
    #[error("identity file error at {path}: {source}")]
    IdentityFileError {
        /// Path of the identity file.
        path: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to load TLS certificate/key material.
    #[error("TLS configuration error: {details}")]
    TlsError {
        /// Description of the failure.
        details: String,
    },

    /// Failed to spawn an OS thread hosting the event loop.
    #[error("failed to spawn thread '{thread_name}': {source}")]
    ThreadSpawnError {
        /// Name of the thread we attempted to spawn.
        thread_name: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The event loop's dedicated thread panicked.
    #[error("event loop thread panicked: {panic_message}")]
    ThreadPanic {
        /// Panic message, if recoverable as a string.
        panic_message: String,
    },
}
