// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

use miette::Diagnostic;

/// Errors that can occur while loading or validating scheduler configuration.
///
/// These are fatal at startup (see `ConfigurationError` in the core error taxonomy):
/// a scheduler that cannot parse its configuration does not start.
#[derive(thiserror::Error, Debug, Diagnostic)]
pub enum Error {
    /// A collection of errors that occurred during validation.
    #[error("Invalid configuration: {errors:?}")]
    #[diagnostic(code(scheduler_config::invalid_configuration), url(docsrs))]
    InvalidConfiguration {
        /// The individual validation failures.
        #[related]
        errors: Vec<Error>,
    },

    /// The configuration file could not be read.
    #[error("Failed to read configuration file `{path}`: {details}")]
    #[diagnostic(code(scheduler_config::file_read_error), url(docsrs))]
    FileReadError {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error message.
        details: String,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration as {format}: {details}")]
    #[diagnostic(code(scheduler_config::deserialization_error), url(docsrs))]
    DeserializationError {
        /// Format that was attempted (`"TOML"`).
        format: String,
        /// Underlying parser error message.
        details: String,
    },

    /// A configuration value is out of its allowed range.
    #[error("Invalid value for `{key}`: {details}")]
    #[diagnostic(code(scheduler_config::invalid_value), url(docsrs))]
    InvalidValue {
        /// Dotted configuration key.
        key: String,
        /// Description of why the value is invalid.
        details: String,
    },
}
