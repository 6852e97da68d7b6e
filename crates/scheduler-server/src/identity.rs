// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The optional `scheduler-file` identity file (§6 "Persisted state").
//!
//! Nothing about cluster state is ever persisted by the core; this is purely a
//! discovery aid so workers and clients launched without an explicit address can
//! find the scheduler by reading a well-known path.

use crate::error::Error;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// Contents written to the identity file on successful startup.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub address: String,
    pub id: String,
    pub services: HashMap<String, String>,
}

/// Writes the identity file, overwriting any stale one left by a prior run.
pub fn write(path: impl AsRef<Path>, identity: &Identity) -> Result<(), Error> {
    let path = path.as_ref();
    let contents = serde_json::to_string_pretty(identity).expect("Identity is always serializable");
    std::fs::write(path, contents).map_err(|source| Error::IdentityFileError {
        path: path.display().to_string(),
        source,
    })
}

/// Removes the identity file on graceful shutdown. Missing-file is not an error:
/// another process may already have cleaned it up.
pub fn remove(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::IdentityFileError {
            path: path.display().to_string(),
            source,
        }),
    }
}
