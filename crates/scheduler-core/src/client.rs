// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The client entity (§3).

use crate::key::TaskKey;
use std::collections::HashSet;

/// A connected client session (§3).
#[derive(Debug, Clone)]
pub struct Client {
    /// Stable external identifier.
    pub id: String,
    /// Tasks this client currently desires the result of.
    pub wants_what: HashSet<TaskKey>,
}

impl Client {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            wants_what: HashSet::new(),
        }
    }
}
