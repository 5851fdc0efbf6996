//! Registry of in-flight runs.
//!
//! Owned by the application root and passed to whatever needs to
//! enumerate active runs (shutdown handling, status display); there is no
//! process-wide singleton, which keeps lifetimes and test isolation
//! explicit.

use std::collections::HashMap;

use tracing::warn;

/// Active runs, keyed by run token.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: HashMap<String, String>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, run_token: &str, title: &str) {
        if self
            .runs
            .insert(run_token.to_string(), title.to_string())
            .is_some()
        {
            warn!(run_token, "run token registered twice");
        }
    }

    /// Returns whether the token was actually registered.
    pub fn deregister(&mut self, run_token: &str) -> bool {
        self.runs.remove(run_token).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Titles of all active runs.
    pub fn active(&self) -> Vec<&str> {
        self.runs.values().map(String::as_str).collect()
    }
}
