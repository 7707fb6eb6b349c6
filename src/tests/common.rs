//! Common helpers for tests.
//!
//! This module contains:
//! - `TestError`: Errors returned by failing bodies
//! - `Counters`: Per-identity execution counts
//! - Store constructors for in-memory and file-backed runs

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{InMemoryLogStore, Recall};

// ============================================================================
// Error Type
// ============================================================================

/// Errors returned by test bodies.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum TestError {
    /// The input was rejected.
    #[error("bad input: {0}")]
    BadInput(i64),

    /// A simulated resource failure.
    #[error("disk full")]
    DiskFull,
}

// ============================================================================
// Counters
// ============================================================================

/// Counts how many times each body actually ran.
#[derive(Clone, Default, Debug)]
pub struct Counters(Arc<Mutex<HashMap<String, usize>>>);

impl Counters {
    /// Record one execution of `name`.
    pub fn hit(&self, name: &str) {
        *self.0.lock().entry(name.to_string()).or_default() += 1;
    }

    /// Executions of `name` so far.
    pub fn get(&self, name: &str) -> usize {
        self.0.lock().get(name).copied().unwrap_or(0)
    }
}

// ============================================================================
// Stores
// ============================================================================

/// A [`Recall`] over a fresh in-memory store, plus the store for inspection.
pub fn memory() -> (Recall, Arc<InMemoryLogStore>) {
    let store = Arc::new(InMemoryLogStore::new());
    (Recall::with_store(store.clone()), store)
}
