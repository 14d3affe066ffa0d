//! Explicit dependency edges raised by `_internals.listenToUpdate()`.
//!
//! A cell whose current generation called the signal (usually through
//! `here()`) depends on document state and re-runs on every document change.
//! An edge survives until a later generation settles without asking for it
//! again, so a re-run in flight still reacts to document changes.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::cell::CellId;

#[derive(Debug, Default)]
pub struct DependencyTracker {
    /// Newest generation of each cell that raised the signal.
    dependents: Mutex<HashMap<CellId, u64>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `generation` of `cell` read document state.
    pub fn mark(&self, cell: &CellId, generation: u64) {
        if let Ok(mut dependents) = self.dependents.lock() {
            let marked = dependents.entry(cell.clone()).or_insert(generation);
            if *marked < generation {
                *marked = generation;
            }
            tracing::trace!(cell = %cell, generation, "document dependency recorded");
        }
    }

    /// Check if `cell` re-runs on every document change.
    pub fn depends_on_document(&self, cell: &CellId) -> bool {
        self.dependents
            .lock()
            .map(|d| d.contains_key(cell))
            .unwrap_or(false)
    }

    /// `generation` of `cell` completed: drop an edge raised only by older ones.
    pub fn settled(&self, cell: &CellId, generation: u64) {
        if let Ok(mut dependents) = self.dependents.lock() {
            if dependents.get(cell).is_some_and(|marked| *marked < generation) {
                dependents.remove(cell);
            }
        }
    }

    /// Drop the edge for `cell` (disposal).
    pub fn reset(&self, cell: &CellId) {
        if let Ok(mut dependents) = self.dependents.lock() {
            dependents.remove(cell);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut dependents) = self.dependents.lock() {
            dependents.clear();
        }
    }
}
