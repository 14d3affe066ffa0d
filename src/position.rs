//! Locating a cell's marker inside the live document.

use crate::cell::{CellId, Location};
use crate::document::DocumentView;

/// Find the first text leaf marked with `cell`, in document order.
///
/// Returns `None` when the cell is not currently in the tree (deleted, or not
/// yet saved). Callers fall back to the cell's last-known location. Duplicate
/// markers are not detected.
pub fn resolve(document: &dyn DocumentView, cell: &CellId) -> Option<Location> {
    let mut found = None;
    document.for_each_text(&mut |leaf| {
        if leaf.markers.iter().any(|m| m == cell.as_str()) {
            found = Some(Location::new(leaf.offset, leaf.size));
            return false;
        }
        true
    });
    found
}

/// Resolve `cell`, or fall back to `last_known`.
///
/// The boolean is `true` when the location came from the document.
pub fn resolve_or(document: &dyn DocumentView, cell: &CellId, last_known: Location) -> (Location, bool) {
    match resolve(document, cell) {
        Some(location) => (location, true),
        None => {
            tracing::debug!(cell = %cell, ?last_known, "cell marker not in document, using last known location");
            (last_known, false)
        }
    }
}
