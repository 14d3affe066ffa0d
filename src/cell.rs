//! Cell identity and location types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a cell.
///
/// Assigned at creation and never changes, even as the cell moves inside the
/// document. A renamed marker is a different cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CellId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CellId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Offset and size of a cell inside the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    pub position: usize,
    pub extent: usize,
}

impl Location {
    pub fn new(position: usize, extent: usize) -> Self {
        Self { position, extent }
    }

    /// End offset (exclusive).
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.extent)
    }

    /// Whether `[start, end)` overlaps this location. Empty ranges touching
    /// the location count as overlapping, so inserts at a cell's edge re-run it.
    pub fn intersects(&self, start: usize, end: usize) -> bool {
        start <= self.end() && end >= self.position
    }
}

/// The value `here()` returns inside a cell: location plus identity.
///
/// Computed fresh on every evaluation and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationToken {
    pub position: usize,
    pub extent: usize,
    pub id: CellId,
}

impl LocationToken {
    pub fn new(id: CellId, location: Location) -> Self {
        Self {
            position: location.position,
            extent: location.extent,
            id,
        }
    }
}

/// Everything needed to mount a cell.
#[derive(Debug, Clone)]
pub struct CellSpec {
    pub id: CellId,
    pub source: String,
    /// Where the cell was when it was created; used until it resolves.
    pub location: Location,
}

impl CellSpec {
    pub fn new(id: impl Into<CellId>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            location: Location::default(),
        }
    }

    pub fn at(mut self, position: usize, extent: usize) -> Self {
        self.location = Location::new(position, extent);
        self
    }
}
