//! Tracking of native resources created on behalf of sandboxed code.
//!
//! Every timer or other resource a capability creates is registered here
//! against the scope that was running when it was created. Releasing is
//! at-most-once: whichever of an explicit clear, a cell disposal or a
//! superseding evaluation comes first runs the release, later ones are no-ops.
//!
//! The registry hands [`Disposable`]s back to the caller instead of running
//! them itself, so releases never run while the registry is borrowed.

use std::collections::HashMap;
use std::fmt;

use crate::cell::CellId;

/// Identifier of one registered resource.
pub type HandleId = u64;

/// Who a resource belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Code evaluated directly against the session.
    Session,
    Cell(CellId),
}

impl Owner {
    /// Get the owning cell, `None` for session scope.
    pub fn cell(&self) -> Option<&CellId> {
        match self {
            Owner::Session => None,
            Owner::Cell(id) => Some(id),
        }
    }
}

/// The owner and evaluation generation code is running under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub owner: Owner,
    pub generation: u64,
}

impl Scope {
    pub fn session() -> Self {
        Self {
            owner: Owner::Session,
            generation: 0,
        }
    }

    pub fn cell(id: CellId, generation: u64) -> Self {
        Self {
            owner: Owner::Cell(id),
            generation,
        }
    }
}

/// A pending release.
pub struct Disposable {
    release: Option<Box<dyn FnOnce()>>,
}

impl Disposable {
    pub fn new(release: impl FnOnce() + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Run the release. A second call does nothing.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Release every disposable in `batch`.
pub fn release_all(batch: Vec<Disposable>) {
    for mut disposable in batch {
        disposable.release();
    }
}

/// Outcome of [`ResourceRegistry::register`].
#[derive(Debug)]
pub enum Registration {
    /// The resource is tracked under this handle.
    Tracked(HandleId),
    /// The scope was superseded or disposed; release the resource now.
    Stale(Disposable),
    /// The registry was closed; release the resource now.
    Closed(Disposable),
}

#[derive(Debug, Default)]
struct OwnerEntry {
    /// Lowest generation still allowed to register.
    floor: u64,
    /// Highest generation seen.
    latest: u64,
    handles: Vec<HandleId>,
}

/// Per-session table of live resources, grouped by owner.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    next_id: HandleId,
    owners: HashMap<Owner, OwnerEntry>,
    handles: HashMap<HandleId, (Owner, Disposable)>,
    closed: bool,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start `generation` for a cell. Returns the resources of earlier
    /// generations, or nothing when `generation` is itself outdated.
    pub fn begin_generation(&mut self, cell: &CellId, generation: u64) -> Vec<Disposable> {
        let owner = Owner::Cell(cell.clone());
        let entry = self.owners.entry(owner).or_default();
        if generation < entry.floor || generation < entry.latest {
            return Vec::new();
        }
        entry.floor = generation;
        entry.latest = generation;
        let ids = std::mem::take(&mut entry.handles);
        self.take_ids(ids)
    }

    /// Whether code running under `scope` may still create resources.
    pub fn is_current(&self, scope: &Scope) -> bool {
        if self.closed {
            return false;
        }
        match self.owners.get(&scope.owner) {
            Some(entry) => scope.generation >= entry.floor,
            None => true,
        }
    }

    /// Track `disposable` for `scope`.
    pub fn register(&mut self, scope: &Scope, disposable: Disposable) -> Registration {
        if self.closed {
            return Registration::Closed(disposable);
        }
        if !self.is_current(scope) {
            return Registration::Stale(disposable);
        }
        self.next_id += 1;
        let id = self.next_id;
        let entry = self.owners.entry(scope.owner.clone()).or_default();
        entry.latest = entry.latest.max(scope.generation);
        entry.handles.push(id);
        self.handles.insert(id, (scope.owner.clone(), disposable));
        Registration::Tracked(id)
    }

    /// Remove one handle so the caller can release it.
    pub fn take(&mut self, id: HandleId) -> Option<Disposable> {
        let (owner, disposable) = self.handles.remove(&id)?;
        if let Some(entry) = self.owners.get_mut(&owner) {
            entry.handles.retain(|h| *h != id);
        }
        Some(disposable)
    }

    /// Remove every handle of a cell and refuse later registrations from the
    /// generations that ran so far.
    pub fn take_cell(&mut self, cell: &CellId) -> Vec<Disposable> {
        let Some(entry) = self.owners.get_mut(&Owner::Cell(cell.clone())) else {
            return Vec::new();
        };
        entry.floor = entry.latest + 1;
        entry.latest = entry.floor;
        let ids = std::mem::take(&mut entry.handles);
        self.take_ids(ids)
    }

    /// Close the registry and remove everything.
    pub fn take_all(&mut self) -> Vec<Disposable> {
        self.closed = true;
        self.owners.clear();
        let mut ids: Vec<HandleId> = self.handles.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.handles.remove(&id).map(|(_, d)| d))
            .collect()
    }

    /// Number of live handles owned by `owner`.
    pub fn count(&self, owner: &Owner) -> usize {
        self.owners.get(owner).map(|e| e.handles.len()).unwrap_or(0)
    }

    /// Total number of live handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn take_ids(&mut self, ids: Vec<HandleId>) -> Vec<Disposable> {
        ids.into_iter()
            .filter_map(|id| self.handles.remove(&id).map(|(_, d)| d))
            .collect()
    }
}
