//! Reactive evaluation of the cells embedded in a document.
//!
//! Each trigger starts a new generation for the cell: the session releases
//! what earlier generations created, the cell's location is resolved against
//! the document, and the composed script is evaluated. A result is delivered
//! to subscribers only while its generation is still the cell's newest, so
//! overlapping triggers supersede each other instead of queueing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::cell::{CellId, CellSpec, Location, LocationToken};
use crate::document::{DocumentChange, DocumentView};
use crate::error::{Result, SandboxError};
use crate::position;
use crate::sandbox::capabilities::INTERNALS;
use crate::sandbox::convert::{DeferredAction, ExecutionResult};
use crate::sandbox::lifecycle::Scope;
use crate::sandbox::session::SandboxSession;

type Callback = Arc<dyn Fn(&ExecutionResult) + Send + Sync>;

#[derive(Debug, Clone)]
struct CellState {
    source: String,
    location: Location,
    generation: u64,
}

struct Subscriber {
    id: u64,
    cell: CellId,
    callback: Callback,
}

#[derive(Default)]
struct State {
    cells: HashMap<CellId, CellState>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    disposed: bool,
}

struct Inner {
    session: SandboxSession,
    document: Arc<dyn DocumentView>,
    state: Mutex<State>,
    generation: AtomicU64,
    runtime: Handle,
}

/// Keeps the cells of one document evaluated against one session.
#[derive(Clone)]
pub struct CellEvaluator {
    inner: Arc<Inner>,
}

/// Handle returned by [`CellEvaluator::subscribe`].
///
/// The callback stays registered until [`unsubscribe`](Self::unsubscribe)
/// is called; dropping the handle does not remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    cell: CellId,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn cell(&self) -> &CellId {
        &self.cell
    }

    /// Stop receiving results.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Ok(mut state) = inner.state.lock() {
                state.subscribers.retain(|s| s.id != self.id);
            }
        }
    }
}

/// Wrap `source` so `here()` returns the cell's location and signals the
/// dependency on document state on every call.
pub(crate) fn compose(token: &LocationToken, source: &str) -> Result<String> {
    let token = serde_json::to_string(token)
        .map_err(|e| SandboxError::MaterializationFailed(e.to_string()))?;
    Ok(format!(
        "{{\nconst here = () => {{\n  {INTERNALS}.listenToUpdate();\n  return {token};\n}};\n\n{source}\n}}"
    ))
}

impl CellEvaluator {
    /// Must be called from within a tokio runtime; evaluations are spawned on it.
    pub fn new(session: SandboxSession, document: Arc<dyn DocumentView>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("no tokio runtime: {}", e)))?;
        Ok(Self {
            inner: Arc::new(Inner {
                session,
                document,
                state: Mutex::new(State::default()),
                generation: AtomicU64::new(0),
                runtime,
            }),
        })
    }

    pub fn session(&self) -> &SandboxSession {
        &self.inner.session
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self
            .inner
            .state
            .lock()
            .map_err(|_| SandboxError::Config("evaluator state poisoned".to_string()))?;
        if state.disposed {
            return Err(SandboxError::SessionClosed);
        }
        Ok(state)
    }

    /// Add a cell and evaluate it.
    pub fn mount(&self, spec: CellSpec) -> Result<()> {
        {
            let mut state = self.state()?;
            if state.cells.contains_key(&spec.id) {
                return Err(SandboxError::DuplicateCell(spec.id.to_string()));
            }
            state.cells.insert(
                spec.id.clone(),
                CellState {
                    source: spec.source,
                    location: spec.location,
                    generation: 0,
                },
            );
        }
        tracing::debug!(cell = %spec.id, "cell mounted");
        self.trigger(&spec.id)
    }

    /// Replace a cell's code and re-run it.
    pub fn update_source(&self, id: &CellId, source: impl Into<String>) -> Result<()> {
        {
            let mut state = self.state()?;
            let cell = state
                .cells
                .get_mut(id)
                .ok_or_else(|| SandboxError::UnknownCell(id.to_string()))?;
            cell.source = source.into();
        }
        self.trigger(id)
    }

    /// Start a new evaluation of `id`, superseding any in flight.
    pub fn trigger(&self, id: &CellId) -> Result<()> {
        let (generation, source, last_known) = {
            let mut state = self.state()?;
            let cell = state
                .cells
                .get_mut(id)
                .ok_or_else(|| SandboxError::UnknownCell(id.to_string()))?;
            cell.generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            (cell.generation, cell.source.clone(), cell.location)
        };
        // Queued before the evaluation so older generations stop creating
        // resources right away.
        self.inner.session.supersede(id, generation);

        let evaluator = self.clone();
        let id = id.clone();
        self.inner.runtime.spawn(async move {
            evaluator.evaluate(id, generation, source, last_known).await;
        });
        Ok(())
    }

    async fn evaluate(&self, id: CellId, generation: u64, source: String, last_known: Location) {
        let (location, resolved) = position::resolve_or(self.inner.document.as_ref(), &id, last_known);
        if resolved {
            if let Ok(mut state) = self.inner.state.lock() {
                if let Some(cell) = state.cells.get_mut(&id).filter(|c| c.generation == generation) {
                    cell.location = location;
                }
            }
        }

        let token = LocationToken::new(id.clone(), location);
        let result = match compose(&token, &source) {
            Ok(script) => {
                self.inner
                    .session
                    .eval_scoped(Scope::cell(id.clone(), generation), script)
                    .await
            }
            Err(e) => Some(Err(e)),
        };
        match result {
            Some(result) => self.deliver(&id, generation, result),
            None => tracing::trace!(cell = %id, generation, "evaluation superseded"),
        }
    }

    fn deliver(&self, id: &CellId, generation: u64, result: ExecutionResult) {
        let callbacks: Vec<Callback> = {
            let Ok(state) = self.inner.state.lock() else {
                return;
            };
            let current = !state.disposed
                && state
                    .cells
                    .get(id)
                    .is_some_and(|cell| cell.generation == generation);
            if !current {
                tracing::trace!(cell = %id, generation, "discarding stale result");
                return;
            }
            state
                .subscribers
                .iter()
                .filter(|s| &s.cell == id)
                .map(|s| s.callback.clone())
                .collect()
        };
        match &result {
            Ok(_) => tracing::debug!(cell = %id, generation, "cell settled"),
            Err(e) => tracing::debug!(cell = %id, generation, error = %e, "cell failed"),
        }
        for callback in callbacks {
            callback(&result);
        }
    }

    /// Re-run the cells a document change affects: those whose last-known
    /// range intersects it, and those that depend on document state.
    pub fn document_changed(&self, change: &DocumentChange) {
        let affected: Vec<CellId> = match self.state() {
            Ok(state) => state
                .cells
                .iter()
                .filter(|(id, cell)| {
                    let touched = match &change.range {
                        None => true,
                        Some(range) => cell.location.intersects(range.start, range.end),
                    };
                    touched || self.inner.session.depends_on_document(id)
                })
                .map(|(id, _)| id.clone())
                .collect(),
            Err(_) => return,
        };
        for id in affected {
            if let Err(e) = self.trigger(&id) {
                tracing::debug!(cell = %id, error = %e, "re-run skipped");
            }
        }
    }

    /// Consume a document's mutation channel until it closes or the
    /// evaluator is dropped.
    pub fn follow(&self, mut changes: broadcast::Receiver<DocumentChange>) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "document changes lagged, re-running every cell");
                        DocumentChange::whole()
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else { break };
                CellEvaluator { inner }.document_changed(&change);
            }
        })
    }

    /// Receive every result delivered for `id`, including cells mounted later.
    pub fn subscribe(
        &self,
        id: &CellId,
        callback: impl Fn(&ExecutionResult) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let mut state = self.state()?;
        state.next_subscriber += 1;
        let subscriber = Subscriber {
            id: state.next_subscriber,
            cell: id.clone(),
            callback: Arc::new(callback),
        };
        let subscription = Subscription {
            id: subscriber.id,
            cell: id.clone(),
            inner: Arc::downgrade(&self.inner),
        };
        state.subscribers.push(subscriber);
        Ok(subscription)
    }

    /// Run a deferred action returned by a cell.
    pub async fn invoke(&self, action: &DeferredAction) -> Result<()> {
        self.inner.session.invoke(action).await
    }

    /// Remove a cell and release everything it created.
    pub async fn unmount(&self, id: &CellId) -> Result<()> {
        {
            let mut state = self.state()?;
            if state.cells.remove(id).is_none() {
                return Err(SandboxError::UnknownCell(id.to_string()));
            }
        }
        self.inner.session.dispose_cell(id).await;
        tracing::debug!(cell = %id, "cell unmounted");
        Ok(())
    }

    /// Dispose every cell, then the session.
    pub async fn dispose(&self) {
        let cells: Vec<CellId> = match self.inner.state.lock() {
            Ok(mut state) => {
                state.disposed = true;
                state.subscribers.clear();
                state.cells.drain().map(|(id, _)| id).collect()
            }
            Err(_) => Vec::new(),
        };
        for id in &cells {
            self.inner.session.dispose_cell(id).await;
        }
        self.inner.session.dispose().await;
    }

    /// Last-known location of a mounted cell.
    pub fn location(&self, id: &CellId) -> Option<Location> {
        self.state().ok()?.cells.get(id).map(|c| c.location)
    }

    /// Generation of the newest evaluation started for `id`.
    pub fn generation(&self, id: &CellId) -> Option<u64> {
        self.state().ok()?.cells.get(id).map(|c| c.generation)
    }

    pub fn cells(&self) -> Vec<CellId> {
        self.state()
            .map(|s| s.cells.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for CellEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellEvaluator")
            .field("cells", &self.cells().len())
            .field("session", &self.inner.session)
            .finish()
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::sandbox::config::SandboxConfig;

    #[test]
    fn test_compose_wraps_source() {
        let token = LocationToken::new(CellId::from("c1"), Location::new(4, 2));
        let script = compose(&token, "here().position").unwrap();
        assert!(script.starts_with("{\nconst here = () => {"));
        assert!(script.contains("_internals.listenToUpdate();"));
        assert!(script.contains(r#"return {"position":4,"extent":2,"id":"c1"};"#));
        assert!(script.ends_with("here().position\n}"));
    }

    #[tokio::test]
    async fn test_mount_rejects_duplicates() {
        let session = SandboxSession::create(SandboxConfig::default()).await.unwrap();
        let evaluator = CellEvaluator::new(session, Arc::new(Document::default())).unwrap();
        evaluator.mount(CellSpec::new("c1", "1")).unwrap();
        assert!(matches!(
            evaluator.mount(CellSpec::new("c1", "2")),
            Err(SandboxError::DuplicateCell(_))
        ));
        assert!(matches!(
            evaluator.trigger(&CellId::from("missing")),
            Err(SandboxError::UnknownCell(_))
        ));
        evaluator.dispose().await;
        assert!(evaluator.mount(CellSpec::new("c2", "1")).unwrap_err().is_session_closed());
    }

    #[tokio::test]
    async fn test_generations_increase() {
        let session = SandboxSession::create(SandboxConfig::default()).await.unwrap();
        let evaluator = CellEvaluator::new(session, Arc::new(Document::default())).unwrap();
        let id = CellId::from("c1");
        evaluator.mount(CellSpec::new("c1", "1").at(3, 4)).unwrap();
        let first = evaluator.generation(&id).unwrap();
        evaluator.trigger(&id).unwrap();
        assert!(evaluator.generation(&id).unwrap() > first);
        assert_eq!(evaluator.location(&id), Some(Location::new(3, 4)));
        evaluator.dispose().await;
    }
}
