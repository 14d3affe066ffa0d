//! The public handle to one sandbox session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};

use crate::cell::CellId;
use crate::error::{Result, SandboxError};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::convert::{CellOutput, DeferredAction, ExecutionResult};
use crate::sandbox::deps::DependencyTracker;
use crate::sandbox::host::Host;
use crate::sandbox::io::{LogSink, TracingSink};
use crate::sandbox::lifecycle::Scope;

/// Output of the interpreter thread before actions are bound to a handle.
pub(crate) enum RawOutput {
    Value(Json),
    Action(u64),
}

pub(crate) type RawResult = Result<RawOutput>;

/// Requests processed by the interpreter thread.
pub(crate) enum Command {
    Eval {
        scope: Scope,
        source: String,
        reply: oneshot::Sender<RawResult>,
    },
    Invoke {
        action: u64,
        reply: oneshot::Sender<Result<()>>,
    },
    Supersede {
        cell: CellId,
        generation: u64,
    },
    DisposeCell {
        cell: CellId,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
}

/// Snapshot of the resources a session holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Evaluations run since the session started.
    pub evaluations: u64,
    /// Resources registered against a scope and not yet released.
    pub live_handles: usize,
    /// Timers scheduled and not yet fired, cleared or released.
    pub timers: usize,
    /// Deferred actions still invokable.
    pub actions: usize,
    /// Evaluations waiting on a promise.
    pub pending: usize,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    closing: Arc<AtomicBool>,
    deps: Arc<DependencyTracker>,
}

/// An isolated interpreter shared by the cells of one document.
///
/// Cheap to clone; every clone talks to the same interpreter thread. The
/// thread stops when [`dispose`](Self::dispose) is called or the last clone
/// is dropped.
///
/// ```rust,ignore
/// let session = SandboxSession::create(SandboxConfig::default()).await?;
/// let out = session.eval_async("[1, 2].map(x => x * 2)").await?;
/// assert_eq!(out.value(), Some(&serde_json::json!([2, 4])));
/// session.dispose().await;
/// ```
#[derive(Clone)]
pub struct SandboxSession {
    inner: Arc<Inner>,
}

impl SandboxSession {
    /// Start a session whose console output goes to `tracing`.
    pub async fn create(config: SandboxConfig) -> Result<Self> {
        Self::with_sink(config, Arc::new(TracingSink)).await
    }

    /// Start a session with a custom console sink.
    pub async fn with_sink(config: SandboxConfig, sink: Arc<dyn LogSink>) -> Result<Self> {
        config.validate()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let deps = Arc::new(DependencyTracker::new());

        let thread_closing = closing.clone();
        let thread_deps = deps.clone();
        std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SandboxError::RuntimeInit(e.into())));
                        return;
                    }
                };
                runtime.block_on(async move {
                    match Host::new(config, sink, thread_deps, thread_closing, timer_tx) {
                        Ok(host) => {
                            let _ = ready_tx.send(Ok(()));
                            host.run(command_rx, timer_rx).await;
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                });
            })
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to spawn sandbox thread: {}", e)))?;

        ready_rx.await.map_err(|_| {
            SandboxError::RuntimeInit(anyhow::anyhow!("sandbox thread exited during startup"))
        })??;

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                closing,
                deps,
            }),
        })
    }

    /// Evaluate `source` at session scope.
    ///
    /// Resources created here belong to the session and live until it is
    /// disposed. A returned promise is awaited.
    pub async fn eval_async(&self, source: &str) -> ExecutionResult {
        self.eval_scoped(Scope::session(), source.to_string())
            .await
            .unwrap_or(Err(SandboxError::SessionClosed))
    }

    /// Evaluate under `scope`. `None` means the evaluation was superseded
    /// before it completed and produced no result.
    pub(crate) async fn eval_scoped(&self, scope: Scope, source: String) -> Option<ExecutionResult> {
        if self.is_closed() {
            return Some(Err(SandboxError::SessionClosed));
        }
        let cell = scope.owner.cell().cloned();
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .commands
            .send(Command::Eval { scope, source, reply })
            .is_err()
        {
            return Some(Err(SandboxError::SessionClosed));
        }
        match rx.await {
            Ok(result) => Some(result.map(|raw| self.bind(raw, cell))),
            Err(_) if self.is_closed() => Some(Err(SandboxError::SessionClosed)),
            Err(_) => None,
        }
    }

    fn bind(&self, raw: RawOutput, cell: Option<CellId>) -> CellOutput {
        match raw {
            RawOutput::Value(value) => CellOutput::Value(value),
            RawOutput::Action(id) => {
                CellOutput::Action(DeferredAction::new(id, cell, self.inner.commands.downgrade()))
            }
        }
    }

    /// Start `generation` for `cell`, releasing what earlier generations
    /// created. Later registrations from older generations are refused.
    pub fn supersede(&self, cell: &CellId, generation: u64) {
        let _ = self.inner.commands.send(Command::Supersede {
            cell: cell.clone(),
            generation,
        });
    }

    /// Release everything `cell` created. Waits until the release ran.
    pub async fn dispose_cell(&self, cell: &CellId) {
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .commands
            .send(Command::DisposeCell {
                cell: cell.clone(),
                reply,
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Call a deferred action.
    pub async fn invoke(&self, action: &DeferredAction) -> Result<()> {
        action.invoke().await
    }

    /// Whether `cell`'s current generation asked to re-run on document changes.
    pub fn depends_on_document(&self, cell: &CellId) -> bool {
        self.inner.deps.depends_on_document(cell)
    }

    /// Get a snapshot of the resources the session holds.
    pub async fn stats(&self) -> Result<SessionStats> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Stats { reply })
            .map_err(|_| SandboxError::SessionClosed)?;
        rx.await.map_err(|_| SandboxError::SessionClosed)
    }

    /// Check if the session was disposed or its thread stopped.
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst) || self.inner.commands.is_closed()
    }

    /// Release every resource and stop the interpreter.
    ///
    /// Interrupts a script that is still running. Safe to call more than
    /// once; evaluations requested afterwards fail with
    /// [`SandboxError::SessionClosed`].
    pub async fn dispose(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            tracing::trace!("sandbox session already disposed");
        }
        let (reply, rx) = oneshot::channel();
        if self.inner.commands.send(Command::Dispose { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("closed", &self.is_closed())
            .finish()
    }
}
