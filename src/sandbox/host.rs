//! The interpreter thread.
//!
//! QuickJS values are `!Send`, so every session owns a dedicated thread
//! running a current-thread tokio runtime. The [`Host`] on that thread owns
//! the interpreter and processes [`Command`]s one at a time; timers post back
//! into the same loop, so sandboxed code only ever runs on this thread.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rquickjs::context::EvalOptions;
use rquickjs::function::{Opt, This};
use rquickjs::{CatchResultExt, Context, Ctx, Function, Persistent, Runtime, Value};
use tokio::sync::{mpsc, oneshot};

use crate::cell::CellId;
use crate::error::{Result, SandboxError};
use crate::sandbox::capabilities::{self, TimerId, TimerTable};
use crate::sandbox::config::SandboxConfig;
use crate::sandbox::convert::{self, Adapted, Outcome};
use crate::sandbox::deps::DependencyTracker;
use crate::sandbox::io::{LogLevel, LogSink};
use crate::sandbox::lifecycle::{release_all, Disposable, HandleId, Owner, Registration, ResourceRegistry, Scope};
use crate::sandbox::session::{Command, RawOutput, RawResult, SessionStats};

pub(crate) struct ActionEntry {
    function: Persistent<Function<'static>>,
    scope: Scope,
}

pub(crate) enum Settlement {
    Fulfilled(Persistent<Value<'static>>),
    Rejected(Persistent<Value<'static>>),
}

/// State shared between the host loop and the installed capabilities.
pub(crate) struct Env {
    pub(crate) config: SandboxConfig,
    pub(crate) sink: Arc<dyn LogSink>,
    pub(crate) deps: Arc<DependencyTracker>,
    pub(crate) timer_tx: mpsc::UnboundedSender<TimerId>,
    pub(crate) bindings: RefCell<Vec<&'static str>>,
    pub(crate) timers: RefCell<TimerTable>,
    scope: RefCell<Scope>,
    registry: RefCell<ResourceRegistry>,
    actions: RefCell<HashMap<u64, ActionEntry>>,
    awaiting: RefCell<HashSet<u64>>,
    settlements: RefCell<HashMap<u64, Settlement>>,
    next_id: Cell<u64>,
}

impl Env {
    fn new(
        config: SandboxConfig,
        sink: Arc<dyn LogSink>,
        deps: Arc<DependencyTracker>,
        timer_tx: mpsc::UnboundedSender<TimerId>,
    ) -> Self {
        Self {
            config,
            sink,
            deps,
            timer_tx,
            bindings: RefCell::new(Vec::new()),
            timers: RefCell::new(TimerTable::default()),
            scope: RefCell::new(Scope::session()),
            registry: RefCell::new(ResourceRegistry::new()),
            actions: RefCell::new(HashMap::new()),
            awaiting: RefCell::new(HashSet::new()),
            settlements: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    pub(crate) fn current_scope(&self) -> Scope {
        self.scope.borrow().clone()
    }

    /// Make `scope` current, returning the previous one.
    fn enter(&self, scope: Scope) -> Scope {
        self.scope.replace(scope)
    }

    /// Register a release for `scope`.
    ///
    /// `Ok(None)` means the scope was already superseded and the resource was
    /// released on the spot.
    pub(crate) fn track(&self, scope: &Scope, disposable: Disposable) -> Result<Option<HandleId>> {
        let registration = self.registry.borrow_mut().register(scope, disposable);
        match registration {
            Registration::Tracked(handle) => Ok(Some(handle)),
            Registration::Stale(mut disposable) => {
                disposable.release();
                Ok(None)
            }
            Registration::Closed(mut disposable) => {
                disposable.release();
                Err(SandboxError::SessionClosed)
            }
        }
    }

    /// Release one handle; a handle already released is ignored.
    fn release(&self, handle: HandleId) -> bool {
        let disposable = self.registry.borrow_mut().take(handle);
        match disposable {
            Some(mut disposable) => {
                disposable.release();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) {
        if self.timers.borrow_mut().cancel(id) {
            tracing::trace!(timer = id, "timer cancelled");
        }
    }

    /// Release a timer through its handle so the registry forgets it too.
    fn finish_timer(&self, id: TimerId) {
        let handle = self.timers.borrow().get(id).and_then(|t| t.handle);
        let released = handle.map(|h| self.release(h)).unwrap_or(false);
        if !released {
            self.cancel_timer(id);
        }
    }

    /// `clearTimeout`/`clearInterval`. Timers of other owners are left alone.
    pub(crate) fn clear_timer(&self, id: TimerId) {
        let scope = self.current_scope();
        let owned = match self.timers.borrow().get(id) {
            Some(timer) => timer.scope.owner == scope.owner,
            None => return,
        };
        if owned {
            self.finish_timer(id);
        } else {
            tracing::debug!(timer = id, "ignoring clear of a timer owned by another cell");
        }
    }

    pub(crate) fn mark_dependency(&self) {
        let scope = self.current_scope();
        if let Owner::Cell(cell) = &scope.owner {
            if self.registry.borrow().is_current(&scope) {
                self.deps.mark(cell, scope.generation);
            }
        }
    }

    fn store_action<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, function: Function<'js>, scope: &Scope) -> Result<u64> {
        let id = self.next_id();
        self.actions.borrow_mut().insert(
            id,
            ActionEntry {
                function: Persistent::save(ctx, function),
                scope: scope.clone(),
            },
        );
        let weak = Rc::downgrade(self);
        let release = Disposable::new(move || {
            if let Some(env) = weak.upgrade() {
                env.actions.borrow_mut().remove(&id);
            }
        });
        self.track(scope, release)?;
        Ok(id)
    }

    /// Run the result adapter and keep callables alive as actions.
    fn finish<'js>(self: &Rc<Self>, ctx: &Ctx<'js>, scope: &Scope, outcome: Outcome<'js>) -> RawResult {
        match convert::adapt(ctx, outcome, self.config.max_value_depth)? {
            Adapted::Value(value) => Ok(RawOutput::Value(value)),
            Adapted::Callable(function) => self.store_action(ctx, function, scope).map(RawOutput::Action),
        }
    }

    /// A cell evaluation completed; edges from earlier generations no longer apply.
    fn settled(&self, scope: &Scope) {
        if let Owner::Cell(cell) = &scope.owner {
            self.deps.settled(cell, scope.generation);
        }
    }

    fn report_uncaught(&self, scope: &Scope, error: &SandboxError) {
        tracing::warn!(owner = ?scope.owner, error = %error, "uncaught error in timer callback");
        self.sink.log(LogLevel::Error, scope.owner.cell(), &format!("Uncaught {error}"));
    }

    /// Drop every interpreter reference held on the host side.
    fn clear(&self) {
        let batch = self.registry.borrow_mut().take_all();
        release_all(batch);
        self.timers.borrow_mut().clear();
        self.actions.borrow_mut().clear();
        self.awaiting.borrow_mut().clear();
        self.settlements.borrow_mut().clear();
        self.deps.clear();
    }
}

/// Scripts run as sloppy-mode global code; a returned promise is adopted by
/// the host rather than by the evaluator.
fn script_options() -> EvalOptions {
    let mut options = EvalOptions::default();
    options.global = true;
    options.strict = false;
    options.promise = false;
    options
}

/// Build a promise reaction that records how evaluation `id` settled.
fn settle_fn<'js>(ctx: &Ctx<'js>, env: &Rc<Env>, id: u64, fulfilled: bool) -> rquickjs::Result<Function<'js>> {
    let env = Rc::downgrade(env);
    Function::new(ctx.clone(), move |ctx: Ctx<'js>, value: Opt<Value<'js>>| {
        let Some(env) = env.upgrade() else { return };
        if !env.awaiting.borrow().contains(&id) {
            return;
        }
        let value = value.0.unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        let value = Persistent::save(&ctx, value);
        let settlement = if fulfilled {
            Settlement::Fulfilled(value)
        } else {
            Settlement::Rejected(value)
        };
        env.settlements.borrow_mut().entry(id).or_insert(settlement);
    })
}

fn attach<'js>(ctx: &Ctx<'js>, env: &Rc<Env>, id: u64, thenable: Value<'js>, then: Function<'js>) -> rquickjs::Result<()> {
    let on_fulfilled = settle_fn(ctx, env, id, true)?;
    let on_rejected = settle_fn(ctx, env, id, false)?;
    then.call::<_, Value>((This(thenable), on_fulfilled, on_rejected))?;
    Ok(())
}

struct PendingEval {
    id: u64,
    scope: Scope,
    reply: oneshot::Sender<RawResult>,
}

enum Step {
    Settled(RawResult),
    Pending,
}

/// Owner of one interpreter. Field order matters: everything holding
/// interpreter values is dropped before the context and runtime.
pub(crate) struct Host {
    pending: Vec<PendingEval>,
    env: Rc<Env>,
    closing: Arc<AtomicBool>,
    evaluations: u64,
    context: Context,
    runtime: Runtime,
}

impl Host {
    pub(crate) fn new(
        config: SandboxConfig,
        sink: Arc<dyn LogSink>,
        deps: Arc<DependencyTracker>,
        closing: Arc<AtomicBool>,
        timer_tx: mpsc::UnboundedSender<TimerId>,
    ) -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to create runtime: {}", e)))?;
        runtime.set_memory_limit(config.max_memory);
        runtime.set_max_stack_size(config.max_stack_size);
        // Lets `dispose()` break out of a script stuck in a loop.
        let interrupt = closing.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.load(Ordering::Relaxed))));

        let context = Context::full(&runtime)
            .map_err(|e| SandboxError::RuntimeInit(anyhow::anyhow!("failed to create context: {}", e)))?;

        let env = Rc::new(Env::new(config, sink, deps, timer_tx));
        context
            .with(|ctx| capabilities::install(&ctx, &env))
            .map_err(|e| {
                SandboxError::RuntimeInit(anyhow::anyhow!("failed to install capabilities: {}", e))
            })?;

        Ok(Self {
            pending: Vec::new(),
            env,
            closing,
            evaluations: 0,
            context,
            runtime,
        })
    }

    /// Process commands until disposed or every handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut timers: mpsc::UnboundedReceiver<TimerId>,
    ) {
        tracing::debug!("sandbox session started");
        loop {
            tokio::select! {
                // Commands first: a disposal queued behind a due timer still wins.
                biased;
                command = commands.recv() => match command {
                    Some(Command::Dispose { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(id) = timers.recv() => self.fire_timer(id),
            }
        }
        tracing::debug!(evaluations = self.evaluations, "sandbox session stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Eval { scope, source, reply } => self.eval(scope, source, reply),
            Command::Invoke { action, reply } => {
                let result = self.invoke(action);
                let _ = reply.send(result);
            }
            Command::Supersede { cell, generation } => self.supersede(&cell, generation),
            Command::DisposeCell { cell, reply } => {
                self.dispose_cell(&cell);
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Dispose { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    /// Run `f` inside the interpreter with `scope` current.
    fn within<R>(&self, scope: &Scope, f: impl for<'js> FnOnce(Ctx<'js>) -> R) -> R {
        let previous = self.env.enter(scope.clone());
        let result = self.context.with(f);
        self.env.enter(previous);
        result
    }

    fn eval(&mut self, scope: Scope, source: String, reply: oneshot::Sender<RawResult>) {
        if !self.env.registry.borrow().is_current(&scope) {
            tracing::debug!(owner = ?scope.owner, generation = scope.generation, "skipping superseded evaluation");
            return;
        }
        self.evaluations += 1;
        let id = self.env.next_id();
        let env = self.env.clone();
        let step = self.within(&scope, |ctx| {
            let value = match ctx.eval_with_options::<Value, _>(source, script_options()).catch(&ctx) {
                Ok(value) => value,
                Err(caught) => return Step::Settled(env.finish(&ctx, &scope, Outcome::Threw(caught))),
            };
            match convert::thenable(&value) {
                Some(then) => {
                    env.awaiting.borrow_mut().insert(id);
                    match attach(&ctx, &env, id, value, then).catch(&ctx) {
                        Ok(()) => Step::Pending,
                        Err(caught) => {
                            env.awaiting.borrow_mut().remove(&id);
                            Step::Settled(env.finish(&ctx, &scope, Outcome::Threw(caught)))
                        }
                    }
                }
                None => Step::Settled(env.finish(&ctx, &scope, Outcome::Returned(value))),
            }
        });

        match step {
            Step::Settled(result) => {
                self.env.settled(&scope);
                let _ = reply.send(result);
            }
            Step::Pending => self.pending.push(PendingEval { id, scope: scope.clone(), reply }),
        }
        self.after_step(&scope);
    }

    fn invoke(&mut self, action: u64) -> Result<()> {
        let (function, scope) = {
            let actions = self.env.actions.borrow();
            let entry = actions.get(&action).ok_or(SandboxError::ActionReleased)?;
            (entry.function.clone(), entry.scope.clone())
        };
        let result = self.within(&scope, |ctx| {
            let function = function.restore(&ctx).catch(&ctx);
            let called = function.and_then(|f| f.call::<_, Value>((This(ctx.globals()),)).catch(&ctx));
            called
                .map(|_| ())
                .map_err(|caught| convert::error_from_caught(&ctx, caught))
        });
        if let Err(error) = &result {
            tracing::warn!(owner = ?scope.owner, error = %error, "deferred action threw");
        }
        self.after_step(&scope);
        result
    }

    fn fire_timer(&mut self, id: TimerId) {
        let fired = self.env.timers.borrow().get(id).map(|timer| {
            (
                timer.callback.clone(),
                timer.args.clone(),
                timer.scope.clone(),
                timer.repeat,
            )
        });
        // Cancelled after the tick was queued.
        let Some((callback, args, scope, repeat)) = fired else {
            return;
        };
        if !repeat {
            self.env.finish_timer(id);
        }

        let env = self.env.clone();
        self.within(&scope, |ctx| {
            let called = callback
                .restore(&ctx)
                .and_then(|callback| {
                    let args = args
                        .into_iter()
                        .map(|arg| arg.restore(&ctx))
                        .collect::<rquickjs::Result<Vec<_>>>()?;
                    capabilities::call_timer(&ctx, callback, args)
                })
                .catch(&ctx);
            if let Err(caught) = called {
                let error = convert::error_from_caught(&ctx, caught);
                env.report_uncaught(&scope, &error);
            }
        });
        self.after_step(&scope);
    }

    fn supersede(&mut self, cell: &CellId, generation: u64) {
        let batch = self.env.registry.borrow_mut().begin_generation(cell, generation);
        if !batch.is_empty() {
            tracing::debug!(cell = %cell, generation, released = batch.len(), "releasing resources of previous generation");
        }
        release_all(batch);
        // The dependency edge of the previous generation stays until this one settles.
        self.drop_pending(|p| p.scope.owner.cell() == Some(cell) && p.scope.generation < generation);
    }

    fn dispose_cell(&mut self, cell: &CellId) {
        let batch = self.env.registry.borrow_mut().take_cell(cell);
        tracing::debug!(cell = %cell, released = batch.len(), "disposing cell");
        release_all(batch);
        self.env.deps.reset(cell);
        self.drop_pending(|p| p.scope.owner.cell() == Some(cell));
    }

    /// Forget pending evaluations; their callers observe a dropped reply.
    fn drop_pending(&mut self, matches: impl Fn(&PendingEval) -> bool) {
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending).into_iter().partition(|p| matches(p));
        for pending in dropped {
            self.env.awaiting.borrow_mut().remove(&pending.id);
            self.env.settlements.borrow_mut().remove(&pending.id);
        }
        self.pending = kept;
    }

    /// Drain the job queue, then complete evaluations whose promise settled.
    fn after_step(&mut self, scope: &Scope) {
        let previous = self.env.enter(scope.clone());
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => tracing::warn!("promise job raised an exception"),
            }
        }
        self.env.enter(previous);
        self.settle_pending();
    }

    fn settle_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        for pending in std::mem::take(&mut self.pending) {
            let settlement = self.env.settlements.borrow_mut().remove(&pending.id);
            let Some(settlement) = settlement else {
                self.pending.push(pending);
                continue;
            };
            self.env.awaiting.borrow_mut().remove(&pending.id);
            let env = self.env.clone();
            let scope = pending.scope.clone();
            let result = self.within(&pending.scope, |ctx| match settlement {
                Settlement::Fulfilled(value) => match value.restore(&ctx) {
                    Ok(value) => env.finish(&ctx, &scope, Outcome::Returned(value)),
                    Err(e) => Err(SandboxError::MaterializationFailed(e.to_string())),
                },
                Settlement::Rejected(value) => match value.restore(&ctx) {
                    Ok(value) => Err(convert::error_from_value(&ctx, value)),
                    Err(e) => Err(SandboxError::MaterializationFailed(e.to_string())),
                },
            });
            self.env.settled(&pending.scope);
            let _ = pending.reply.send(result);
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            evaluations: self.evaluations,
            live_handles: self.env.registry.borrow().len(),
            timers: self.env.timers.borrow().len(),
            actions: self.env.actions.borrow().len(),
            pending: self.pending.len(),
        }
    }

    /// Release everything. Safe to call more than once.
    fn shutdown(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        self.pending.clear();
        self.env.clear();
        self.runtime.run_gc();
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}
