//! The fixed capability table installed into every session.
//!
//! Sandboxed code sees the ECMAScript built-ins plus exactly the globals in
//! [`CAPABILITIES`]. Each is bound with `writable: false, configurable: false`
//! to a frozen value, so code can neither replace a capability for other cells
//! nor add new host entry points.

use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use rquickjs::convert::Coerced;
use rquickjs::function::{Opt, Rest, This};
use rquickjs::{Ctx, Exception, Function, Object, Persistent, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::sandbox::convert;
use crate::sandbox::date::{self, DateFormatOptions};
use crate::sandbox::host::Env;
use crate::sandbox::io::LogLevel;
use crate::sandbox::lifecycle::{Disposable, HandleId, Scope};

/// Globals installed by [`install`].
pub const CAPABILITIES: &[&str] = &[
    "console",
    "setTimeout",
    "setInterval",
    "clearTimeout",
    "clearInterval",
    "_internals",
];

/// Name of the internals object the composed cell wrapper calls into.
pub const INTERNALS: &str = "_internals";

/// Browsers cap timer delays at a signed 32-bit millisecond count.
const MAX_TIMER_MS: f64 = 2_147_483_647.0;

const DEFINE_GLOBAL: &str = "(function (name, value) {
  Object.defineProperty(globalThis, name, {
    value: Object.freeze(value),
    writable: false,
    enumerable: false,
    configurable: false,
  });
})";

pub type TimerId = u32;

pub(crate) struct TimerEntry {
    pub(crate) callback: Persistent<Function<'static>>,
    pub(crate) args: Vec<Persistent<Value<'static>>>,
    pub(crate) repeat: bool,
    pub(crate) scope: Scope,
    pub(crate) handle: Option<HandleId>,
    task: JoinHandle<()>,
}

/// Live timers of one session.
#[derive(Default)]
pub(crate) struct TimerTable {
    next_id: TimerId,
    entries: HashMap<TimerId, TimerEntry>,
}

impl TimerTable {
    fn allocate(&mut self) -> TimerId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.next_id
    }

    pub(crate) fn get(&self, id: TimerId) -> Option<&TimerEntry> {
        self.entries.get(&id)
    }

    fn get_mut(&mut self, id: TimerId) -> Option<&mut TimerEntry> {
        self.entries.get_mut(&id)
    }

    /// Remove a timer and stop its task.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.task.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Install the capability table. A second call is a no-op.
pub(crate) fn install<'js>(ctx: &Ctx<'js>, env: &Rc<Env>) -> rquickjs::Result<()> {
    if !env.bindings.borrow().is_empty() {
        return Ok(());
    }
    let define: Function = ctx.eval(DEFINE_GLOBAL)?;

    let console = Object::new(ctx.clone())?;
    for (name, level) in [
        ("log", LogLevel::Info),
        ("info", LogLevel::Info),
        ("debug", LogLevel::Debug),
        ("warn", LogLevel::Warn),
        ("error", LogLevel::Error),
    ] {
        console.set(name, console_method(ctx, env, level)?)?;
    }
    define.call::<_, ()>(("console", console))?;

    define.call::<_, ()>(("setTimeout", timer_creator(ctx, env, false)?))?;
    define.call::<_, ()>(("setInterval", timer_creator(ctx, env, true)?))?;
    define.call::<_, ()>(("clearTimeout", timer_clearer(ctx, env)?))?;
    define.call::<_, ()>(("clearInterval", timer_clearer(ctx, env)?))?;

    let internals = Object::new(ctx.clone())?;
    internals.set("formatDateTime", date_formatter(ctx)?)?;
    internals.set("listenToUpdate", dependency_signal(ctx, env)?)?;
    define.call::<_, ()>((INTERNALS, internals))?;

    env.bindings.borrow_mut().extend_from_slice(CAPABILITIES);
    tracing::debug!(bindings = ?CAPABILITIES, "capabilities installed");
    Ok(())
}

fn upgrade<'js>(ctx: &Ctx<'js>, env: &Weak<Env>) -> rquickjs::Result<Rc<Env>> {
    env.upgrade()
        .ok_or_else(|| Exception::throw_message(ctx, "sandbox session is closed"))
}

fn console_method<'js>(ctx: &Ctx<'js>, env: &Rc<Env>, level: LogLevel) -> rquickjs::Result<Function<'js>> {
    let env = Rc::downgrade(env);
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<()> {
            let env = upgrade(&ctx, &env)?;
            let message = args
                .0
                .iter()
                .map(|arg| describe(&ctx, arg))
                .collect::<Vec<_>>()
                .join(" ");
            let scope = env.current_scope();
            env.sink.log(level, scope.owner.cell(), &message);
            Ok(())
        },
    )
}

/// Render one console argument.
pub(crate) fn describe<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if let Some(s) = value.as_string() {
        if let Ok(s) = s.to_string() {
            return s;
        }
    }
    if let Some(object) = value.as_object() {
        let is_error = Exception::from_object(object.clone()).is_some();
        if !is_error && !value.is_function() {
            if let Ok(Some(json)) = ctx.json_stringify(value.clone()) {
                if let Ok(json) = json.to_string() {
                    return json;
                }
            }
            let _ = ctx.catch();
        }
    }
    convert::coerce_string(ctx, value)
}

fn timer_creator<'js>(ctx: &Ctx<'js>, env: &Rc<Env>, repeat: bool) -> rquickjs::Result<Function<'js>> {
    let env = Rc::downgrade(env);
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              callback: Value<'js>,
              delay: Opt<Value<'js>>,
              args: Rest<Value<'js>>|
              -> rquickjs::Result<TimerId> {
            let env = upgrade(&ctx, &env)?;
            create_timer(&ctx, &env, repeat, callback, delay.0, args.0)
        },
    )
}

fn timer_clearer<'js>(ctx: &Ctx<'js>, env: &Rc<Env>) -> rquickjs::Result<Function<'js>> {
    let env = Rc::downgrade(env);
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, id: Opt<Value<'js>>| -> rquickjs::Result<()> {
            let env = upgrade(&ctx, &env)?;
            let id = id.0.and_then(|v| v.as_number());
            if let Some(id) = id.filter(|n| n.fract() == 0.0 && *n >= 1.0 && *n <= TimerId::MAX as f64) {
                env.clear_timer(id as TimerId);
            }
            Ok(())
        },
    )
}

/// Delay a timer waits for. Repeating timers never go below `floor`.
pub(crate) fn timer_delay(ms: Option<f64>, repeat: bool, floor: Duration) -> Duration {
    let ms = ms
        .filter(|m| m.is_finite() && *m > 0.0)
        .unwrap_or(0.0)
        .min(MAX_TIMER_MS);
    let delay = Duration::from_nanos((ms * 1_000_000.0) as u64);
    if repeat {
        delay.max(floor)
    } else {
        delay
    }
}

fn create_timer<'js>(
    ctx: &Ctx<'js>,
    env: &Rc<Env>,
    repeat: bool,
    callback: Value<'js>,
    delay: Option<Value<'js>>,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<TimerId> {
    let Some(callback) = callback.as_function().cloned() else {
        return Err(Exception::throw_type(ctx, "timer callback must be a function"));
    };
    let delay = timer_delay(
        delay.and_then(|d| d.as_number()),
        repeat,
        env.config.min_timer_interval,
    );
    let scope = env.current_scope();

    let id = env.timers.borrow_mut().allocate();
    let task = spawn_ticker(env.timer_tx.clone(), id, delay, repeat);
    let entry = TimerEntry {
        callback: Persistent::save(ctx, callback),
        args: args.into_iter().map(|a| Persistent::save(ctx, a)).collect(),
        repeat,
        scope: scope.clone(),
        handle: None,
        task,
    };
    env.timers.borrow_mut().entries.insert(id, entry);

    let weak = Rc::downgrade(env);
    let cancel = Disposable::new(move || {
        if let Some(env) = weak.upgrade() {
            env.cancel_timer(id);
        }
    });
    match env.track(&scope, cancel) {
        Ok(Some(handle)) => {
            if let Some(entry) = env.timers.borrow_mut().get_mut(id) {
                entry.handle = Some(handle);
            }
        }
        Ok(None) => tracing::debug!(timer = id, "timer from a superseded evaluation cancelled"),
        Err(err) => return Err(Exception::throw_message(ctx, &err.to_string())),
    }
    tracing::trace!(timer = id, ?delay, repeat, "timer created");
    Ok(id)
}

/// The host side of a timer: posts `id` to the session loop when due.
fn spawn_ticker(tx: mpsc::UnboundedSender<TimerId>, id: TimerId, delay: Duration, repeat: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        if repeat {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, delay);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(id).is_err() {
                    break;
                }
            }
        } else {
            tokio::time::sleep(delay).await;
            let _ = tx.send(id);
        }
    })
}

fn date_formatter<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>,
              input: Coerced<String>,
              locale: Opt<Value<'js>>,
              options: Opt<Value<'js>>|
              -> rquickjs::Result<String> {
            let locale = locale
                .0
                .and_then(|v| v.as_string().and_then(|s| s.to_string().ok()));
            let options = match options.0 {
                Some(value) if value.is_object() => {
                    let json = convert::materialize(&ctx, &value, 4)
                        .map_err(|e| Exception::throw_type(&ctx, &e))?;
                    serde_json::from_value::<DateFormatOptions>(json).map_err(|e| {
                        Exception::throw_type(&ctx, &format!("invalid date format options: {e}"))
                    })?
                }
                _ => DateFormatOptions::default(),
            };
            date::format_date_time(&input.0, locale.as_deref(), &options)
                .map_err(|e| Exception::throw_range(&ctx, &e.to_string()))
        },
    )
}

fn dependency_signal<'js>(ctx: &Ctx<'js>, env: &Rc<Env>) -> rquickjs::Result<Function<'js>> {
    let env = Rc::downgrade(env);
    Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<()> {
        let env = upgrade(&ctx, &env)?;
        env.mark_dependency();
        Ok(())
    })
}

/// Call a timer callback with `this` bound to the global object.
pub(crate) fn call_timer<'js>(ctx: &Ctx<'js>, callback: Function<'js>, args: Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> {
    callback.call((This(ctx.globals()), Rest(args)))
}
