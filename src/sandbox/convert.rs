//! Normalizing interpreter outcomes into host results.
//!
//! Classification order: a thrown value becomes `Err`, a callable becomes a
//! [`DeferredAction`], anything else is deep-converted into JSON. Conversion
//! failures are reported as `Err` as well; nothing raised while converting
//! escapes to the caller.

use std::fmt;

use rquickjs::convert::Coerced;
use rquickjs::function::This;
use rquickjs::{CaughtError, Ctx, Exception, Function, Object, Type, Value};
use serde_json::{Map, Number, Value as Json};
use tokio::sync::{mpsc, oneshot};

use crate::cell::CellId;
use crate::error::{Result, SandboxError};
use crate::sandbox::session::Command;

/// What a cell evaluated to.
#[derive(Debug, Clone)]
pub enum CellOutput {
    /// A plain value, converted to JSON.
    Value(Json),
    /// A function. It is not called until the UI invokes it.
    Action(DeferredAction),
}

impl CellOutput {
    pub fn value(&self) -> Option<&Json> {
        match self {
            CellOutput::Value(v) => Some(v),
            CellOutput::Action(_) => None,
        }
    }

    pub fn action(&self) -> Option<&DeferredAction> {
        match self {
            CellOutput::Action(a) => Some(a),
            CellOutput::Value(_) => None,
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, CellOutput::Action(_))
    }
}

/// Outcome of one evaluation as handed to subscribers.
pub type ExecutionResult = Result<CellOutput>;

/// A callable returned by a cell.
///
/// Invoking it runs the function inside the session with `this` bound to the
/// global object. The action is released when its cell re-runs or is
/// disposed; invoking it afterwards fails with [`SandboxError::ActionReleased`].
#[derive(Clone)]
pub struct DeferredAction {
    id: u64,
    cell: Option<CellId>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl DeferredAction {
    pub(crate) fn new(id: u64, cell: Option<CellId>, commands: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self { id, cell, commands }
    }

    /// The cell that produced this action, `None` for session-scope code.
    pub fn cell(&self) -> Option<&CellId> {
        self.cell.as_ref()
    }

    /// Call the function.
    ///
    /// Returns once the call finished. A throw is returned as
    /// [`SandboxError::EvaluationThrew`] and also logged.
    pub async fn invoke(&self) -> Result<()> {
        let commands = self.commands.upgrade().ok_or(SandboxError::SessionClosed)?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Invoke {
                action: self.id,
                reply,
            })
            .map_err(|_| SandboxError::SessionClosed)?;
        rx.await.map_err(|_| SandboxError::SessionClosed)?
    }
}

impl fmt::Debug for DeferredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredAction")
            .field("id", &self.id)
            .field("cell", &self.cell)
            .finish()
    }
}

impl PartialEq for DeferredAction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Raw outcome of running code in the interpreter.
pub(crate) enum Outcome<'js> {
    Returned(Value<'js>),
    Threw(CaughtError<'js>),
}

/// A classified outcome, still bound to the interpreter.
pub(crate) enum Adapted<'js> {
    Value(Json),
    Callable(Function<'js>),
}

/// Classify `outcome`.
pub(crate) fn adapt<'js>(ctx: &Ctx<'js>, outcome: Outcome<'js>, max_depth: usize) -> Result<Adapted<'js>> {
    let value = match outcome {
        Outcome::Threw(caught) => return Err(error_from_caught(ctx, caught)),
        Outcome::Returned(value) => value,
    };
    if value.is_function() {
        if let Ok(function) = value.get::<Function>() {
            return Ok(Adapted::Callable(function));
        }
    }
    materialize(ctx, &value, max_depth)
        .map(Adapted::Value)
        .map_err(SandboxError::MaterializationFailed)
}

/// Returns the `then` method when `value` is a thenable.
pub(crate) fn thenable<'js>(value: &Value<'js>) -> Option<Function<'js>> {
    let object = value.as_object()?;
    if value.is_function() {
        return None;
    }
    object.get::<_, Option<Function>>("then").ok().flatten()
}

/// Convert a caught interpreter error.
pub(crate) fn error_from_caught<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>) -> SandboxError {
    match caught {
        CaughtError::Exception(exception) => error_from_value(ctx, exception.into_object().into_value()),
        CaughtError::Value(value) => error_from_value(ctx, value),
        CaughtError::Error(error) => SandboxError::threw("InternalError", error.to_string(), None),
    }
}

/// Convert any thrown or rejected value.
pub(crate) fn error_from_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> SandboxError {
    if let Some(object) = value.as_object() {
        if let Some(exception) = Exception::from_object(object.clone()) {
            let name = string_prop(ctx, object, "name").unwrap_or_else(|| "Error".to_string());
            let message = exception.message().unwrap_or_default();
            return SandboxError::threw(name, message, exception.stack());
        }
        // Error-like objects thrown by hand: `throw { message: "..." }`.
        if let Some(message) = string_prop(ctx, object, "message") {
            let name = string_prop(ctx, object, "name").unwrap_or_else(|| "Error".to_string());
            return SandboxError::threw(name, message, string_prop(ctx, object, "stack"));
        }
    }
    SandboxError::threw("Error", coerce_string(ctx, &value), None)
}

fn string_prop<'js>(ctx: &Ctx<'js>, object: &Object<'js>, key: &str) -> Option<String> {
    match object.get::<_, Option<String>>(key) {
        Ok(value) => value,
        Err(_) => {
            // A throwing getter or a non-string value; clear and ignore it.
            let _ = ctx.catch();
            None
        }
    }
}

/// String coercion that never fails.
pub(crate) fn coerce_string<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    match value.get::<Coerced<String>>() {
        Ok(Coerced(s)) => s,
        Err(_) => {
            let _ = ctx.catch();
            "[unprintable value]".to_string()
        }
    }
}

/// Deep-convert `value` into JSON. Top-level `undefined` becomes `null`.
pub(crate) fn materialize<'js>(ctx: &Ctx<'js>, value: &Value<'js>, max_depth: usize) -> std::result::Result<Json, String> {
    let converted = convert(ctx, value, 0, max_depth);
    if converted.is_err() {
        let _ = ctx.catch();
    }
    converted.map(|v| v.unwrap_or(Json::Null))
}

/// `Ok(None)` marks values JSON omits (undefined, functions, symbols).
fn convert<'js>(ctx: &Ctx<'js>, value: &Value<'js>, depth: usize, max_depth: usize) -> std::result::Result<Option<Json>, String> {
    if depth > max_depth {
        return Err(format!("value is nested deeper than {max_depth} levels"));
    }
    match value.type_of() {
        Type::Uninitialized | Type::Undefined | Type::Symbol | Type::Function | Type::Constructor => Ok(None),
        Type::Null => Ok(Some(Json::Null)),
        Type::Bool => Ok(Some(Json::Bool(value.as_bool().unwrap_or(false)))),
        Type::Int => Ok(Some(Json::from(value.as_int().unwrap_or(0)))),
        Type::Float => {
            let number = value.as_float().unwrap_or(f64::NAN);
            Number::from_f64(number)
                .map(|n| Some(Json::Number(n)))
                .ok_or_else(|| format!("{number} has no JSON representation"))
        }
        Type::String => value
            .as_string()
            .ok_or_else(|| "string value expected".to_string())?
            .to_string()
            .map(|s| Some(Json::String(s)))
            .map_err(|e| e.to_string()),
        Type::BigInt => Ok(Some(Json::String(coerce_string(ctx, value)))),
        Type::Array => {
            let array = value.as_array().ok_or_else(|| "array value expected".to_string())?;
            let mut items = Vec::with_capacity(array.len());
            for item in array.iter::<Value>() {
                let item = item.map_err(|e| e.to_string())?;
                items.push(convert(ctx, &item, depth + 1, max_depth)?.unwrap_or(Json::Null));
            }
            Ok(Some(Json::Array(items)))
        }
        _ => match value.as_object() {
            Some(object) => convert_object(ctx, object, depth, max_depth),
            None => Err(format!("unsupported value of type {:?}", value.type_of())),
        },
    }
}

fn convert_object<'js>(ctx: &Ctx<'js>, object: &Object<'js>, depth: usize, max_depth: usize) -> std::result::Result<Option<Json>, String> {
    let to_json = object
        .get::<_, Option<Function>>("toJSON")
        .map_err(|e| e.to_string())?;
    if let Some(to_json) = to_json {
        let replaced: Value = to_json
            .call((This(object.clone()),))
            .map_err(|e| e.to_string())?;
        return convert(ctx, &replaced, depth + 1, max_depth);
    }

    if let Some(exception) = Exception::from_object(object.clone()) {
        let mut map = Map::new();
        let name = string_prop(ctx, object, "name").unwrap_or_else(|| "Error".to_string());
        map.insert("name".to_string(), Json::String(name));
        map.insert(
            "message".to_string(),
            Json::String(exception.message().unwrap_or_default()),
        );
        return Ok(Some(Json::Object(map)));
    }

    let mut map = Map::new();
    for entry in object.props::<String, Value>() {
        let (key, item) = entry.map_err(|e| e.to_string())?;
        if let Some(item) = convert(ctx, &item, depth + 1, max_depth)? {
            map.insert(key, item);
        }
    }
    Ok(Some(Json::Object(map)))
}
