//! Prelude module for convenient imports.

pub use crate::cell::{CellId, CellSpec, Location};
pub use crate::document::{Document, DocumentChange, Node};
pub use crate::error::{Result, SandboxError};
pub use crate::evaluator::CellEvaluator;
pub use crate::sandbox::{
    config::SandboxConfig,
    convert::{CellOutput, DeferredAction, ExecutionResult},
    session::SandboxSession,
};
