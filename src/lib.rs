//! # Cellbox
//!
//! A sandboxed runtime for code cells embedded in a document.
//!
//! Every document gets one [`SandboxSession`]: an isolated JavaScript
//! interpreter (QuickJS) that sees only the ECMAScript built-ins plus a fixed
//! capability table. A [`CellEvaluator`] keeps each cell evaluated against
//! that session and re-runs it as the document changes:
//!
//! - **Fixed capabilities**: `console`, timers, date formatting and the
//!   `here()` location accessor; no module loader, filesystem or network
//! - **Per-cell resources**: timers and returned actions are released when
//!   the cell re-runs or is removed, without touching other cells
//! - **Superseding evaluation**: a newer run of a cell discards the result of
//!   any older run still in flight
//! - **Contained failures**: anything the code throws becomes the `Err` arm
//!   of the cell's [`ExecutionResult`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use cellbox::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let document = Arc::new(Document::new(vec![Node::element(
//!         "code_block",
//!         vec![Node::cell("c1", "1 + 1")],
//!     )]));
//!     let session = SandboxSession::create(SandboxConfig::default()).await?;
//!     let evaluator = CellEvaluator::new(session, document.clone())?;
//!
//!     evaluator.subscribe(&CellId::from("c1"), |result| {
//!         println!("c1 = {:?}", result);
//!     })?;
//!     evaluator.mount(CellSpec::new("c1", "1 + 1"))?;
//!     evaluator.follow(document.subscribe());
//!
//!     evaluator.dispose().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Threading
//!
//! Interpreter values cannot cross threads, so each session runs on its own
//! thread with a single-threaded tokio runtime. [`SandboxSession`] is a
//! cloneable handle that forwards requests to that thread; it can be used
//! from any task.

pub mod cell;
pub mod document;
pub mod error;
pub mod evaluator;
pub mod position;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use cell::{CellId, CellSpec, Location, LocationToken};
pub use document::{Document, DocumentChange, DocumentView, Node, TextLeaf};
pub use error::{Result, SandboxError};
pub use evaluator::{CellEvaluator, Subscription};
pub use sandbox::config::{SandboxConfig, SandboxConfigBuilder};
pub use sandbox::convert::{CellOutput, DeferredAction, ExecutionResult};
pub use sandbox::io::{CapturedLog, LogLevel, LogLine, LogSink, TracingSink};
pub use sandbox::session::{SandboxSession, SessionStats};
