//! Sandbox module: the interpreter session and everything installed into it.

pub mod capabilities;
pub mod config;
pub mod convert;
pub mod date;
pub mod deps;
pub(crate) mod host;
pub mod io;
pub mod lifecycle;
pub mod session;
