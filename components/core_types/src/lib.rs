//! Core types for the Dictu runtime.
//!
//! Shared by every other component: the tagged `Value` discriminant, the
//! `ObjId` heap handle, and the compile/runtime error types.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod value;

pub use error::{
    CompileDiagnostic, CompileError, InterpretError, RuntimeError, StackTraceFrame,
};
pub use value::{format_number, ObjId, Value};
