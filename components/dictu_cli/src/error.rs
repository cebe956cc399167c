//! Error types for the CLI

use core_types::{CompileError, RuntimeError};
use std::fmt;

/// CLI-specific errors, each mapping to a process exit code.
#[derive(Debug)]
pub enum CliError {
    /// The source did not compile (exit code 65)
    Compile(CompileError),

    /// Execution raised a runtime error (exit code 70)
    Runtime(RuntimeError),

    /// File I/O error (exit code 74)
    Io(std::io::Error),

    /// REPL editor error
    Repl(String),
}

impl CliError {
    /// The process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Compile(_) => 65,
            CliError::Runtime(_) => 70,
            CliError::Io(_) => 74,
            CliError::Repl(_) => 70,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Compile(e) => write!(f, "{}", e),
            CliError::Runtime(e) => write!(f, "{}", e),
            CliError::Io(e) => write!(f, "{}", e),
            CliError::Repl(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<core_types::InterpretError> for CliError {
    fn from(err: core_types::InterpretError) -> Self {
        match err {
            core_types::InterpretError::Compile(e) => CliError::Compile(e),
            core_types::InterpretError::Runtime(e) => CliError::Runtime(e),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io(err)
    }
}

/// Result type for CLI operations
pub type CliResult<T> = Result<T, CliError>;
