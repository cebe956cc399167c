//! Runtime orchestration for Dictu execution
//!
//! The Runtime owns a persistent VM, so REPL inputs share globals, and
//! routes sources through compile-then-execute with optional bytecode
//! dumping.

use crate::error::{CliError, CliResult};
use core_types::Value;
use interpreter::Vm;
use memory_manager::Obj;

/// Coordinates the compiler and VM behind the CLI.
pub struct Runtime {
    /// Whether to print compiled bytecode before execution
    print_bytecode: bool,
    /// Persistent VM instance for maintaining state across inputs
    vm: Vm,
}

impl Runtime {
    /// Create a new runtime instance.
    pub fn new() -> Self {
        Self {
            print_bytecode: false,
            vm: Vm::new(),
        }
    }

    /// Enable bytecode printing.
    pub fn with_print_bytecode(mut self, enabled: bool) -> Self {
        self.print_bytecode = enabled;
        self
    }

    /// Switch the VM's REPL mode.
    pub fn set_repl(&mut self, repl: bool) {
        self.vm.set_repl(repl);
    }

    /// Execute a script file.
    pub fn execute_file(&mut self, path: &str) -> CliResult<Value> {
        let source = std::fs::read_to_string(path)?;
        self.execute_source(&source)
    }

    /// Execute a source string against the persistent VM.
    pub fn execute_source(&mut self, source: &str) -> CliResult<Value> {
        if self.print_bytecode {
            self.dump_bytecode(source)?;
        }

        self.vm.interpret(source).map_err(CliError::from)
    }

    fn dump_bytecode(&mut self, source: &str) -> CliResult<()> {
        // Compile separately so a dump never executes anything.
        let mut heap = memory_manager::Heap::new();
        let function = compiler::compile(&mut heap, source, false).map_err(CliError::Compile)?;

        if let Some(Obj::Function(f)) = heap.get(function) {
            print!("{}", bytecode_system::disassemble_chunk(&f.chunk, "<top>"));
        }
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
