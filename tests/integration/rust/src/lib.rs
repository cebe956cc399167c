//! Shared helpers for the integration test suites.

use core_types::Value;
use interpreter::Vm;

/// Execute a Dictu source snippet in a fresh VM.
pub fn execute(source: &str) -> Result<Value, String> {
    let mut vm = Vm::new();
    vm.interpret(source).map_err(|e| e.to_string())
}

/// Execute a snippet and read back one global afterwards.
pub fn execute_and_get(source: &str, global: &str) -> Option<Value> {
    let mut vm = Vm::new();
    vm.interpret(source).ok()?;
    vm.get_global(global)
}
